use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Result, bail};

use crate::cache::CacheHit;
use crate::corrections::correction_ratio;
use crate::db::Database;
use crate::error::AnalysisError;
use crate::models::{
    CorrectionSample, FoodEstimate, LoggedEstimate, NewNutritionRecord, NutritionRecord,
    NutritionStats, UpdateNutritionRecord, carbs_for_weight, validate_carbs_per_100g,
    validate_nutrition_record, validate_ratio,
};
use crate::nutrition::{NutritionLookupProvider, ReferenceValue, resolve_reference};
use crate::pipeline::{self, AnalysisReport, AnalysisRequest, Analyzer};
use crate::providers::{LlmSettings, VisionProvider};
use crate::settings::AnalysisSettings;

/// Entry point for every front end (CLI commands, HTTP server).
///
/// The database sits behind a mutex that is only ever held for a single
/// synchronous operation, so one service can be shared across concurrent
/// analyses.
pub struct GluciService {
    db: Mutex<Database>,
    settings: AnalysisSettings,
}

impl GluciService {
    pub fn new(db_path: &Path, settings: AnalysisSettings) -> Result<Self> {
        let db = Database::open(db_path)?;
        Ok(Self {
            db: Mutex::new(db),
            settings,
        })
    }

    pub fn new_in_memory() -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self {
            db: Mutex::new(db),
            settings: AnalysisSettings::default(),
        })
    }

    #[must_use]
    pub fn with_settings(mut self, settings: AnalysisSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn settings(&self) -> &AnalysisSettings {
        &self.settings
    }

    fn db(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Analysis ---

    pub async fn analyze(
        &self,
        provider: &dyn VisionProvider,
        lookup: Option<&dyn NutritionLookupProvider>,
        llm: &LlmSettings,
        request: &AnalysisRequest,
    ) -> Result<AnalysisReport, AnalysisError> {
        Analyzer {
            store: &self.db,
            provider,
            lookup,
            llm,
            settings: &self.settings,
        }
        .analyze(request)
        .await
    }

    pub fn find_cached_analysis(&self, image: &[u8], user_id: i64) -> Result<Option<CacheHit>, AnalysisError> {
        pipeline::find_cached(&self.db, &self.settings, image, user_id)
    }

    // --- Corrections ---

    pub fn record_correction(
        &self,
        user_id: i64,
        food_name: &str,
        weight_ratio: f64,
        carbs_ratio: f64,
    ) -> Result<CorrectionSample> {
        if food_name.trim().is_empty() {
            bail!("Food name must not be empty");
        }
        validate_ratio("weight_ratio", weight_ratio)?;
        validate_ratio("carbs_ratio", carbs_ratio)?;
        self.db()
            .insert_correction(user_id, food_name, weight_ratio, carbs_ratio)
    }

    pub fn list_corrections(&self, user_id: i64) -> Result<Vec<CorrectionSample>> {
        self.db().list_corrections(user_id)
    }

    // --- Logged estimates ---

    pub fn log_estimates(
        &self,
        user_id: i64,
        analysis_id: &str,
        estimates: &[FoodEstimate],
    ) -> Result<Vec<LoggedEstimate>> {
        let db = self.db();
        estimates
            .iter()
            .map(|e| db.insert_logged_estimate(user_id, analysis_id, e))
            .collect()
    }

    pub fn list_logged_estimates(&self, user_id: i64, limit: usize) -> Result<Vec<LoggedEstimate>> {
        self.db().list_logged_estimates(user_id, limit)
    }

    pub fn get_logged_estimate(&self, id: i64) -> Result<LoggedEstimate> {
        self.db().get_logged_estimate(id)
    }

    /// Record the user's own figures for a logged estimate and append the
    /// matching correction sample. A field left out counts as unchanged.
    pub fn correct_estimate(
        &self,
        id: i64,
        corrected_weight_g: Option<f64>,
        corrected_carbs_g: Option<f64>,
    ) -> Result<LoggedEstimate> {
        if corrected_weight_g.is_none() && corrected_carbs_g.is_none() {
            bail!("Provide a corrected weight, corrected carbs, or both");
        }
        for value in [corrected_weight_g, corrected_carbs_g].into_iter().flatten() {
            if !value.is_finite() || value < 0.0 {
                bail!("Corrected values must be non-negative numbers (got {value})");
            }
        }

        let db = self.db();
        let logged = db.get_logged_estimate(id)?;

        let weight = corrected_weight_g.unwrap_or(logged.weight_g);
        let carbs = corrected_carbs_g
            .unwrap_or_else(|| carbs_for_weight(weight, logged.carbs_per_100g));
        let weight_ratio = corrected_weight_g.map_or(1.0, |w| correction_ratio(logged.weight_g, w));
        let carbs_ratio =
            corrected_carbs_g.map_or(1.0, |c| correction_ratio(logged.total_carbs_g, c));

        let updated = db.set_logged_correction(id, weight, carbs)?;
        db.insert_correction(logged.user_id, &logged.food_name, weight_ratio, carbs_ratio)?;
        Ok(updated)
    }

    // --- Nutrition dictionary ---

    pub fn add_nutrition_record(&self, record: &NewNutritionRecord) -> Result<NutritionRecord> {
        validate_nutrition_record(record)?;
        let db = self.db();
        if let Some(existing) = db.find_nutrition_by_name(&record.name)? {
            bail!(
                "'{}' already exists (id {}); use update to change it",
                existing.name,
                existing.id
            );
        }
        db.insert_nutrition(record)
    }

    pub fn update_nutrition_record(
        &self,
        id: i64,
        update: &UpdateNutritionRecord,
    ) -> Result<NutritionRecord> {
        if let Some(carbs) = update.carbs_per_100g {
            validate_carbs_per_100g(carbs)?;
        }
        self.db().update_nutrition(id, update)
    }

    pub fn get_nutrition_record(&self, id: i64) -> Result<NutritionRecord> {
        self.db().get_nutrition(id)
    }

    pub fn find_nutrition_by_name(&self, name: &str) -> Result<Option<NutritionRecord>> {
        self.db().find_nutrition_by_name(name)
    }

    pub fn search_nutrition(&self, query: &str, limit: usize) -> Result<Vec<NutritionRecord>> {
        self.db().search_nutrition(query, limit)
    }

    pub fn list_nutrition(&self, search: Option<&str>, limit: usize) -> Result<Vec<NutritionRecord>> {
        self.db().list_nutrition(search, limit)
    }

    pub fn nutrition_stats(&self) -> Result<NutritionStats> {
        self.db().nutrition_stats()
    }

    /// Local dictionary, then the public lookup. Failures come back as `None`.
    pub async fn lookup_reference(
        &self,
        lookup: Option<&dyn NutritionLookupProvider>,
        food_name: &str,
    ) -> Option<ReferenceValue> {
        resolve_reference(&self.db, lookup, food_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Provenance;
    use crate::nutrition::ReferenceOrigin;
    use async_trait::async_trait;

    struct MockLookup {
        record: Option<NewNutritionRecord>,
    }

    #[async_trait]
    impl NutritionLookupProvider for MockLookup {
        async fn search_public(&self, _query: &str) -> Result<Option<NewNutritionRecord>> {
            Ok(self.record.clone())
        }
    }

    fn sample_record(name: &str, carbs: f64) -> NewNutritionRecord {
        NewNutritionRecord {
            name: name.to_string(),
            carbs_per_100g: carbs,
            provenance: Provenance::Manual,
            category: None,
        }
    }

    #[test]
    fn test_record_correction_validates() {
        let svc = GluciService::new_in_memory().unwrap();
        let sample = svc.record_correction(1, "Riz", 1.2, 0.9).unwrap();
        assert_eq!(sample.food_name, "riz");

        assert!(svc.record_correction(1, "riz", 0.0, 1.0).is_err());
        assert!(svc.record_correction(1, "riz", 1.0, f64::INFINITY).is_err());
        assert!(svc.record_correction(1, "  ", 1.0, 1.0).is_err());
        assert_eq!(svc.list_corrections(1).unwrap().len(), 1);
    }

    #[test]
    fn test_correct_estimate_records_ratios() {
        let svc = GluciService::new_in_memory().unwrap();
        let logged = svc
            .log_estimates(5, "a1", &[FoodEstimate::new("Pâtes", 200.0, 30.0, 0.7, "")])
            .unwrap();
        assert_eq!(logged.len(), 1);

        let updated = svc.correct_estimate(logged[0].id, Some(250.0), None).unwrap();
        assert_eq!(updated.corrected_weight_g, Some(250.0));
        // Carbs follow the corrected weight when not given
        assert_eq!(updated.corrected_carbs_g, Some(75.0));

        let samples = svc.list_corrections(5).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].food_name, "pates");
        assert!((samples[0].weight_ratio - 1.25).abs() < f64::EPSILON);
        assert!((samples[0].carbs_ratio - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_correct_estimate_carbs_only() {
        let svc = GluciService::new_in_memory().unwrap();
        let logged = svc
            .log_estimates(5, "a1", &[FoodEstimate::new("riz", 100.0, 28.0, 0.7, "")])
            .unwrap();
        let updated = svc.correct_estimate(logged[0].id, None, Some(42.0)).unwrap();
        assert_eq!(updated.corrected_weight_g, Some(100.0));
        let sample = &svc.list_corrections(5).unwrap()[0];
        assert!((sample.weight_ratio - 1.0).abs() < f64::EPSILON);
        assert!((sample.carbs_ratio - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_correct_estimate_rejects_bad_input() {
        let svc = GluciService::new_in_memory().unwrap();
        let logged = svc
            .log_estimates(5, "a1", &[FoodEstimate::new("riz", 100.0, 28.0, 0.7, "")])
            .unwrap();
        assert!(svc.correct_estimate(logged[0].id, None, None).is_err());
        assert!(svc.correct_estimate(logged[0].id, Some(-3.0), None).is_err());
        assert!(svc.correct_estimate(999, Some(3.0), None).is_err());
        assert!(svc.list_corrections(5).unwrap().is_empty());
    }

    #[test]
    fn test_zero_original_gives_neutral_ratio() {
        let svc = GluciService::new_in_memory().unwrap();
        let logged = svc
            .log_estimates(5, "a1", &[FoodEstimate::new("eau", 0.0, 0.0, 0.7, "")])
            .unwrap();
        svc.correct_estimate(logged[0].id, Some(250.0), Some(0.0)).unwrap();
        let sample = &svc.list_corrections(5).unwrap()[0];
        assert!((sample.weight_ratio - 1.0).abs() < f64::EPSILON);
        assert!((sample.carbs_ratio - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_add_nutrition_record_rejects_duplicates() {
        let svc = GluciService::new_in_memory().unwrap();
        svc.add_nutrition_record(&sample_record("Pain complet", 41.0)).unwrap();
        let err = svc
            .add_nutrition_record(&sample_record("pain  complet", 45.0))
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert!(svc.add_nutrition_record(&sample_record("Sucre", 120.0)).is_err());
    }

    #[test]
    fn test_update_nutrition_record_validates() {
        let svc = GluciService::new_in_memory().unwrap();
        let rec = svc.add_nutrition_record(&sample_record("Pain", 50.0)).unwrap();
        let update = UpdateNutritionRecord {
            carbs_per_100g: Some(-1.0),
            category: None,
        };
        assert!(svc.update_nutrition_record(rec.id, &update).is_err());
        assert!((svc.get_nutrition_record(rec.id).unwrap().carbs_per_100g - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_lookup_reference_persists_public_match() {
        let svc = GluciService::new_in_memory().unwrap();
        let lookup = MockLookup {
            record: Some(NewNutritionRecord {
                provenance: Provenance::PublicLookup,
                ..sample_record("Compote pomme", 14.0)
            }),
        };

        let found = svc.lookup_reference(Some(&lookup), "compote").await.unwrap();
        assert_eq!(found.origin, ReferenceOrigin::Public);

        let stats = svc.nutrition_stats().unwrap();
        assert_eq!(stats.public_lookup, 1);
        assert_eq!(svc.search_nutrition("compote", 5).unwrap().len(), 1);
    }
}
