//! The two-pass analysis pipeline.
//!
//! ```text
//! cache lookup ──hit──▶ done
//!      │
//!  prepare images ─▶ identify ──empty──▶ single-item fallback ─▶ done
//!                        │
//!             references ─▶ quantify ─▶ dedup ─▶ reference correction ─▶ personalization ─▶ done
//! ```

use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cache::{CacheHit, find_best_match};
use crate::corrections::{apply_bias, fold_samples};
use crate::error::{AnalysisError, Stage};
use crate::fingerprint::fingerprint_bytes;
use crate::imaging::{EncodedImage, prepare_image};
use crate::matching::{dedup_estimates, names_match, normalize_name};
use crate::models::{FoodEstimate, MealBand, NewCacheEntry, round1, validate_finger_length};
use crate::nutrition::{
    NutritionLookupProvider, ReferenceValue, correct_against_reference, resolve_reference,
};
use crate::payload::{EstimatesPayload, NamesPayload, read_estimates, read_food_names};
use crate::prompts::{fallback_prompt, identify_prompt, quantify_prompt};
use crate::providers::{LlmSettings, VisionProvider};
use crate::settings::AnalysisSettings;
use crate::store::AnalysisStore;

#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    /// Raw image bytes, one entry per photo of the same meal.
    pub images: Vec<Vec<u8>>,
    pub finger_length_mm: f64,
    pub user_context: Option<String>,
    pub user_id: Option<i64>,
    pub taken_at: NaiveDateTime,
    /// Return a near-duplicate prior analysis instead of calling the model.
    pub reuse_cached: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalysisPath {
    Cached { distance: u32 },
    TwoPass,
    SingleItemFallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub analysis_id: String,
    pub estimates: Vec<FoodEstimate>,
    pub total_carbs_g: f64,
    pub path: AnalysisPath,
    pub meal: MealBand,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl AnalysisReport {
    fn new(
        estimates: Vec<FoodEstimate>,
        path: AnalysisPath,
        meal: MealBand,
        fingerprint: Option<String>,
    ) -> Self {
        let total_carbs_g = round1(estimates.iter().map(|e| e.total_carbs_g).sum());
        Self {
            analysis_id: Uuid::new_v4().to_string(),
            estimates,
            total_carbs_g,
            path,
            meal,
            fingerprint,
        }
    }
}

/// Runs one analysis against borrowed collaborators. Cheap to build per call.
pub struct Analyzer<'a> {
    pub store: &'a dyn AnalysisStore,
    pub provider: &'a dyn VisionProvider,
    pub lookup: Option<&'a dyn NutritionLookupProvider>,
    pub llm: &'a LlmSettings,
    pub settings: &'a AnalysisSettings,
}

impl Analyzer<'_> {
    #[instrument(skip_all, fields(images = request.images.len(), user = ?request.user_id, provider = %self.llm.provider))]
    pub async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisReport, AnalysisError> {
        if request.images.is_empty() {
            return Err(AnalysisError::NoImages);
        }
        validate_finger_length(request.finger_length_mm)
            .map_err(|e| AnalysisError::InvalidInput(e.to_string()))?;
        let meal = MealBand::at(request.taken_at);

        let fingerprint = match request.user_id {
            Some(_) => Some(fingerprint_bytes(&request.images[0]).map_err(|e| {
                AnalysisError::InvalidImage {
                    index: 0,
                    reason: format!("{e:#}"),
                }
            })?),
            None => None,
        };

        if let (true, Some(user_id), Some(fp)) = (request.reuse_cached, request.user_id, &fingerprint) {
            if let Some(hit) = cached_match(self.store, self.settings, user_id, fp) {
                info!(distance = hit.distance, entry = hit.entry.id, "reusing cached analysis");
                return Ok(AnalysisReport::new(
                    hit.entry.estimates,
                    AnalysisPath::Cached {
                        distance: hit.distance,
                    },
                    meal,
                    fingerprint,
                ));
            }
            debug!("no cached analysis close enough");
        }

        let images = request
            .images
            .iter()
            .enumerate()
            .map(|(index, bytes)| {
                prepare_image(bytes, self.settings).map_err(|e| AnalysisError::InvalidImage {
                    index,
                    reason: format!("{e:#}"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if !self.llm.provider.accepts_images() {
            warn!("provider is text-only, photos will not be sent");
        }
        let context = request.user_context.as_deref();

        let raw = self
            .call(Stage::Identify, &images, &identify_prompt(images.len(), meal, context))
            .await?;
        let names = match read_food_names(&raw) {
            NamesPayload::Names(names) if !names.is_empty() => names,
            NamesPayload::Declined(reason) => return Err(AnalysisError::ModelDeclined(reason)),
            NamesPayload::Names(_) | NamesPayload::Unreadable => {
                info!("identification yielded nothing usable, falling back to single item");
                let estimate = self.single_item(&images, request).await?;
                let report = AnalysisReport::new(vec![estimate], AnalysisPath::SingleItemFallback, meal, fingerprint);
                self.remember(request, &report);
                return Ok(report);
            }
        };
        info!(count = names.len(), foods = ?names, "foods identified");

        let mut references: Vec<(String, ReferenceValue)> = Vec::new();
        for name in &names {
            if let Some(reference) = resolve_reference(self.store, self.lookup, name).await {
                references.push((name.clone(), reference));
            }
        }

        let prompt = quantify_prompt(&names, &references, request.finger_length_mm, meal, context);
        let raw = self.call(Stage::Quantify, &images, &prompt).await?;
        let estimates = match read_estimates(&raw) {
            EstimatesPayload::Estimates(estimates) => estimates,
            EstimatesPayload::Declined(reason) => return Err(AnalysisError::ModelDeclined(reason)),
            EstimatesPayload::Unreadable => return Err(AnalysisError::malformed(Stage::Quantify, &raw)),
        };

        let mut estimates = dedup_estimates(estimates, names.len());
        for estimate in &mut estimates {
            let known = references
                .iter()
                .find(|(name, r)| names_match(name, &estimate.food_name) || names_match(&r.name, &estimate.food_name))
                .map(|(_, r)| r.clone());
            let reference = match known {
                Some(r) => Some(r),
                None => resolve_reference(self.store, self.lookup, &estimate.food_name).await,
            };
            if let Some(reference) = reference {
                correct_against_reference(estimate, &reference, self.settings);
            }
        }

        if let Some(user_id) = request.user_id {
            self.personalize(user_id, &mut estimates);
        }

        let report = AnalysisReport::new(estimates, AnalysisPath::TwoPass, meal, fingerprint);
        self.remember(request, &report);
        Ok(report)
    }

    fn remember(&self, request: &AnalysisRequest, report: &AnalysisReport) {
        let (Some(user_id), Some(fingerprint)) = (request.user_id, &report.fingerprint) else {
            return;
        };
        let entry = NewCacheEntry {
            user_id,
            fingerprint: fingerprint.clone(),
            estimates: report.estimates.clone(),
            context: request.user_context.clone(),
        };
        if let Err(e) = self.store.insert_cache_entry(&entry) {
            warn!(error = %e, "cache write failed");
        }
    }

    fn personalize(&self, user_id: i64, estimates: &mut [FoodEstimate]) {
        for estimate in estimates {
            let key = normalize_name(&estimate.food_name);
            let samples = match self
                .store
                .recent_corrections(user_id, &key, self.settings.correction_window)
            {
                Ok(samples) => samples,
                Err(e) => {
                    warn!(food = %key, error = %e, "correction history unavailable");
                    continue;
                }
            };
            if let Some(bias) = fold_samples(&samples, self.settings.correction_window) {
                apply_bias(estimate, &bias, self.settings);
            }
        }
    }

    async fn single_item(
        &self,
        images: &[EncodedImage],
        request: &AnalysisRequest,
    ) -> Result<FoodEstimate, AnalysisError> {
        let prompt = fallback_prompt(request.finger_length_mm, request.user_context.as_deref());
        let raw = self.call(Stage::Fallback, images, &prompt).await?;
        match read_estimates(&raw) {
            EstimatesPayload::Estimates(estimates) => estimates
                .into_iter()
                .next()
                .ok_or_else(|| AnalysisError::malformed(Stage::Fallback, &raw)),
            EstimatesPayload::Declined(reason) => Err(AnalysisError::ModelDeclined(reason)),
            EstimatesPayload::Unreadable => Err(AnalysisError::malformed(Stage::Fallback, &raw)),
        }
    }

    async fn call(&self, stage: Stage, images: &[EncodedImage], prompt: &str) -> Result<String, AnalysisError> {
        let timeout = self.settings.provider_timeout();
        debug!(%stage, "calling provider");
        match tokio::time::timeout(timeout, self.provider.call(self.llm, images, prompt)).await {
            Ok(Ok(raw)) => {
                debug!(%stage, chars = raw.len(), "provider answered");
                Ok(raw)
            }
            Ok(Err(e)) => {
                warn!(%stage, error = %e, "provider call failed");
                Err(e.into())
            }
            Err(_) => {
                warn!(%stage, secs = timeout.as_secs(), "provider call timed out");
                Err(AnalysisError::Timeout {
                    stage,
                    secs: timeout.as_secs(),
                })
            }
        }
    }
}

/// Closest prior analysis for this user's photo, if one is near enough.
pub fn find_cached(
    store: &dyn AnalysisStore,
    settings: &AnalysisSettings,
    image: &[u8],
    user_id: i64,
) -> Result<Option<CacheHit>, AnalysisError> {
    let fp = fingerprint_bytes(image).map_err(|e| AnalysisError::InvalidImage {
        index: 0,
        reason: format!("{e:#}"),
    })?;
    Ok(cached_match(store, settings, user_id, &fp))
}

fn cached_match(
    store: &dyn AnalysisStore,
    settings: &AnalysisSettings,
    user_id: i64,
    fingerprint: &str,
) -> Option<CacheHit> {
    match store.cache_entries(user_id) {
        Ok(entries) => find_best_match(entries, fingerprint, settings.cache_max_distance),
        Err(e) => {
            warn!(error = %e, "cache read failed");
            None
        }
    }
}
