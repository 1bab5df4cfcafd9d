use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

/// Confidence assumed when the model omits one.
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Round to one decimal place, the precision every carbohydrate figure is reported at.
#[must_use]
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Carbohydrates for `weight_g` grams of a food with `carbs_per_100g`.
#[must_use]
pub fn carbs_for_weight(weight_g: f64, carbs_per_100g: f64) -> f64 {
    round1(weight_g * carbs_per_100g / 100.0)
}

/// One food identified on the plate, with its provisional quantities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoodEstimate {
    pub food_name: String,
    pub weight_g: f64,
    pub carbs_per_100g: f64,
    pub total_carbs_g: f64,
    pub confidence: f64,
    #[serde(default)]
    pub rationale: String,
}

impl FoodEstimate {
    /// Build an estimate whose total is derived from weight and carbs/100g.
    #[must_use]
    pub fn new(
        food_name: impl Into<String>,
        weight_g: f64,
        carbs_per_100g: f64,
        confidence: f64,
        rationale: impl Into<String>,
    ) -> Self {
        let weight_g = weight_g.max(0.0);
        let carbs_per_100g = carbs_per_100g.max(0.0);
        Self {
            food_name: food_name.into(),
            weight_g,
            carbs_per_100g,
            total_carbs_g: carbs_for_weight(weight_g, carbs_per_100g),
            confidence: confidence.clamp(0.0, 1.0),
            rationale: rationale.into(),
        }
    }

    pub fn recompute_total(&mut self) {
        self.total_carbs_g = carbs_for_weight(self.weight_g, self.carbs_per_100g);
    }

    /// Append a bracketed note to the rationale.
    pub fn annotate(&mut self, note: &str) {
        if self.rationale.trim().is_empty() {
            self.rationale = format!("[{note}]");
        } else {
            self.rationale = format!("{} [{note}]", self.rationale.trim_end());
        }
    }
}

/// Where a nutrition record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Curated,
    PublicLookup,
    Manual,
}

impl Provenance {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Curated => "curated",
            Self::PublicLookup => "public_lookup",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provenance {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "curated" | "local" => Ok(Self::Curated),
            "public_lookup" | "openfoodfacts" | "public" => Ok(Self::PublicLookup),
            "manual" => Ok(Self::Manual),
            other => bail!("Invalid provenance '{other}'. Must be one of: curated, public_lookup, manual"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NutritionRecord {
    pub id: i64,
    pub name: String,
    pub normalized_name: String,
    pub carbs_per_100g: f64,
    pub provenance: Provenance,
    pub category: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewNutritionRecord {
    pub name: String,
    pub carbs_per_100g: f64,
    pub provenance: Provenance,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateNutritionRecord {
    pub carbs_per_100g: Option<f64>,
    pub category: Option<Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NutritionStats {
    pub total: i64,
    pub curated: i64,
    pub public_lookup: i64,
    pub manual: i64,
}

/// Divergence between a user's edit and the model's original figure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionSample {
    pub id: i64,
    pub user_id: i64,
    pub food_name: String,
    pub weight_ratio: f64,
    pub carbs_ratio: f64,
    pub created_at: String,
}

/// A prior analysis, keyed by the perceptual fingerprint of its first photo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: i64,
    pub user_id: i64,
    pub fingerprint: String,
    pub estimates: Vec<FoodEstimate>,
    pub captured_at: String,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewCacheEntry {
    pub user_id: i64,
    pub fingerprint: String,
    pub estimates: Vec<FoodEstimate>,
    pub context: Option<String>,
}

/// A stored estimate the user may later correct.
#[derive(Debug, Clone, Serialize)]
pub struct LoggedEstimate {
    pub id: i64,
    pub user_id: i64,
    pub analysis_id: String,
    pub food_name: String,
    pub weight_g: f64,
    pub carbs_per_100g: f64,
    pub total_carbs_g: f64,
    pub confidence: f64,
    pub rationale: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corrected_weight_g: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corrected_carbs_g: Option<f64>,
    pub created_at: String,
    pub updated_at: String,
}

impl LoggedEstimate {
    /// Carbs the user should dose for: the correction if any, otherwise the estimate.
    #[must_use]
    pub fn effective_carbs_g(&self) -> f64 {
        self.corrected_carbs_g.unwrap_or(self.total_carbs_g)
    }
}

/// Time-of-day band used as prompt context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MealBand {
    Breakfast,
    Lunch,
    Snack,
    Dinner,
    LateNight,
}

impl MealBand {
    #[must_use]
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            5..=10 => Self::Breakfast,
            11..=14 => Self::Lunch,
            15..=17 => Self::Snack,
            18..=21 => Self::Dinner,
            _ => Self::LateNight,
        }
    }

    #[must_use]
    pub fn at(time: NaiveDateTime) -> Self {
        Self::from_hour(time.hour())
    }

    /// French label, as it appears in prompts.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Breakfast => "petit-déjeuner",
            Self::Lunch => "déjeuner",
            Self::Snack => "goûter / collation",
            Self::Dinner => "dîner",
            Self::LateNight => "collation de nuit",
        }
    }
}

pub fn validate_nutrition_record(record: &NewNutritionRecord) -> Result<()> {
    if record.name.trim().is_empty() {
        bail!("Food name must not be empty");
    }
    validate_carbs_per_100g(record.carbs_per_100g)
}

pub fn validate_carbs_per_100g(carbs: f64) -> Result<()> {
    if !carbs.is_finite() || !(0.0..=100.0).contains(&carbs) {
        bail!("carbs_per_100g must be between 0 and 100 (got {carbs})");
    }
    Ok(())
}

pub fn validate_ratio(name: &str, ratio: f64) -> Result<()> {
    if !ratio.is_finite() || ratio <= 0.0 {
        bail!("{name} must be a positive number (got {ratio})");
    }
    Ok(())
}

pub fn validate_finger_length(mm: f64) -> Result<()> {
    if !mm.is_finite() || !(20.0..=150.0).contains(&mm) {
        bail!("Finger length must be between 20 and 150 mm (got {mm})");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_estimate_total_is_derived() {
        let e = FoodEstimate::new("riz", 150.0, 28.0, 0.8, "");
        assert!((e.total_carbs_g - 42.0).abs() < f64::EPSILON);

        let e = FoodEstimate::new("pomme", 123.0, 11.7, 0.8, "");
        // 14.391 rounds to 14.4
        assert!((e.total_carbs_g - 14.4).abs() < f64::EPSILON);
    }

    #[test]
    fn test_estimate_clamps_confidence_and_negatives() {
        let e = FoodEstimate::new("x", -10.0, -3.0, 1.7, "");
        assert_eq!(e.weight_g, 0.0);
        assert_eq!(e.carbs_per_100g, 0.0);
        assert_eq!(e.confidence, 1.0);
    }

    #[test]
    fn test_annotate_appends() {
        let mut e = FoodEstimate::new("riz", 100.0, 28.0, 0.8, "");
        e.annotate("note one");
        assert_eq!(e.rationale, "[note one]");
        e.annotate("note two");
        assert_eq!(e.rationale, "[note one] [note two]");
    }

    #[test]
    fn test_meal_band_boundaries() {
        assert_eq!(MealBand::from_hour(4), MealBand::LateNight);
        assert_eq!(MealBand::from_hour(5), MealBand::Breakfast);
        assert_eq!(MealBand::from_hour(10), MealBand::Breakfast);
        assert_eq!(MealBand::from_hour(12), MealBand::Lunch);
        assert_eq!(MealBand::from_hour(16), MealBand::Snack);
        assert_eq!(MealBand::from_hour(19), MealBand::Dinner);
        assert_eq!(MealBand::from_hour(23), MealBand::LateNight);

        let t = NaiveDate::from_ymd_opt(2024, 6, 15)
            .unwrap()
            .and_hms_opt(12, 30, 0)
            .unwrap();
        assert_eq!(MealBand::at(t), MealBand::Lunch);
    }

    #[test]
    fn test_provenance_parse() {
        assert_eq!("curated".parse::<Provenance>().unwrap(), Provenance::Curated);
        assert_eq!(
            "openfoodfacts".parse::<Provenance>().unwrap(),
            Provenance::PublicLookup
        );
        assert_eq!("Manual".parse::<Provenance>().unwrap(), Provenance::Manual);
        assert!("anses".parse::<Provenance>().is_err());
    }

    #[test]
    fn test_validate_nutrition_record() {
        let mut r = NewNutritionRecord {
            name: "pâtes".to_string(),
            carbs_per_100g: 25.0,
            provenance: Provenance::Manual,
            category: None,
        };
        assert!(validate_nutrition_record(&r).is_ok());

        r.carbs_per_100g = 120.0;
        assert!(validate_nutrition_record(&r).is_err());

        r.carbs_per_100g = 25.0;
        r.name = "  ".to_string();
        assert!(validate_nutrition_record(&r).is_err());
    }

    #[test]
    fn test_validate_ratio() {
        assert!(validate_ratio("weight_ratio", 1.2).is_ok());
        assert!(validate_ratio("weight_ratio", 0.0).is_err());
        assert!(validate_ratio("weight_ratio", f64::NAN).is_err());
    }

    #[test]
    fn test_effective_carbs_prefers_correction() {
        let mut logged = LoggedEstimate {
            id: 1,
            user_id: 1,
            analysis_id: "a".to_string(),
            food_name: "riz".to_string(),
            weight_g: 100.0,
            carbs_per_100g: 28.0,
            total_carbs_g: 28.0,
            confidence: 0.8,
            rationale: String::new(),
            corrected_weight_g: None,
            corrected_carbs_g: None,
            created_at: String::new(),
            updated_at: String::new(),
        };
        assert!((logged.effective_carbs_g() - 28.0).abs() < f64::EPSILON);
        logged.corrected_carbs_g = Some(35.0);
        assert!((logged.effective_carbs_g() - 35.0).abs() < f64::EPSILON);
    }
}
