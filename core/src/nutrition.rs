//! Nutrition references: resolve a food name to an authoritative carbs/100g
//! and reconcile model estimates against it.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::models::{FoodEstimate, NewNutritionRecord, NutritionRecord, Provenance, round1};
use crate::settings::AnalysisSettings;
use crate::store::AnalysisStore;

/// Dictionary matches considered per name.
pub const LOCAL_MATCH_LIMIT: usize = 5;

/// Public nutrition database lookup.
///
/// The CLI implements this with reqwest against OpenFoodFacts.
#[async_trait]
pub trait NutritionLookupProvider: Send + Sync {
    /// Best matching product carrying a carbohydrate value, if any.
    async fn search_public(&self, query: &str) -> Result<Option<NewNutritionRecord>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceOrigin {
    /// Found in the local dictionary.
    Local,
    /// Fetched from the public database during this lookup.
    Public,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceValue {
    pub name: String,
    pub carbs_per_100g: f64,
    pub provenance: Provenance,
    pub origin: ReferenceOrigin,
}

impl ReferenceValue {
    fn from_record(record: NutritionRecord, origin: ReferenceOrigin) -> Self {
        Self {
            name: record.name,
            carbs_per_100g: record.carbs_per_100g,
            provenance: record.provenance,
            origin,
        }
    }

    /// Short French label naming where the value comes from.
    #[must_use]
    pub fn source_label(&self) -> String {
        let source = match (self.origin, self.provenance) {
            (ReferenceOrigin::Public, _) | (_, Provenance::PublicLookup) => "OpenFoodFacts",
            (_, Provenance::Curated) => "base locale",
            (_, Provenance::Manual) => "saisie manuelle",
        };
        format!("{source} : {}", self.name)
    }

    #[must_use]
    pub fn threshold(&self, settings: &AnalysisSettings) -> f64 {
        match self.origin {
            ReferenceOrigin::Local => settings.local_correction_threshold,
            ReferenceOrigin::Public => settings.public_correction_threshold,
        }
    }
}

/// Resolve a reference for `food_name`: local dictionary first, then the
/// public lookup (persisting its result). Every failure is logged and
/// treated as "unknown".
pub async fn resolve_reference(
    store: &dyn AnalysisStore,
    lookup: Option<&dyn NutritionLookupProvider>,
    food_name: &str,
) -> Option<ReferenceValue> {
    match store.search_nutrition(food_name, LOCAL_MATCH_LIMIT) {
        Ok(matches) => {
            if let Some(best) = matches.into_iter().next() {
                debug!(food = food_name, reference = %best.name, "local nutrition match");
                return Some(ReferenceValue::from_record(best, ReferenceOrigin::Local));
            }
        }
        Err(e) => warn!(food = food_name, error = %e, "local nutrition search failed"),
    }

    let lookup = lookup?;
    let found = match lookup.search_public(food_name).await {
        Ok(Some(found)) => found,
        Ok(None) => {
            debug!(food = food_name, "no public nutrition match");
            return None;
        }
        Err(e) => {
            warn!(food = food_name, error = %e, "public nutrition lookup failed");
            return None;
        }
    };

    match store.insert_nutrition(&found) {
        Ok(record) => Some(ReferenceValue::from_record(record, ReferenceOrigin::Public)),
        Err(e) => {
            warn!(food = food_name, error = %e, "failed to persist public nutrition match");
            Some(ReferenceValue {
                name: found.name,
                carbs_per_100g: found.carbs_per_100g,
                provenance: found.provenance,
                origin: ReferenceOrigin::Public,
            })
        }
    }
}

/// Replace carbs/100g (and the total) when the estimate strays from the
/// reference by more than its threshold. Returns whether it did.
///
/// The food name and confidence are never touched.
pub fn correct_against_reference(
    estimate: &mut FoodEstimate,
    reference: &ReferenceValue,
    settings: &AnalysisSettings,
) -> bool {
    let gap = (estimate.carbs_per_100g - reference.carbs_per_100g).abs();
    if gap <= reference.threshold(settings) {
        return false;
    }

    let before = estimate.carbs_per_100g;
    estimate.carbs_per_100g = reference.carbs_per_100g;
    estimate.recompute_total();
    estimate.annotate(&format!(
        "glucides/100g corrigés de {} à {} ({})",
        round1(before),
        round1(reference.carbs_per_100g),
        reference.source_label()
    ));
    debug!(
        food = %estimate.food_name,
        from = before,
        to = reference.carbs_per_100g,
        "estimate corrected against reference"
    );
    true
}
