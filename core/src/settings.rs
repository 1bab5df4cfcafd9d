use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunable knobs of the analysis pipeline.
///
/// Loaded from `settings.json` by the CLI; every field has a default so a
/// partial file (or none) is fine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    /// Cache hits need a Hamming distance strictly below this (out of 256 bits).
    pub cache_max_distance: u32,
    /// Allowed carbs/100g gap against a curated dictionary match.
    pub local_correction_threshold: f64,
    /// Allowed carbs/100g gap against a public lookup result.
    pub public_correction_threshold: f64,
    /// Relative departure from 1.0 before a correction ratio is applied.
    pub personalization_tolerance: f64,
    /// Most recent correction samples folded per food.
    pub correction_window: usize,
    pub provider_timeout_secs: u64,
    pub max_image_edge: u32,
    pub contrast_low_percentile: f64,
    pub contrast_high_percentile: f64,
    pub jpeg_quality: u8,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            cache_max_distance: 20,
            local_correction_threshold: 2.0,
            public_correction_threshold: 5.0,
            personalization_tolerance: 0.05,
            correction_window: 10,
            provider_timeout_secs: 30,
            max_image_edge: 1600,
            contrast_low_percentile: 0.02,
            contrast_high_percentile: 0.98,
            jpeg_quality: 85,
        }
    }
}

impl AnalysisSettings {
    #[must_use]
    pub const fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let s: AnalysisSettings =
            serde_json::from_str(r#"{"cache_max_distance": 12, "provider_timeout_secs": 45}"#).unwrap();
        assert_eq!(s.cache_max_distance, 12);
        assert_eq!(s.provider_timeout(), Duration::from_secs(45));
        assert_eq!(s.correction_window, 10);
        assert!((s.public_correction_threshold - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_json_is_default() {
        let s: AnalysisSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(s, AnalysisSettings::default());
    }
}
