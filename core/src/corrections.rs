//! Per-user correction bias learned from edits to past estimates.

use serde::Serialize;
use tracing::debug;

use crate::models::{CorrectionSample, FoodEstimate, round1};
use crate::settings::AnalysisSettings;

/// Mean ratios over a user's most recent samples for one food.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CorrectionBias {
    pub weight_ratio: f64,
    pub carbs_ratio: f64,
    pub samples: usize,
}

/// Ratio of a corrected value to the original; 1.0 when nothing changed
/// or the original was zero.
#[must_use]
pub fn correction_ratio(original: f64, corrected: f64) -> f64 {
    if original <= 0.0 || !original.is_finite() || !corrected.is_finite() {
        return 1.0;
    }
    if (corrected - original).abs() < f64::EPSILON {
        return 1.0;
    }
    corrected / original
}

/// Fold up to `window` samples (assumed newest first) into mean ratios.
#[must_use]
pub fn fold_samples(samples: &[CorrectionSample], window: usize) -> Option<CorrectionBias> {
    let recent = &samples[..samples.len().min(window)];
    if recent.is_empty() {
        return None;
    }
    let (w, c) = recent
        .iter()
        .fold((0.0, 0.0), |(w, c), s| (w + s.weight_ratio, c + s.carbs_ratio));
    #[allow(clippy::cast_precision_loss)]
    let n = recent.len() as f64;
    Some(CorrectionBias {
        weight_ratio: w / n,
        carbs_ratio: c / n,
        samples: recent.len(),
    })
}

/// Adjust an estimate by the user's bias.
///
/// A weight bias wins: the weight is scaled and the total recomputed. Only
/// when the weight bias is within tolerance does a carbs bias scale the
/// total directly. Returns whether anything changed.
pub fn apply_bias(estimate: &mut FoodEstimate, bias: &CorrectionBias, settings: &AnalysisSettings) -> bool {
    let tolerance = settings.personalization_tolerance;

    if (bias.weight_ratio - 1.0).abs() > tolerance {
        estimate.weight_g = round1(estimate.weight_g * bias.weight_ratio);
        estimate.recompute_total();
        estimate.annotate(&format!(
            "poids ajusté ×{:.2} selon vos {} corrections",
            bias.weight_ratio, bias.samples
        ));
        debug!(food = %estimate.food_name, ratio = bias.weight_ratio, "weight personalized");
        return true;
    }

    if (bias.carbs_ratio - 1.0).abs() > tolerance {
        estimate.total_carbs_g = round1(estimate.total_carbs_g * bias.carbs_ratio);
        estimate.annotate(&format!(
            "glucides ajustés ×{:.2} selon vos {} corrections",
            bias.carbs_ratio, bias.samples
        ));
        debug!(food = %estimate.food_name, ratio = bias.carbs_ratio, "carbs personalized");
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(weight_ratio: f64, carbs_ratio: f64) -> CorrectionSample {
        CorrectionSample {
            id: 0,
            user_id: 1,
            food_name: "riz".to_string(),
            weight_ratio,
            carbs_ratio,
            created_at: String::new(),
        }
    }

    #[test]
    fn test_correction_ratio() {
        assert!((correction_ratio(100.0, 120.0) - 1.2).abs() < 1e-9);
        assert!((correction_ratio(100.0, 100.0) - 1.0).abs() < f64::EPSILON);
        assert!((correction_ratio(0.0, 50.0) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_fold_is_bounded_to_window() {
        let mut samples = vec![sample(2.0, 1.0); 3];
        samples.extend(vec![sample(100.0, 1.0); 5]);
        let bias = fold_samples(&samples, 3).unwrap();
        assert_eq!(bias.samples, 3);
        assert!((bias.weight_ratio - 2.0).abs() < f64::EPSILON);
        assert!(fold_samples(&[], 10).is_none());
    }

    #[test]
    fn test_no_samples_is_noop() {
        let e = FoodEstimate::new("riz", 150.0, 28.0, 0.8, "bol");
        let mut adjusted = e.clone();
        if let Some(bias) = fold_samples(&[], 10) {
            apply_bias(&mut adjusted, &bias, &AnalysisSettings::default());
        }
        assert_eq!(adjusted, e);
    }

    #[test]
    fn test_weight_bias_takes_precedence() {
        let mut e = FoodEstimate::new("riz", 150.0, 28.0, 0.8, "");
        let bias = fold_samples(&[sample(1.2, 2.0)], 10).unwrap();
        assert!(apply_bias(&mut e, &bias, &AnalysisSettings::default()));
        assert!((e.weight_g - 180.0).abs() < f64::EPSILON);
        assert!((e.total_carbs_g - 50.4).abs() < f64::EPSILON);
        assert!(e.rationale.contains("poids ajusté"));
    }

    #[test]
    fn test_carbs_bias_scales_total_only() {
        let mut e = FoodEstimate::new("riz", 150.0, 28.0, 0.8, "");
        let bias = fold_samples(&[sample(1.02, 1.5), sample(1.0, 1.5)], 10).unwrap();
        assert!(apply_bias(&mut e, &bias, &AnalysisSettings::default()));
        assert!((e.weight_g - 150.0).abs() < f64::EPSILON);
        assert!((e.carbs_per_100g - 28.0).abs() < f64::EPSILON);
        assert!((e.total_carbs_g - 63.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_small_bias_ignored() {
        let mut e = FoodEstimate::new("riz", 150.0, 28.0, 0.8, "");
        let bias = fold_samples(&[sample(1.04, 0.96)], 10).unwrap();
        assert!(!apply_bias(&mut e, &bias, &AnalysisSettings::default()));
        assert!(e.rationale.is_empty());
    }
}
