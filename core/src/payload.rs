//! Interpretation of extracted model payloads as food names or estimates.

use serde_json::{Map, Value};

use crate::extract::{CutString, Extraction, RecoveredRecord, extract_payload, recover_error_message, recover_records};
use crate::matching::dedup_names;
use crate::models::{DEFAULT_CONFIDENCE, FoodEstimate, round1};

const LIST_KEYS: &[&str] = &["foods", "aliments", "items", "estimates", "names"];
const NAME_KEYS: &[&str] = &["foodName", "food_name", "name", "aliment"];
const WEIGHT_KEYS: &[&str] = &["estimatedWeightG", "weightG", "weight_g"];
const CARBS_KEYS: &[&str] = &["carbsPer100g", "carbs_per_100g"];
const TOTAL_KEYS: &[&str] = &["totalCarbsG", "total_carbs_g", "totalCarbs"];
const CONFIDENCE_KEYS: &[&str] = &["confidence"];
const REASONING_KEYS: &[&str] = &["reasoning", "rationale"];

/// Shown when a model asks for a retake without saying why.
const RETAKE_MESSAGE: &str = "Photo insuffisante pour l'analyse, merci de reprendre la photo.";

#[derive(Debug, Clone, PartialEq)]
pub enum NamesPayload {
    Names(Vec<String>),
    Declined(String),
    Unreadable,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EstimatesPayload {
    Estimates(Vec<FoodEstimate>),
    Declined(String),
    Unreadable,
}

/// Read the identification pass output: a list of food names.
///
/// Accepts a bare array or an object holding one under a known key. Items
/// may be strings or objects carrying a name. When the payload was cut inside
/// the last item's name, that partial name is dropped.
#[must_use]
pub fn read_food_names(raw: &str) -> NamesPayload {
    let (value, cut) = match extract_payload(raw) {
        Extraction::Parsed(value) => (value, None),
        Extraction::Repaired { value, cut, .. } => (value, cut),
        Extraction::Unrecoverable => {
            return recover_error_message(raw).map_or(NamesPayload::Unreadable, NamesPayload::Declined);
        }
    };

    if let Some(reason) = declined_reason(&value) {
        return NamesPayload::Declined(reason);
    }

    let Some(items) = list_of(&value) else {
        return NamesPayload::Unreadable;
    };

    let names: Vec<String> = complete_items(items, cut.as_ref())
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.clone()),
            Value::Object(map) => string_field(map, NAME_KEYS),
            _ => None,
        })
        .collect();

    NamesPayload::Names(dedup_names(&names))
}

/// Read a quantification or fallback pass output.
///
/// Structured extraction is tried first; if it yields no usable record the
/// raw text goes through per-field recovery. A record whose name was cut off
/// is never kept.
#[must_use]
pub fn read_estimates(raw: &str) -> EstimatesPayload {
    let (value, cut) = match extract_payload(raw) {
        Extraction::Parsed(value) => (Some(value), None),
        Extraction::Repaired { value, cut, .. } => (Some(value), cut),
        Extraction::Unrecoverable => (None, None),
    };
    if let Some(value) = &value {
        if let Some(reason) = declined_reason(value) {
            return EstimatesPayload::Declined(reason);
        }
        let estimates: Vec<FoodEstimate> = records_of(value, cut.as_ref())
            .into_iter()
            .filter_map(estimate_from_object)
            .collect();
        if !estimates.is_empty() {
            return EstimatesPayload::Estimates(estimates);
        }
    }

    let recovered = recover_records(raw);
    if recovered.is_empty() {
        return recover_error_message(raw).map_or(EstimatesPayload::Unreadable, EstimatesPayload::Declined);
    }
    EstimatesPayload::Estimates(recovered.into_iter().map(estimate_from_recovered).collect())
}

fn declined_reason(value: &Value) -> Option<String> {
    let map = value.as_object()?;
    if let Some(message) = map.get("error").and_then(Value::as_str) {
        let message = message.trim();
        if !message.is_empty() {
            return Some(message.to_string());
        }
    }
    (map.get("needsRetake").and_then(Value::as_bool) == Some(true)).then(|| RETAKE_MESSAGE.to_string())
}

fn list_of(value: &Value) -> Option<&Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(map) => LIST_KEYS.iter().find_map(|k| map.get(*k)?.as_array()),
        _ => None,
    }
}

/// Items of a list, minus the last one when its name is the string the
/// payload was cut in.
fn complete_items<'a>(items: &'a [Value], cut: Option<&CutString>) -> &'a [Value] {
    let partial_last = match (cut, items.last()) {
        (Some(cut), Some(last)) => cut.is_name_of(last, NAME_KEYS),
        _ => false,
    };
    let keep = items.len() - usize::from(partial_last);
    &items[..keep]
}

fn records_of<'a>(value: &'a Value, cut: Option<&CutString>) -> Vec<&'a Map<String, Value>> {
    if let Some(items) = list_of(value) {
        return complete_items(items, cut).iter().filter_map(Value::as_object).collect();
    }
    // A lone record, as the fallback pass returns.
    if cut.is_some_and(|cut| cut.is_name_of(value, NAME_KEYS)) {
        return Vec::new();
    }
    value.as_object().into_iter().collect()
}

fn string_field(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| map.get(*k)?.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Numbers arrive as JSON numbers or as strings like "150 g" / "12,5".
fn number_field(map: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| match map.get(*k)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => lenient_number(s),
        _ => None,
    })
}

fn lenient_number(s: &str) -> Option<f64> {
    let cleaned = s.trim().replace(',', ".");
    let end = cleaned
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
        .unwrap_or(cleaned.len());
    cleaned[..end].parse().ok().filter(|n: &f64| n.is_finite())
}

fn estimate_from_object(map: &Map<String, Value>) -> Option<FoodEstimate> {
    let name = string_field(map, NAME_KEYS)?;
    Some(build_estimate(
        name,
        number_field(map, WEIGHT_KEYS),
        number_field(map, CARBS_KEYS),
        number_field(map, TOTAL_KEYS),
        number_field(map, CONFIDENCE_KEYS),
        string_field(map, REASONING_KEYS),
    ))
}

fn estimate_from_recovered(record: RecoveredRecord) -> FoodEstimate {
    build_estimate(
        record.food_name,
        record.weight_g,
        record.carbs_per_100g,
        record.total_carbs_g,
        record.confidence,
        record.reasoning,
    )
}

/// Missing numbers default to zero and confidence to [`DEFAULT_CONFIDENCE`].
/// A model total is only used to back out carbs/100g when that field is
/// missing; otherwise the total is always derived.
fn build_estimate(
    name: String,
    weight_g: Option<f64>,
    carbs_per_100g: Option<f64>,
    total_carbs_g: Option<f64>,
    confidence: Option<f64>,
    reasoning: Option<String>,
) -> FoodEstimate {
    let weight = weight_g.unwrap_or(0.0);
    let carbs = match (carbs_per_100g, total_carbs_g) {
        (Some(c), _) => c,
        (None, Some(total)) if weight > 0.0 => round1(total * 100.0 / weight),
        _ => 0.0,
    };
    FoodEstimate::new(
        name,
        weight,
        carbs,
        confidence.unwrap_or(DEFAULT_CONFIDENCE),
        reasoning.unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(raw: &str) -> Vec<String> {
        match read_food_names(raw) {
            NamesPayload::Names(n) => n,
            other => panic!("expected names, got {other:?}"),
        }
    }

    fn estimates(raw: &str) -> Vec<FoodEstimate> {
        match read_estimates(raw) {
            EstimatesPayload::Estimates(e) => e,
            other => panic!("expected estimates, got {other:?}"),
        }
    }

    #[test]
    fn test_names_from_array_and_object() {
        assert_eq!(names(r#"["riz", "poulet"]"#), vec!["riz", "poulet"]);
        assert_eq!(
            names(r#"{"foods": [{"name": "pain"}, "beurre"]}"#),
            vec!["pain", "beurre"]
        );
        assert_eq!(names(r#"```json\n{"aliments": ["riz", "riz"]}\n```"#), vec!["riz"]);
    }

    #[test]
    fn test_names_drop_partial_last_entry() {
        assert_eq!(names(r#"{"foods": ["riz", "poulet", "haric"#), vec!["riz", "poulet"]);
        // Cut after a complete entry keeps everything
        assert_eq!(names(r#"{"foods": ["riz", "poulet","#), vec!["riz", "poulet"]);
    }

    #[test]
    fn test_names_keep_complete_name_when_other_field_cut() {
        assert_eq!(
            names(r#"[{"name":"riz","note":"bla"#),
            vec!["riz"]
        );
        assert_eq!(
            names(r#"[{"name":"riz"},{"name":"pou"#),
            vec!["riz"]
        );
    }

    #[test]
    fn test_names_declined() {
        assert_eq!(
            read_food_names(r#"{"error": "Aucun aliment visible", "needsRetake": true}"#),
            NamesPayload::Declined("Aucun aliment visible".to_string())
        );
        assert_eq!(
            read_food_names(r#"{"needsRetake": true}"#),
            NamesPayload::Declined(RETAKE_MESSAGE.to_string())
        );
    }

    #[test]
    fn test_names_unreadable() {
        assert_eq!(read_food_names("Je vois du riz."), NamesPayload::Unreadable);
        assert_eq!(read_food_names(r#"{"total": 3}"#), NamesPayload::Unreadable);
    }

    #[test]
    fn test_estimates_complete_payload() {
        let out = estimates(
            r#"{"items":[{"foodName":"riz","estimatedWeightG":150,"carbsPer100g":28,"totalCarbsG":99,"confidence":0.8,"reasoning":"bol"}]}"#,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].food_name, "riz");
        // Model total is ignored when it contradicts weight x carbs
        assert!((out[0].total_carbs_g - 42.0).abs() < f64::EPSILON);
        assert_eq!(out[0].rationale, "bol");
    }

    #[test]
    fn test_estimates_truncated_single_record_defaults() {
        let out = estimates(r#"{"foodName":"pomme","estimatedWeightG":150"#);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].food_name, "pomme");
        assert!((out[0].weight_g - 150.0).abs() < f64::EPSILON);
        assert_eq!(out[0].carbs_per_100g, 0.0);
        assert_eq!(out[0].total_carbs_g, 0.0);
        assert!((out[0].confidence - DEFAULT_CONFIDENCE).abs() < f64::EPSILON);
    }

    #[test]
    fn test_estimates_back_out_carbs_from_total() {
        let out = estimates(r#"[{"foodName":"pain","estimatedWeightG":"50 g","totalCarbsG":"25,5"}]"#);
        assert!((out[0].carbs_per_100g - 51.0).abs() < f64::EPSILON);
        assert!((out[0].total_carbs_g - 25.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_estimates_fall_back_to_field_recovery() {
        let raw = r#"Voici : {"items":[{"foodName":"riz","estimatedWeightG":150,"carbsPer100g":28},{"foodName":"pomme","estim"#;
        let out = estimates(raw);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].food_name, "pomme");
        assert_eq!(out[1].weight_g, 0.0);
    }

    #[test]
    fn test_estimates_drop_record_with_cut_name() {
        let out = estimates(
            r#"{"items":[{"foodName":"riz","estimatedWeightG":150,"carbsPer100g":28},{"foodName":"pom"#,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].food_name, "riz");

        // A cut in another field keeps the record
        let out = estimates(r#"[{"foodName":"riz","estimatedWeightG":150,"reasoning":"bol moy"#);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].food_name, "riz");
        assert_eq!(out[0].rationale, "bol moy");

        assert_eq!(read_estimates(r#"{"foodName":"pom"#), EstimatesPayload::Unreadable);
    }

    #[test]
    fn test_estimates_declined_and_unreadable() {
        assert_eq!(
            read_estimates(r#"{"error":"Photo floue","needsRetake":true}"#),
            EstimatesPayload::Declined("Photo floue".to_string())
        );
        assert_eq!(read_estimates("rien à signaler"), EstimatesPayload::Unreadable);
        assert_eq!(read_estimates(r#"{"items": []}"#), EstimatesPayload::Unreadable);
    }

    #[test]
    fn test_lenient_number() {
        assert_eq!(lenient_number("150 g"), Some(150.0));
        assert_eq!(lenient_number("12,5"), Some(12.5));
        assert_eq!(lenient_number("environ 3"), None);
    }
}
