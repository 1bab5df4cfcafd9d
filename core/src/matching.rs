//! Food name canonicalization and fuzzy matching.
//!
//! Names coming back from the model are free text ("Pâtes à la bolognaise",
//! "pates bolognaise") so every comparison goes through [`normalize_name`]:
//! - Unicode NFD decomposition with combining marks removed
//! - lowercase
//! - punctuation replaced by spaces
//! - whitespace collapsed

use std::cmp::Ordering;
use std::collections::HashSet;

use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

use crate::models::{FoodEstimate, NutritionRecord};

/// Short words that carry no meaning for dictionary ranking.
const STOP_WORDS: &[&str] = &[
    "les", "des", "aux", "avec", "sans", "une", "pour", "sur", "the", "and", "with",
];

/// Canonical form of a food name.
///
/// ```
/// use glucimiam_core::matching::normalize_name;
///
/// assert_eq!(normalize_name("Pâtes  Carbonara!"), "pates carbonara");
/// assert_eq!(normalize_name("Crème-brûlée"), "creme brulee");
/// ```
#[must_use]
pub fn normalize_name(name: &str) -> String {
    let stripped: String = name
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Equal after normalization, or one contains the other.
#[must_use]
pub fn names_match(a: &str, b: &str) -> bool {
    normalized_match(&normalize_name(a), &normalize_name(b))
}

fn normalized_match(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a == b || a.contains(b) || b.contains(a)
}

/// Keyword tokens used to rank dictionary entries against a query.
#[must_use]
pub fn keyword_tokens(name: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    normalize_name(name)
        .split_whitespace()
        .filter(|t| t.chars().count() > 2 && !STOP_WORDS.contains(t))
        .filter(|t| seen.insert((*t).to_string()))
        .map(str::to_string)
        .collect()
}

/// Rank records by how many query keywords appear in their own tokens.
///
/// A keyword counts when one of the record's tokens contains it, so "pate"
/// finds "pâtes". Records matching no keyword are dropped. Ties go to the record with fewer
/// tokens of its own (the closer name), then alphabetically.
#[must_use]
pub fn rank_by_shared_tokens(
    query: &str,
    records: Vec<NutritionRecord>,
    limit: usize,
) -> Vec<NutritionRecord> {
    let query_tokens = keyword_tokens(query);
    if query_tokens.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<(usize, usize, NutritionRecord)> = records
        .into_iter()
        .filter_map(|record| {
            let tokens = keyword_tokens(&record.name);
            let score = query_tokens
                .iter()
                .filter(|q| tokens.iter().any(|t| t.contains(q.as_str())))
                .count();
            (score > 0).then_some((score, tokens.len(), record))
        })
        .collect();

    scored.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then(a.1.cmp(&b.1))
            .then_with(|| a.2.normalized_name.cmp(&b.2.normalized_name))
    });
    scored.truncate(limit);
    scored.into_iter().map(|(_, _, r)| r).collect()
}

/// Collapse a list of identified names, keeping the first spelling of each food.
#[must_use]
pub fn dedup_names(names: &[String]) -> Vec<String> {
    let mut kept: Vec<(String, String)> = Vec::new();
    for name in names {
        let trimmed = name.trim();
        let normalized = normalize_name(trimmed);
        if normalized.is_empty() {
            continue;
        }
        if kept.iter().any(|(_, n)| normalized_match(n, &normalized)) {
            continue;
        }
        kept.push((trimmed.to_string(), normalized));
    }
    kept.into_iter().map(|(name, _)| name).collect()
}

/// Merge same-food duplicates (keeping the more confident entry) and cap the count.
///
/// Merging repeats until no two entries match, so feeding the output back in
/// returns it unchanged. When more than `cap` entries remain the most
/// confident `cap` are kept.
#[must_use]
pub fn dedup_estimates(estimates: Vec<FoodEstimate>, cap: usize) -> Vec<FoodEstimate> {
    let mut current = estimates;
    loop {
        let before = current.len();
        current = merge_pass(current);
        if current.len() == before {
            break;
        }
    }

    if current.len() > cap {
        current.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(Ordering::Equal)
        });
        current.truncate(cap);
    }
    current
}

fn merge_pass(estimates: Vec<FoodEstimate>) -> Vec<FoodEstimate> {
    let mut kept: Vec<(String, FoodEstimate)> = Vec::with_capacity(estimates.len());
    for estimate in estimates {
        let normalized = normalize_name(&estimate.food_name);
        match kept
            .iter_mut()
            .find(|(n, _)| normalized_match(n, &normalized))
        {
            Some(slot) => {
                if estimate.confidence > slot.1.confidence {
                    *slot = (normalized, estimate);
                }
            }
            None => kept.push((normalized, estimate)),
        }
    }
    kept.into_iter().map(|(_, e)| e).collect()
}
