use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDateTime, NaiveTime};
use serde::Serialize;
use std::path::Path;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use glucimiam_core::models::{CorrectionSample, FoodEstimate, LoggedEstimate, NutritionRecord};

/// Largest photo accepted from disk.
const MAX_IMAGE_BYTES: u64 = 25 * 1024 * 1024;

pub(crate) fn read_image(path: &Path) -> Result<Vec<u8>> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("Cannot read image: {}", path.display()))?;
    if meta.len() > MAX_IMAGE_BYTES {
        bail!(
            "Image too large: {} ({} MB max)",
            path.display(),
            MAX_IMAGE_BYTES / (1024 * 1024)
        );
    }
    std::fs::read(path).with_context(|| format!("Cannot read image: {}", path.display()))
}

/// When the meal was eaten. Accepts "HH:MM" (today) or "YYYY-MM-DD HH:MM";
/// defaults to now.
pub(crate) fn parse_taken_at(s: Option<&str>) -> Result<NaiveDateTime> {
    let Some(s) = s.map(str::trim) else {
        return Ok(Local::now().naive_local());
    };
    if s == "now" {
        return Ok(Local::now().naive_local());
    }
    if let Ok(t) = NaiveTime::parse_from_str(s, "%H:%M") {
        return Ok(Local::now().date_naive().and_time(t));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M"))
        .with_context(|| format!("Invalid time '{s}'. Use HH:MM or 'YYYY-MM-DD HH:MM'"))
}

pub(crate) fn print_estimate_table(estimates: &[FoodEstimate]) {
    #[derive(Tabled)]
    struct EstimateRow {
        #[tabled(rename = "#")]
        idx: usize,
        #[tabled(rename = "Food")]
        name: String,
        #[tabled(rename = "Weight (g)")]
        weight: String,
        #[tabled(rename = "C/100g")]
        carbs_100g: String,
        #[tabled(rename = "Carbs (g)")]
        carbs: String,
        #[tabled(rename = "Conf.")]
        confidence: String,
    }

    let rows: Vec<EstimateRow> = estimates
        .iter()
        .enumerate()
        .map(|(i, e)| EstimateRow {
            idx: i + 1,
            name: truncate(&e.food_name, 35),
            weight: format!("{:.0}", e.weight_g),
            carbs_100g: format!("{:.1}", e.carbs_per_100g),
            carbs: format!("{:.1}", no_neg_zero(e.total_carbs_g)),
            confidence: format!("{:.0}%", e.confidence * 100.0),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(2..6)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

pub(crate) fn print_nutrition_table(records: &[NutritionRecord]) {
    #[derive(Tabled)]
    struct NutritionRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "C/100g")]
        carbs: String,
        #[tabled(rename = "Category")]
        category: String,
        #[tabled(rename = "Source")]
        source: String,
    }

    let rows: Vec<NutritionRow> = records
        .iter()
        .map(|r| NutritionRow {
            id: r.id,
            name: truncate(&r.name, 40),
            carbs: format!("{:.1}", r.carbs_per_100g),
            category: r
                .category
                .as_deref()
                .map(|c| truncate(c, 20))
                .unwrap_or_default(),
            source: r.provenance.to_string(),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::single(2)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

pub(crate) fn print_logged_table(logged: &[LoggedEstimate]) {
    #[derive(Tabled)]
    struct LoggedRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "Food")]
        name: String,
        #[tabled(rename = "Weight (g)")]
        weight: String,
        #[tabled(rename = "Carbs (g)")]
        carbs: String,
        #[tabled(rename = "Corrected")]
        corrected: String,
        #[tabled(rename = "Logged")]
        created: String,
    }

    let rows: Vec<LoggedRow> = logged
        .iter()
        .map(|l| LoggedRow {
            id: l.id,
            name: truncate(&l.food_name, 30),
            weight: format!("{:.0}", l.weight_g),
            carbs: format!("{:.1}", l.total_carbs_g),
            corrected: match (l.corrected_weight_g, l.corrected_carbs_g) {
                (Some(w), Some(c)) => format!("{w:.0} g / {c:.1} g"),
                _ => "-".to_string(),
            },
            created: l.created_at.chars().take(16).collect(),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(2..4)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

pub(crate) fn print_corrections_table(samples: &[CorrectionSample]) {
    #[derive(Tabled)]
    struct CorrectionRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "Food")]
        name: String,
        #[tabled(rename = "Weight ×")]
        weight_ratio: String,
        #[tabled(rename = "Carbs ×")]
        carbs_ratio: String,
        #[tabled(rename = "Recorded")]
        created: String,
    }

    let rows: Vec<CorrectionRow> = samples
        .iter()
        .map(|s| CorrectionRow {
            id: s.id,
            name: truncate(&s.food_name, 30),
            weight_ratio: format!("{:.2}", s.weight_ratio),
            carbs_ratio: format!("{:.2}", s.carbs_ratio),
            created: s.created_at.chars().take(16).collect(),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(2..4)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

pub(crate) fn json_error(message: &str) -> String {
    #[derive(Serialize)]
    struct CliError<'a> {
        error: &'a str,
    }
    serde_json::to_string(&CliError { error: message })
        .unwrap_or_else(|_| format!("{{\"error\":\"{message}\"}}"))
}

pub(crate) fn no_neg_zero(v: f64) -> f64 {
    if v == 0.0 { 0.0 } else { v }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}
