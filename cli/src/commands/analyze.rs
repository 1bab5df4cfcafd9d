use anyhow::{Result, bail};
use std::path::{Path, PathBuf};
use std::process;

use glucimiam_core::nutrition::NutritionLookupProvider;
use glucimiam_core::pipeline::{AnalysisPath, AnalysisReport, AnalysisRequest};
use glucimiam_core::providers::{LlmSettings, VisionProvider};
use glucimiam_core::service::GluciService;

use super::helpers::{json_error, parse_taken_at, print_estimate_table, read_image};

pub(crate) struct AnalyzeArgs {
    pub images: Vec<PathBuf>,
    pub finger_mm: f64,
    pub context: Option<String>,
    pub user: Option<i64>,
    pub at: Option<String>,
    pub reuse_cache: bool,
    pub log: bool,
    pub json: bool,
}

pub(crate) async fn cmd_analyze(
    svc: &GluciService,
    provider: &dyn VisionProvider,
    lookup: &dyn NutritionLookupProvider,
    llm: &LlmSettings,
    args: AnalyzeArgs,
) -> Result<()> {
    if args.log && args.user.is_none() {
        bail!("--log needs --user so the estimates can be attributed");
    }

    let images = args
        .images
        .iter()
        .map(|p| read_image(p))
        .collect::<Result<Vec<_>>>()?;

    let request = AnalysisRequest {
        images,
        finger_length_mm: args.finger_mm,
        user_context: args.context,
        user_id: args.user,
        taken_at: parse_taken_at(args.at.as_deref())?,
        reuse_cached: args.reuse_cache,
    };

    let report = match svc.analyze(provider, Some(lookup), llm, &request).await {
        Ok(report) => report,
        Err(e) => {
            if args.json {
                println!("{}", json_error(&e.to_string()));
            } else {
                eprintln!("Error: {e}");
                if e.is_retryable() {
                    eprintln!("This may be temporary; try again.");
                }
            }
            process::exit(1);
        }
    };

    let logged = match (args.log, args.user) {
        (true, Some(user)) => svc.log_estimates(user, &report.analysis_id, &report.estimates)?,
        _ => Vec::new(),
    };

    if args.json {
        #[derive(serde::Serialize)]
        struct Output<'a> {
            #[serde(flatten)]
            report: &'a AnalysisReport,
            #[serde(skip_serializing_if = "Vec::is_empty")]
            logged_ids: Vec<i64>,
        }
        let out = Output {
            report: &report,
            logged_ids: logged.iter().map(|l| l.id).collect(),
        };
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    print_report(&report);
    if !logged.is_empty() {
        let first = logged[0].id;
        let last = logged[logged.len() - 1].id;
        println!("Logged as estimates {first}..={last}. Fix any with `glucimiam estimates edit <id>`.");
    }
    Ok(())
}

pub(crate) fn cmd_cached(svc: &GluciService, image: &Path, user: i64, json: bool) -> Result<()> {
    let bytes = read_image(image)?;
    let hit = svc.find_cached_analysis(&bytes, user)?;

    let Some(hit) = hit else {
        if json {
            println!("null");
        } else {
            eprintln!("No earlier analysis looks like this photo");
        }
        process::exit(2);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&hit)?);
    } else {
        let captured = &hit.entry.captured_at;
        let distance = hit.distance;
        println!("Matches the analysis from {captured} (distance {distance})");
        print_estimate_table(&hit.entry.estimates);
    }
    Ok(())
}

fn print_report(report: &AnalysisReport) {
    let path = match report.path {
        AnalysisPath::Cached { distance } => format!("cached (distance {distance})"),
        AnalysisPath::TwoPass => "identify + quantify".to_string(),
        AnalysisPath::SingleItemFallback => "single-item fallback".to_string(),
    };
    println!("Meal: {} | path: {path}\n", report.meal.label());
    print_estimate_table(&report.estimates);
    for (i, e) in report.estimates.iter().enumerate() {
        if !e.rationale.is_empty() {
            println!("  {}. {}", i + 1, e.rationale);
        }
    }
    let total = report.total_carbs_g;
    println!("\n  TOTAL: {total:.1} g carbs");
}
