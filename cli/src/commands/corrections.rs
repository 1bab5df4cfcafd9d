use anyhow::Result;
use std::process;

use glucimiam_core::service::GluciService;

use super::helpers::print_corrections_table;

pub(crate) fn cmd_corrections_add(
    svc: &GluciService,
    user: i64,
    food: &str,
    weight_ratio: f64,
    carbs_ratio: f64,
    json: bool,
) -> Result<()> {
    let sample = svc.record_correction(user, food, weight_ratio, carbs_ratio)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&sample)?);
    } else {
        let name = &sample.food_name;
        let id = sample.id;
        println!("Recorded correction for {name} (id: {id})");
    }
    Ok(())
}

pub(crate) fn cmd_corrections_list(svc: &GluciService, user: i64, json: bool) -> Result<()> {
    let samples = svc.list_corrections(user)?;

    if samples.is_empty() {
        if json {
            println!("[]");
        } else {
            eprintln!("No corrections recorded for user {user}");
        }
        process::exit(2);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&samples)?);
    } else {
        print_corrections_table(&samples);
    }
    Ok(())
}
