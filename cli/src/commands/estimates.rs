use anyhow::Result;
use std::process;

use glucimiam_core::service::GluciService;

use super::helpers::print_logged_table;

pub(crate) fn cmd_estimates_list(svc: &GluciService, user: i64, limit: usize, json: bool) -> Result<()> {
    let logged = svc.list_logged_estimates(user, limit)?;

    if logged.is_empty() {
        if json {
            println!("[]");
        } else {
            eprintln!("No logged estimates for user {user}");
        }
        process::exit(2);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&logged)?);
    } else {
        print_logged_table(&logged);
    }
    Ok(())
}

pub(crate) fn cmd_estimates_edit(
    svc: &GluciService,
    id: i64,
    weight: Option<f64>,
    carbs: Option<f64>,
    json: bool,
) -> Result<()> {
    let updated = svc.correct_estimate(id, weight, carbs)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&updated)?);
    } else {
        let name = &updated.food_name;
        let w = updated.corrected_weight_g.unwrap_or(updated.weight_g);
        let c = updated.effective_carbs_g();
        println!("Corrected [{id}] {name}: {w:.0} g, {c:.1} g carbs");
        println!("Future estimates of this food will account for it.");
    }
    Ok(())
}
