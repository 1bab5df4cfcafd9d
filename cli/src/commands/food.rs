use anyhow::{Result, bail};
use std::process;

use glucimiam_core::models::{NewNutritionRecord, Provenance, UpdateNutritionRecord};
use glucimiam_core::nutrition::NutritionLookupProvider;
use glucimiam_core::service::GluciService;

use super::helpers::print_nutrition_table;

pub(crate) fn cmd_food_add(
    svc: &GluciService,
    name: &str,
    carbs: f64,
    category: Option<String>,
    curated: bool,
    json: bool,
) -> Result<()> {
    let record = svc.add_nutrition_record(&NewNutritionRecord {
        name: name.to_string(),
        carbs_per_100g: carbs,
        provenance: if curated {
            Provenance::Curated
        } else {
            Provenance::Manual
        },
        category,
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        let name = &record.name;
        let id = record.id;
        println!("Added: {name} ({carbs:.1} g carbs/100g, id: {id})");
    }
    Ok(())
}

pub(crate) fn cmd_food_list(
    svc: &GluciService,
    search: Option<&str>,
    limit: usize,
    json: bool,
) -> Result<()> {
    let records = svc.list_nutrition(search, limit)?;

    if records.is_empty() {
        if json {
            println!("[]");
        } else {
            eprintln!("No foods found");
        }
        process::exit(2);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        print_nutrition_table(&records);
    }
    Ok(())
}

/// Ranked dictionary matches, the way analysis picks references.
pub(crate) fn cmd_food_search(svc: &GluciService, query: &str, json: bool) -> Result<()> {
    let records = svc.search_nutrition(query, 10)?;

    if records.is_empty() {
        if json {
            println!("[]");
        } else {
            eprintln!("No local match for '{query}'");
        }
        process::exit(2);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        print_nutrition_table(&records);
    }
    Ok(())
}

/// Resolve a reference value, consulting `OpenFoodFacts` when the
/// dictionary has nothing.
pub(crate) async fn cmd_food_lookup(
    svc: &GluciService,
    lookup: &dyn NutritionLookupProvider,
    query: &str,
    json: bool,
) -> Result<()> {
    let Some(reference) = svc.lookup_reference(Some(lookup), query).await else {
        if json {
            println!("null");
        } else {
            eprintln!("No carbohydrate reference found for '{query}'");
        }
        process::exit(2);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&reference)?);
    } else {
        let carbs = reference.carbs_per_100g;
        println!("{carbs:.1} g carbs/100g ({})", reference.source_label());
    }
    Ok(())
}

pub(crate) fn cmd_food_update(
    svc: &GluciService,
    id: i64,
    carbs: Option<f64>,
    category: Option<String>,
    clear_category: bool,
    json: bool,
) -> Result<()> {
    if carbs.is_none() && category.is_none() && !clear_category {
        bail!("Nothing to update. Pass --carbs, --category or --clear-category");
    }
    let update = UpdateNutritionRecord {
        carbs_per_100g: carbs,
        category: if clear_category { Some(None) } else { category.map(Some) },
    };
    let record = svc.update_nutrition_record(id, &update)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        let name = &record.name;
        let carbs = record.carbs_per_100g;
        println!("Updated: {name} ({carbs:.1} g carbs/100g)");
    }
    Ok(())
}

pub(crate) fn cmd_food_stats(svc: &GluciService, json: bool) -> Result<()> {
    let stats = svc.nutrition_stats()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("  Total:          {}", stats.total);
        println!("  Curated:        {}", stats.curated);
        println!("  OpenFoodFacts:  {}", stats.public_lookup);
        println!("  Manual:         {}", stats.manual);
    }
    Ok(())
}
