//! Prompt templates, in French like the app's users.

use std::fmt::Write;

use crate::models::MealBand;
use crate::nutrition::ReferenceValue;

const ROLE: &str = "Tu es un expert en nutrition et en comptage des glucides pour les diabétiques insulino-dépendants.";

const RETAKE_FORMAT: &str = r#"Si la photo est floue, ne montre aucun aliment ou ne permet pas l'analyse, réponds :
{
  "error": "description du problème",
  "needsRetake": true
}"#;

fn context_line(user_context: Option<&str>) -> String {
    match user_context.map(str::trim).filter(|c| !c.is_empty()) {
        Some(c) => format!("\nL'utilisateur a ajouté ce contexte pour t'aider : \"{c}\"\n"),
        None => String::new(),
    }
}

fn finger_line(finger_length_mm: f64) -> String {
    format!(
        "Sur la photo, tu verras un doigt (index) qui sert d'étalon de mesure. \
         La longueur réelle de cet index est de {finger_length_mm}mm. \
         Utilise cet étalon pour estimer les dimensions et volumes des aliments visibles."
    )
}

/// Pass 1: list every distinct food across all photos.
#[must_use]
pub fn identify_prompt(image_count: usize, meal: MealBand, user_context: Option<&str>) -> String {
    let photos = if image_count > 1 {
        format!(
            "Voici {image_count} photos du même repas, prises sous des angles différents. \
             Un aliment visible sur plusieurs photos ne doit être listé qu'une seule fois."
        )
    } else {
        "Voici la photo d'un repas.".to_string()
    };

    format!(
        "{ROLE}\n\n{photos}\nMoment du repas : {meal}.\n{ctx}\n\
         Liste chaque aliment distinct visible, sans doublon et sans quantité.\n\n\
         Réponds UNIQUEMENT en JSON valide avec ce format exact :\n\
         {{\n  \"foods\": [\"nom de l'aliment en français\", \"...\"]\n}}\n\n{RETAKE_FORMAT}",
        meal = meal.label(),
        ctx = context_line(user_context),
    )
}

/// Pass 2: weigh each identified food, using references as authoritative.
#[must_use]
pub fn quantify_prompt(
    names: &[String],
    references: &[(String, ReferenceValue)],
    finger_length_mm: f64,
    meal: MealBand,
    user_context: Option<&str>,
) -> String {
    let mut list = String::new();
    for name in names {
        let _ = writeln!(list, "- {name}");
    }

    let mut hints = String::new();
    if !references.is_empty() {
        hints.push_str(
            "\nValeurs de référence (à utiliser telles quelles pour carbsPer100g) :\n",
        );
        for (name, reference) in references {
            let _ = writeln!(
                hints,
                "- {name} : {} g de glucides pour 100 g ({})",
                reference.carbs_per_100g,
                reference.source_label()
            );
        }
    }

    format!(
        "{ROLE}\n\n{finger}\nMoment du repas : {meal}.\n{ctx}\n\
         Les aliments suivants ont été identifiés :\n{list}{hints}\n\
         Pour chacun, estime le poids en grammes et les glucides. \
         Renvoie exactement une entrée par aliment listé, dans le même ordre, sans en ajouter.\n\n\
         Réponds UNIQUEMENT en JSON valide avec ce format exact :\n\
         {{\n  \"items\": [\n    {{\n      \"foodName\": \"nom de l'aliment\",\n      \
         \"estimatedWeightG\": nombre_en_grammes,\n      \"carbsPer100g\": glucides_pour_100g,\n      \
         \"totalCarbsG\": total_glucides_en_grammes,\n      \"confidence\": nombre_entre_0_et_1,\n      \
         \"reasoning\": \"explication courte\"\n    }}\n  ]\n}}\n\n{RETAKE_FORMAT}",
        finger = finger_line(finger_length_mm),
        meal = meal.label(),
        ctx = context_line(user_context),
    )
}

/// One-shot prompt used when identification yields nothing usable.
#[must_use]
pub fn fallback_prompt(finger_length_mm: f64, user_context: Option<&str>) -> String {
    format!(
        "{ROLE}\n\nAnalyse cette photo d'un plat/collation. {finger}\n{ctx}\n\
         Réponds UNIQUEMENT en JSON valide avec ce format exact :\n\
         {{\n  \"foodName\": \"nom du plat/aliment en français\",\n  \
         \"estimatedWeightG\": nombre_en_grammes,\n  \"carbsPer100g\": glucides_pour_100g,\n  \
         \"totalCarbsG\": total_glucides_en_grammes,\n  \"confidence\": nombre_entre_0_et_1,\n  \
         \"reasoning\": \"explication courte de ton estimation\"\n}}\n\n{RETAKE_FORMAT}",
        finger = finger_line(finger_length_mm),
        ctx = context_line(user_context),
    )
}
