use serde::{Deserialize, Deserializer};

use crate::models::{NewNutritionRecord, Provenance};

pub const SEARCH_URL: &str = "https://world.openfoodfacts.org/cgi/search.pl";

/// Query parameters besides `search_terms`.
pub const SEARCH_PARAMS: &[(&str, &str)] = &[
    ("search_simple", "1"),
    ("action", "process"),
    ("json", "1"),
    ("page_size", "5"),
];

#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub products: Vec<ProductData>,
}

#[derive(Debug, Deserialize)]
pub struct ProductData {
    pub product_name: Option<String>,
    pub categories_tags: Option<Vec<String>>,
    pub nutriments: Option<Nutriments>,
}

#[derive(Debug, Deserialize)]
pub struct Nutriments {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub carbohydrates_100g: Option<f64>,
}

/// OpenFoodFacts mixes numbers and numeric strings for the same field.
fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(f64),
        String(String),
    }

    Ok(match Option::<NumberOrString>::deserialize(deserializer)? {
        Some(NumberOrString::Number(n)) => Some(n),
        Some(NumberOrString::String(s)) => s.trim().replace(',', ".").parse().ok(),
        None => None,
    })
}

/// A product usable as a carbohydrate reference. Unnamed products take the
/// search query as their name.
#[must_use]
pub fn product_to_record(p: ProductData, query: &str) -> Option<NewNutritionRecord> {
    let carbs = p.nutriments?.carbohydrates_100g?;
    if !carbs.is_finite() || !(0.0..=100.0).contains(&carbs) {
        return None;
    }
    let name = p
        .product_name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| query.trim().to_string());
    let category = p
        .categories_tags
        .and_then(|tags| tags.into_iter().next())
        .map(|tag| tag.split_once(':').map_or(tag.clone(), |(_, rest)| rest.to_string()))
        .filter(|c| !c.is_empty());

    Some(NewNutritionRecord {
        name,
        carbs_per_100g: carbs,
        provenance: Provenance::PublicLookup,
        category,
    })
}

/// First product in the response carrying a carbohydrate value.
#[must_use]
pub fn best_product(response: SearchResponse, query: &str) -> Option<NewNutritionRecord> {
    response
        .products
        .into_iter()
        .find_map(|p| product_to_record(p, query))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(name: Option<&str>, carbs: Option<f64>) -> ProductData {
        ProductData {
            product_name: name.map(str::to_string),
            categories_tags: Some(vec!["en:breakfasts".to_string()]),
            nutriments: Some(Nutriments {
                carbohydrates_100g: carbs,
            }),
        }
    }

    #[test]
    fn test_product_to_record_complete() {
        let rec = product_to_record(product(Some("Nutella"), Some(57.5)), "pâte à tartiner").unwrap();
        assert_eq!(rec.name, "Nutella");
        assert_eq!(rec.carbs_per_100g, 57.5);
        assert_eq!(rec.provenance, Provenance::PublicLookup);
        assert_eq!(rec.category.as_deref(), Some("breakfasts"));
    }

    #[test]
    fn test_product_without_name_uses_query() {
        let rec = product_to_record(product(None, Some(12.0)), " compote ").unwrap();
        assert_eq!(rec.name, "compote");

        let rec = product_to_record(product(Some(""), Some(12.0)), "compote").unwrap();
        assert_eq!(rec.name, "compote");
    }

    #[test]
    fn test_product_without_carbs_is_skipped() {
        assert!(product_to_record(product(Some("Eau"), None), "eau").is_none());
        assert!(product_to_record(product(Some("Bad"), Some(180.0)), "bad").is_none());

        let mut p = product(Some("X"), Some(1.0));
        p.nutriments = None;
        assert!(product_to_record(p, "x").is_none());
    }

    #[test]
    fn test_best_product_picks_first_with_carbs() {
        let json = r#"{"products": [
            {"product_name": "Sans info", "nutriments": {}},
            {"product_name": "Riz basmati", "nutriments": {"carbohydrates_100g": "77,5"}},
            {"product_name": "Riz rond", "nutriments": {"carbohydrates_100g": 79}}
        ]}"#;
        let response: SearchResponse = serde_json::from_str(json).unwrap();
        let rec = best_product(response, "riz").unwrap();
        assert_eq!(rec.name, "Riz basmati");
        assert_eq!(rec.carbs_per_100g, 77.5);
        assert!(rec.category.is_none());
    }

    #[test]
    fn test_empty_response() {
        let response: SearchResponse = serde_json::from_str(r#"{"count": 0}"#).unwrap();
        assert!(best_product(response, "riz").is_none());
    }
}
