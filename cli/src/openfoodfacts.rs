use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use glucimiam_core::models::NewNutritionRecord;
use glucimiam_core::nutrition::NutritionLookupProvider;
use glucimiam_core::openfoodfacts::{SEARCH_PARAMS, SEARCH_URL, SearchResponse, best_product};

pub struct OpenFoodFactsClient {
    client: reqwest::Client,
}

impl OpenFoodFactsClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!(
                "glucimiam-cli/{} (carbohydrate estimator)",
                env!("CARGO_PKG_VERSION")
            ))
            .timeout(std::time::Duration::from_secs(10))
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    pub async fn search_async(&self, query: &str) -> Result<Option<NewNutritionRecord>> {
        let resp = self
            .client
            .get(SEARCH_URL)
            .query(&[("search_terms", query)])
            .query(SEARCH_PARAMS)
            .send()
            .await
            .context("Failed to reach OpenFoodFacts API")?
            .error_for_status()
            .context("OpenFoodFacts search failed")?;

        let data: SearchResponse = resp
            .json()
            .await
            .context("Failed to parse OpenFoodFacts search response")?;

        debug!(query, products = data.products.len(), "OpenFoodFacts search");
        Ok(best_product(data, query))
    }
}

#[async_trait]
impl NutritionLookupProvider for OpenFoodFactsClient {
    async fn search_public(&self, query: &str) -> Result<Option<NewNutritionRecord>> {
        self.search_async(query).await
    }
}
