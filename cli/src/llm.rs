use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use glucimiam_core::error::ProviderError;
use glucimiam_core::imaging::EncodedImage;
use glucimiam_core::providers::{
    LlmSettings, VisionProvider, build_request, classify_status, parse_response,
};

/// Vision provider backed by the vendors' HTTPS APIs.
///
/// The overall deadline is enforced by the pipeline, so only the connect
/// phase is bounded here.
pub struct HttpVisionProvider {
    client: reqwest::Client,
}

impl HttpVisionProvider {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("glucimiam-cli/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl VisionProvider for HttpVisionProvider {
    async fn call(
        &self,
        settings: &LlmSettings,
        images: &[EncodedImage],
        prompt: &str,
    ) -> Result<String, ProviderError> {
        let request = build_request(settings, images, prompt);
        debug!(
            provider = %settings.provider,
            model = settings.model(),
            images = images.len(),
            "calling vision provider"
        );

        let mut builder = self.client.post(&request.url).json(&request.body);
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        if !status.is_success() {
            warn!(provider = %settings.provider, status = status.as_u16(), "provider call failed");
            return Err(classify_status(status.as_u16(), &text));
        }

        let body: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
            ProviderError::Unavailable(format!("provider returned non-JSON body: {e}"))
        })?;
        parse_response(settings.provider, &body)
    }
}
