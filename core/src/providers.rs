//! Vision model backends.
//!
//! Request shaping, response text extraction and status classification are
//! pure functions here; the HTTP transport implementing [`VisionProvider`]
//! lives in the CLI crate.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::ProviderError;
use crate::imaging::EncodedImage;

const MAX_OUTPUT_TOKENS: u32 = 1024;
const ANTHROPIC_VERSION: &str = "2023-06-01";
const TEXT_ONLY_NOTE: &str =
    "(Note : l'analyse d'image n'est pas disponible via cette API, décris les aliments mentionnés)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Claude,
    #[serde(alias = "chatgpt")]
    OpenAi,
    Gemini,
    Perplexity,
}

impl ProviderKind {
    pub const ALL: [Self; 4] = [Self::Claude, Self::OpenAi, Self::Gemini, Self::Perplexity];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
            Self::Perplexity => "perplexity",
        }
    }

    #[must_use]
    pub const fn default_model(self) -> &'static str {
        match self {
            Self::Claude => "claude-sonnet-4-5",
            Self::OpenAi => "gpt-4o",
            Self::Gemini => "gemini-2.5-flash",
            Self::Perplexity => "sonar-pro",
        }
    }

    /// Conventional environment variable holding this backend's key.
    #[must_use]
    pub const fn api_key_env(self) -> &'static str {
        match self {
            Self::Claude => "ANTHROPIC_API_KEY",
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Gemini => "GEMINI_API_KEY",
            Self::Perplexity => "PERPLEXITY_API_KEY",
        }
    }

    /// Perplexity only takes text; images are dropped and the prompt annotated.
    #[must_use]
    pub const fn accepts_images(self) -> bool {
        !matches!(self, Self::Perplexity)
    }

    #[must_use]
    pub fn endpoint(self, model: &str) -> String {
        match self {
            Self::Claude => "https://api.anthropic.com/v1/messages".to_string(),
            Self::OpenAi => "https://api.openai.com/v1/chat/completions".to_string(),
            Self::Gemini => format!(
                "https://generativelanguage.googleapis.com/v1beta/models/{model}:generateContent"
            ),
            Self::Perplexity => "https://api.perplexity.ai/chat/completions".to_string(),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "claude" | "anthropic" => Ok(Self::Claude),
            "openai" | "chatgpt" => Ok(Self::OpenAi),
            "gemini" | "google" => Ok(Self::Gemini),
            "perplexity" => Ok(Self::Perplexity),
            other => bail!("Unknown provider '{other}'. Must be one of: claude, openai, gemini, perplexity"),
        }
    }
}

/// Which backend to call and with what credentials. Resolved once by the
/// caller and passed down unchanged.
#[derive(Clone)]
pub struct LlmSettings {
    pub provider: ProviderKind,
    pub api_key: String,
    pub model: Option<String>,
}

impl LlmSettings {
    #[must_use]
    pub fn new(provider: ProviderKind, api_key: impl Into<String>) -> Self {
        Self {
            provider,
            api_key: api_key.into(),
            model: None,
        }
    }

    #[must_use]
    pub fn model(&self) -> &str {
        self.model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.provider.default_model())
    }
}

impl fmt::Debug for LlmSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmSettings")
            .field("provider", &self.provider)
            .field("api_key", &"<redacted>")
            .field("model", &self.model())
            .finish()
    }
}

/// A fully shaped outbound call.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Value,
}

#[must_use]
pub fn build_request(settings: &LlmSettings, images: &[EncodedImage], prompt: &str) -> ProviderRequest {
    let model = settings.model();
    let url = settings.provider.endpoint(model);

    match settings.provider {
        ProviderKind::Claude => {
            let mut content: Vec<Value> = images
                .iter()
                .map(|img| {
                    json!({
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": img.media_type,
                            "data": img.data_base64,
                        }
                    })
                })
                .collect();
            content.push(json!({"type": "text", "text": prompt}));
            ProviderRequest {
                url,
                headers: vec![
                    ("x-api-key", settings.api_key.clone()),
                    ("anthropic-version", ANTHROPIC_VERSION.to_string()),
                ],
                body: json!({
                    "model": model,
                    "max_tokens": MAX_OUTPUT_TOKENS,
                    "messages": [{"role": "user", "content": content}],
                }),
            }
        }
        ProviderKind::OpenAi => {
            let mut content = vec![json!({"type": "text", "text": prompt})];
            content.extend(
                images
                    .iter()
                    .map(|img| json!({"type": "image_url", "image_url": {"url": img.data_url()}})),
            );
            ProviderRequest {
                url,
                headers: vec![("Authorization", format!("Bearer {}", settings.api_key))],
                body: json!({
                    "model": model,
                    "max_tokens": MAX_OUTPUT_TOKENS,
                    "messages": [{"role": "user", "content": content}],
                }),
            }
        }
        ProviderKind::Gemini => {
            let mut parts = vec![json!({"text": prompt})];
            parts.extend(images.iter().map(|img| {
                json!({"inline_data": {"mime_type": img.media_type, "data": img.data_base64}})
            }));
            ProviderRequest {
                url,
                headers: vec![("x-goog-api-key", settings.api_key.clone())],
                body: json!({
                    "contents": [{"role": "user", "parts": parts}],
                    "generationConfig": {"maxOutputTokens": MAX_OUTPUT_TOKENS},
                }),
            }
        }
        ProviderKind::Perplexity => ProviderRequest {
            url,
            headers: vec![("Authorization", format!("Bearer {}", settings.api_key))],
            body: json!({
                "model": model,
                "max_tokens": MAX_OUTPUT_TOKENS,
                "messages": [{"role": "user", "content": format!("{prompt}\n\n{TEXT_ONLY_NOTE}")}],
            }),
        },
    }
}

/// Concatenate every text fragment of a successful response body.
pub fn parse_response(kind: ProviderKind, body: &Value) -> Result<String, ProviderError> {
    let fragments: Vec<&str> = match kind {
        ProviderKind::Claude => body["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b["type"] == "text")
                    .filter_map(|b| b["text"].as_str())
                    .collect()
            })
            .unwrap_or_default(),
        ProviderKind::OpenAi | ProviderKind::Perplexity => body["choices"]
            .as_array()
            .and_then(|choices| choices.first())
            .map(|choice| match &choice["message"]["content"] {
                Value::String(s) => vec![s.as_str()],
                Value::Array(parts) => parts.iter().filter_map(|p| p["text"].as_str()).collect(),
                _ => Vec::new(),
            })
            .unwrap_or_default(),
        ProviderKind::Gemini => body["candidates"]
            .as_array()
            .and_then(|candidates| candidates.first())
            .and_then(|c| c["content"]["parts"].as_array())
            .map(|parts| parts.iter().filter_map(|p| p["text"].as_str()).collect())
            .unwrap_or_default(),
    };

    let text = fragments.concat();
    if text.trim().is_empty() {
        return Err(ProviderError::Empty);
    }
    Ok(text)
}

/// Map a non-success HTTP status to a failure kind.
#[must_use]
pub fn classify_status(status: u16, body: &str) -> ProviderError {
    let detail = format!("HTTP {status}: {}", body.chars().take(300).collect::<String>());
    match status {
        401 | 403 => ProviderError::Auth(detail),
        // Gemini answers an invalid key with a plain 400
        400 if body.contains("API_KEY_INVALID") || body.contains("API key not valid") => {
            ProviderError::Auth(detail)
        }
        402 | 429 => ProviderError::Quota(detail),
        400 | 404 | 413 | 415 | 422 => ProviderError::Malformed(detail),
        _ => ProviderError::Unavailable(detail),
    }
}

/// One outbound call to a vision-capable model. Implementations perform
/// exactly one request and never retry.
#[async_trait]
pub trait VisionProvider: Send + Sync {
    async fn call(
        &self,
        settings: &LlmSettings,
        images: &[EncodedImage],
        prompt: &str,
    ) -> Result<String, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> EncodedImage {
        EncodedImage {
            media_type: "image/jpeg".to_string(),
            data_base64: "QUJD".to_string(),
            width: 1,
            height: 1,
        }
    }

    #[test]
    fn test_provider_parse_and_aliases() {
        assert_eq!("chatgpt".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
        assert_eq!("Claude".parse::<ProviderKind>().unwrap(), ProviderKind::Claude);
        assert!("mistral".parse::<ProviderKind>().is_err());
        let kind: ProviderKind = serde_json::from_str("\"chatgpt\"").unwrap();
        assert_eq!(kind, ProviderKind::OpenAi);
    }

    #[test]
    fn test_model_falls_back_to_default() {
        let mut s = LlmSettings::new(ProviderKind::Gemini, "k");
        assert_eq!(s.model(), "gemini-2.5-flash");
        s.model = Some("gemini-2.5-pro".to_string());
        assert_eq!(s.model(), "gemini-2.5-pro");
        assert!(format!("{s:?}").contains("<redacted>"));
    }

    #[test]
    fn test_claude_request_shape() {
        let s = LlmSettings::new(ProviderKind::Claude, "sk-test");
        let req = build_request(&s, &[image(), image()], "analyse");
        assert_eq!(req.url, "https://api.anthropic.com/v1/messages");
        assert!(req.headers.contains(&("x-api-key", "sk-test".to_string())));
        let content = req.body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content.len(), 3);
        assert_eq!(content[0]["source"]["data"], "QUJD");
        assert_eq!(content[2]["text"], "analyse");
    }

    #[test]
    fn test_openai_and_gemini_attach_every_image() {
        let s = LlmSettings::new(ProviderKind::OpenAi, "k");
        let req = build_request(&s, &[image(), image()], "p");
        let content = req.body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content.len(), 3);
        assert_eq!(content[1]["image_url"]["url"], "data:image/jpeg;base64,QUJD");

        let s = LlmSettings::new(ProviderKind::Gemini, "k");
        let req = build_request(&s, &[image()], "p");
        assert!(req.url.ends_with("/gemini-2.5-flash:generateContent"));
        let parts = req.body["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts[1]["inline_data"]["mime_type"], "image/jpeg");
    }

    #[test]
    fn test_perplexity_is_text_only() {
        let s = LlmSettings::new(ProviderKind::Perplexity, "k");
        let req = build_request(&s, &[image()], "liste les aliments");
        let content = req.body["messages"][0]["content"].as_str().unwrap();
        assert!(content.starts_with("liste les aliments"));
        assert!(content.contains(TEXT_ONLY_NOTE));
        assert!(!ProviderKind::Perplexity.accepts_images());
    }

    #[test]
    fn test_parse_response_concatenates_fragments() {
        let body = json!({"content": [
            {"type": "text", "text": "{\"foods\":"},
            {"type": "text", "text": "[\"riz\"]}"}
        ]});
        assert_eq!(
            parse_response(ProviderKind::Claude, &body).unwrap(),
            "{\"foods\":[\"riz\"]}"
        );

        let body = json!({"candidates": [{"content": {"parts": [{"text": "a"}, {"text": "b"}]}}]});
        assert_eq!(parse_response(ProviderKind::Gemini, &body).unwrap(), "ab");

        let body = json!({"choices": [{"message": {"content": "ok"}}]});
        assert_eq!(parse_response(ProviderKind::OpenAi, &body).unwrap(), "ok");
    }

    #[test]
    fn test_parse_response_empty() {
        let body = json!({"choices": [{"message": {"content": "  "}}]});
        assert!(matches!(
            parse_response(ProviderKind::Perplexity, &body),
            Err(ProviderError::Empty)
        ));
        assert!(matches!(
            parse_response(ProviderKind::Claude, &json!({})),
            Err(ProviderError::Empty)
        ));
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(classify_status(401, ""), ProviderError::Auth(_)));
        assert!(matches!(
            classify_status(400, r#"{"error":{"status":"INVALID_ARGUMENT","details":[{"reason":"API_KEY_INVALID"}]}}"#),
            ProviderError::Auth(_)
        ));
        assert!(matches!(classify_status(429, "slow down"), ProviderError::Quota(_)));
        assert!(matches!(classify_status(400, "bad image"), ProviderError::Malformed(_)));
        assert!(matches!(classify_status(529, "overloaded"), ProviderError::Unavailable(_)));
    }
}
