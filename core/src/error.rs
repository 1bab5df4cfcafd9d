use std::fmt;

use thiserror::Error;

/// Longest slice of raw model output carried in a `MalformedPayload` error.
const EXCERPT_CHARS: usize = 200;

/// Failure of a single outbound provider call.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Authentication rejected by provider: {0}")]
    Auth(String),

    #[error("Provider quota or rate limit exceeded: {0}")]
    Quota(String),

    #[error("Provider rejected the request as malformed: {0}")]
    Malformed(String),

    #[error("Provider returned an empty response")]
    Empty,

    #[error("Provider unreachable: {0}")]
    Unavailable(String),
}

/// Which provider call of the pipeline a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Identify,
    Quantify,
    Fallback,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Identify => "identification",
            Self::Quantify => "quantification",
            Self::Fallback => "single-item fallback",
        })
    }
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("At least one image is required")]
    NoImages,

    #[error("{0}")]
    InvalidInput(String),

    #[error("Image {index} could not be decoded: {reason}")]
    InvalidImage { index: usize, reason: String },

    #[error("The {stage} call timed out after {secs}s")]
    Timeout { stage: Stage, secs: u64 },

    #[error("Provider authentication failed: {0}")]
    ProviderAuth(String),

    #[error("Provider quota exceeded: {0}")]
    ProviderQuota(String),

    #[error(transparent)]
    Provider(ProviderError),

    #[error("Unreadable {stage} response: {excerpt}")]
    MalformedPayload { stage: Stage, excerpt: String },

    #[error("{0}")]
    ModelDeclined(String),
}

impl AnalysisError {
    pub(crate) fn malformed(stage: Stage, raw: &str) -> Self {
        let mut excerpt: String = raw.trim().chars().take(EXCERPT_CHARS).collect();
        if raw.trim().chars().count() > EXCERPT_CHARS {
            excerpt.push('…');
        }
        Self::MalformedPayload { stage, excerpt }
    }

    /// Whether asking the user to retry could plausibly succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::ProviderQuota(_)
                | Self::Provider(ProviderError::Unavailable(_) | ProviderError::Empty)
                | Self::MalformedPayload { .. }
        )
    }
}

impl From<ProviderError> for AnalysisError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Auth(msg) => Self::ProviderAuth(msg),
            ProviderError::Quota(msg) => Self::ProviderQuota(msg),
            other => Self::Provider(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_errors_map_to_dedicated_variants() {
        let e: AnalysisError = ProviderError::Auth("bad key".to_string()).into();
        assert!(matches!(e, AnalysisError::ProviderAuth(ref m) if m == "bad key"));

        let e: AnalysisError = ProviderError::Quota("429".to_string()).into();
        assert!(matches!(e, AnalysisError::ProviderQuota(_)));

        let e: AnalysisError = ProviderError::Empty.into();
        assert!(matches!(e, AnalysisError::Provider(ProviderError::Empty)));
    }

    #[test]
    fn test_malformed_excerpt_is_truncated() {
        let raw = "x".repeat(500);
        let AnalysisError::MalformedPayload { excerpt, stage } =
            AnalysisError::malformed(Stage::Quantify, &raw)
        else {
            panic!("expected MalformedPayload");
        };
        assert_eq!(stage, Stage::Quantify);
        assert_eq!(excerpt.chars().count(), EXCERPT_CHARS + 1);
        assert!(excerpt.ends_with('…'));
    }

    #[test]
    fn test_declined_message_is_verbatim() {
        let e = AnalysisError::ModelDeclined("Photo trop floue".to_string());
        assert_eq!(e.to_string(), "Photo trop floue");
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_timeout_is_retryable() {
        let e = AnalysisError::Timeout {
            stage: Stage::Identify,
            secs: 30,
        };
        assert!(e.is_retryable());
        assert_eq!(e.to_string(), "The identification call timed out after 30s");
        assert!(!AnalysisError::ProviderAuth(String::new()).is_retryable());
    }
}
