use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Provider unavailable: {0}")]
    Unavailable(String),
}

impl LlmError {
    /// Upstream moderation refusals are surfaced to the user directly
    /// instead of falling back to another provider.
    pub fn is_moderation_rejection(&self) -> bool {
        let text = self.to_string().to_lowercase();
        ["blocked", "content_filter", "content filter", "policy", "safety"]
            .iter()
            .any(|k| text.contains(k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moderation_keywords_are_detected() {
        let err = LlmError::Api {
            status: 400,
            message: "request blocked by content_filter".into(),
        };
        assert!(err.is_moderation_rejection());

        let plain = LlmError::Api {
            status: 500,
            message: "upstream exploded".into(),
        };
        assert!(!plain.is_moderation_rejection());
    }
}
