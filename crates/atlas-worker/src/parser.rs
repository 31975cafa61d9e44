//! Document parser contract: binary formats in, extractable text out.

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

/// `retryable` routes the outbox ack: transient extraction failures
/// retry with backoff, structural ones (corrupt file, unsupported
/// encoding) go dead immediately.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ParseError {
    pub message: String,
    pub retryable: bool,
}

impl ParseError {
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}

#[async_trait]
pub trait DocumentParser: Send + Sync {
    async fn parse(&self, path: &Path, content_type: &str) -> Result<String, ParseError>;
}

/// Default backend: handles plain-text formats itself and reports
/// binary formats as permanently unparseable until a real document
/// parser is wired in.
pub struct PlainTextParser;

#[async_trait]
impl DocumentParser for PlainTextParser {
    async fn parse(&self, path: &Path, content_type: &str) -> Result<String, ParseError> {
        let ct = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if !matches!(ct.as_str(), "text/plain" | "text/markdown" | "text/html") {
            return Err(ParseError::permanent(format!(
                "no parser backend for content type: {content_type}"
            )));
        }
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ParseError::transient(e.to_string()))
    }
}

/// Test fakes.
#[doc(hidden)]
pub mod test_support {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// Returns the file contents as text.
    pub struct PassthroughParser;

    #[async_trait]
    impl DocumentParser for PassthroughParser {
        async fn parse(&self, path: &Path, _content_type: &str) -> Result<String, ParseError> {
            std::fs::read_to_string(path).map_err(|e| ParseError::transient(e.to_string()))
        }
    }

    /// Fails `failures` times, then succeeds; or always fails
    /// permanently when `permanent` is set.
    pub struct FlakyParser {
        pub failures: AtomicU32,
        pub permanent: bool,
    }

    impl FlakyParser {
        pub fn failing(times: u32) -> Self {
            Self {
                failures: AtomicU32::new(times),
                permanent: false,
            }
        }

        pub fn broken() -> Self {
            Self {
                failures: AtomicU32::new(0),
                permanent: true,
            }
        }
    }

    #[async_trait]
    impl DocumentParser for FlakyParser {
        async fn parse(&self, path: &Path, _content_type: &str) -> Result<String, ParseError> {
            if self.permanent {
                return Err(ParseError::permanent("unreadable document"));
            }
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(ParseError::transient("extractor hiccup"));
            }
            std::fs::read_to_string(path).map_err(|e| ParseError::transient(e.to_string()))
        }
    }
}
