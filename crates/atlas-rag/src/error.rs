use thiserror::Error;

use atlas_core::AtlasError;

use crate::engine::EngineError;

#[derive(Debug, Error)]
pub enum RagError {
    #[error("RAG is not enabled")]
    NotEnabled,

    #[error("RAG dependency missing: {0}")]
    DependencyMissing(String),

    #[error("RAG config error: {0}")]
    ConfigError(String),

    #[error("RAG query timeout")]
    Timeout,

    #[error("RAG query failed: {0}")]
    QueryFailed(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<EngineError> for RagError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Dependency(m) => RagError::DependencyMissing(m),
            EngineError::Config(m) => RagError::ConfigError(m),
            EngineError::Transient(m) | EngineError::Other(m) => RagError::QueryFailed(m),
        }
    }
}

impl From<RagError> for AtlasError {
    fn from(e: RagError) -> Self {
        match e {
            RagError::NotEnabled => AtlasError::FeatureDisabled("RAG is not enabled".into()),
            RagError::DependencyMissing(m) => AtlasError::DependencyMissing(m),
            RagError::ConfigError(m) => AtlasError::Config(m),
            RagError::Timeout => AtlasError::Timeout("RAG query timeout".into()),
            RagError::QueryFailed(m) => AtlasError::QueryFailed(m),
            RagError::Validation(m) => AtlasError::Validation(m),
            RagError::NotFound(m) => AtlasError::NotFound(m),
            RagError::Internal(m) => AtlasError::Internal(m),
        }
    }
}

pub type Result<T> = std::result::Result<T, RagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_envelope_codes() {
        assert_eq!(AtlasError::from(RagError::NotEnabled).code(), 40410);
        assert_eq!(AtlasError::from(RagError::Timeout).code(), 50400);
        assert_eq!(
            AtlasError::from(RagError::DependencyMissing("x".into())).code(),
            50010
        );
        assert_eq!(
            AtlasError::from(RagError::ConfigError("x".into())).code(),
            50011
        );
        assert_eq!(
            AtlasError::from(RagError::QueryFailed("x".into())).code(),
            50012
        );
    }
}
