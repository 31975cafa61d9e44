use thiserror::Error;

#[derive(Debug, Error)]
pub enum AtlasError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Feature disabled: {0}")]
    FeatureDisabled(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Dependency missing: {0}")]
    DependencyMissing(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AtlasError {
    /// Numeric envelope code sent to clients in the JSON response body.
    pub fn code(&self) -> u32 {
        match self {
            AtlasError::Validation(_) => 42200,
            AtlasError::NotFound(_) => 40400,
            AtlasError::Forbidden(_) => 40300,
            AtlasError::Conflict(_) => 40900,
            AtlasError::PayloadTooLarge(_) => 41300,
            AtlasError::FeatureDisabled(_) => 40410,
            AtlasError::Timeout(_) => 50400,
            AtlasError::DependencyMissing(_) => 50010,
            AtlasError::Config(_) => 50011,
            AtlasError::QueryFailed(_) => 50012,
            AtlasError::Storage(_) => 50020,
            AtlasError::Database(_)
            | AtlasError::Serialization(_)
            | AtlasError::Io(_)
            | AtlasError::Internal(_) => 50000,
        }
    }

    /// HTTP status the envelope is served under.
    pub fn http_status(&self) -> u16 {
        match self {
            AtlasError::Validation(_) => 422,
            AtlasError::NotFound(_) | AtlasError::FeatureDisabled(_) => 404,
            AtlasError::Forbidden(_) => 403,
            AtlasError::Conflict(_) => 409,
            AtlasError::PayloadTooLarge(_) => 413,
            AtlasError::Timeout(_) => 504,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, AtlasError>;
