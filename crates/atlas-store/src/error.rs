use thiserror::Error;

use atlas_core::AtlasError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<StoreError> for AtlasError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(m) => AtlasError::NotFound(m),
            StoreError::Conflict(m) => AtlasError::Conflict(m),
            StoreError::Validation(m) => AtlasError::Validation(m),
            StoreError::Serde(err) => AtlasError::Serialization(err),
            other => AtlasError::Database(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
