use serde::Serialize;

use crate::error::AtlasError;

/// Uniform JSON envelope: `{success, code, message, data?}`.
///
/// The HTTP layer is an external collaborator; services build these
/// envelopes so every transport serves the same shape.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub code: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            code: 0,
            message: "OK".to_string(),
            data: Some(data),
        }
    }

    pub fn fail(code: u32, message: impl Into<String>, data: Option<T>) -> Self {
        Self {
            success: false,
            code,
            message: message.into(),
            data,
        }
    }
}

impl ApiResponse<serde_json::Value> {
    /// Map a service error to its envelope using the standard code table.
    pub fn from_error(err: &AtlasError) -> Self {
        Self::fail(err.code(), err.to_string(), None)
    }
}
