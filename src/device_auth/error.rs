use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;

use super::store::StoreError;

/// Outcomes of device authorization operations that are not a success.
///
/// Everything except `Internal` is an expected, user-facing result and is
/// passed through to the caller as-is.
#[derive(Debug, Error, Diagnostic)]
pub enum DeviceAuthError {
    #[error("Device code not found")]
    #[diagnostic(code(pairgate::device_auth::not_found))]
    NotFound,

    #[error("Device code has expired")]
    #[diagnostic(code(pairgate::device_auth::expired))]
    Expired,

    #[error("Device code has already been processed")]
    #[diagnostic(code(pairgate::device_auth::conflict))]
    Conflict,

    #[error("{0}")]
    #[diagnostic(code(pairgate::device_auth::invalid_input))]
    InvalidInput(String),

    #[error("Not authenticated")]
    #[diagnostic(code(pairgate::device_auth::unauthenticated))]
    Unauthenticated,

    #[error("Internal error: {0}")]
    #[diagnostic(code(pairgate::device_auth::internal))]
    Internal(String),
}

impl DeviceAuthError {
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceAuthError::NotFound => "not_found",
            DeviceAuthError::Expired => "expired",
            DeviceAuthError::Conflict => "conflict",
            DeviceAuthError::InvalidInput(_) => "invalid_input",
            DeviceAuthError::Unauthenticated => "unauthenticated",
            DeviceAuthError::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            DeviceAuthError::NotFound => StatusCode::NOT_FOUND,
            DeviceAuthError::Expired => StatusCode::GONE,
            DeviceAuthError::Conflict => StatusCode::CONFLICT,
            DeviceAuthError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            DeviceAuthError::Unauthenticated => StatusCode::UNAUTHORIZED,
            DeviceAuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for DeviceAuthError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound => DeviceAuthError::NotFound,
            StoreError::StatusMismatch { .. } => DeviceAuthError::Conflict,
            other => {
                tracing::error!(error = %other, "Device authorization store failure");
                DeviceAuthError::Internal(other.to_string())
            }
        }
    }
}

impl IntoResponse for DeviceAuthError {
    fn into_response(self) -> Response {
        // Internal details stay in the logs
        let description = match &self {
            DeviceAuthError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };
        let body = json!({
            "error": self.kind(),
            "error_description": description,
        });
        (self.status_code(), Json(body)).into_response()
    }
}
