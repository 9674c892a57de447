//! Shared error taxonomy for the focus control plane.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum Error {
    /// Request rejected before any state mutation (bad duration, unknown
    /// transition, missing required config).
    #[error("{0}")]
    Validation(String),

    /// Caller is not authenticated or a required credential is missing.
    #[error("{0}")]
    Auth(String),

    /// An upstream provider rejected the operation (OAuth refresh refused,
    /// PAT not accepted at insert).
    #[error("{0}")]
    ProviderRejected(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The persistent store rejected the operation. Fatal to the request.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// AEAD authentication failed. Must never fall back to plaintext.
    #[error("ciphertext failed authentication")]
    CipherTampered,

    /// The KEK round-trip failed (local key unusable, KMS unreachable).
    #[error("key-encryption-key operation failed: {0}")]
    Kek(String),

    /// The deferred-job queue could not be reached. The transition still
    /// commits; the backup sweep converges missed firings.
    #[error("scheduler unavailable: {0}")]
    SchedulerUnavailable(String),
}

impl Error {
    /// Short human string for API responses. Provider error bodies are
    /// logged at the call site, never echoed to the caller.
    fn public_message(&self) -> String {
        match self {
            Error::Validation(msg) | Error::Auth(msg) => msg.clone(),
            Error::NotFound(msg) => format!("Not found: {}", msg),
            Error::ProviderRejected(_) => "The external provider rejected the request".to_string(),
            Error::Store(StoreError::UniqueViolation(_)) => "Resource already exists".to_string(),
            Error::Store(_) => "Internal storage error".to_string(),
            Error::CipherTampered => "Stored credential failed integrity check".to_string(),
            Error::Kek(_) => "Encryption backend unavailable".to_string(),
            Error::SchedulerUnavailable(_) => "Scheduler unavailable".to_string(),
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Auth(_) => StatusCode::UNAUTHORIZED,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::ProviderRejected(_) => StatusCode::BAD_GATEWAY,
            Error::Store(StoreError::UniqueViolation(_)) => StatusCode::CONFLICT,
            Error::Store(_)
            | Error::CipherTampered
            | Error::Kek(_)
            | Error::SchedulerUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = Json(json!({ "error": self.public_message() }));
        (status, body).into_response()
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
