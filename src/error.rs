// Error handling module
// Defines the broker error taxonomy and its HTTP response conversion

use std::sync::Arc;

use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors raised by the token store, the minter and the resource proxy.
///
/// Cloneable so a single in-flight login can hand the same failure to every
/// caller awaiting it.
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    /// Persisted token file is missing or unparsable
    #[error("Token store unavailable: {0}")]
    StorageUnavailable(String),

    /// Interactive login never reached the authenticated page
    #[error("Interactive login aborted: {0}")]
    LoginAborted(String),

    /// Interactive login exceeded the configured wait
    #[error("Interactive login timed out after {secs}s")]
    LoginTimedOut { secs: u64 },

    /// Identity provider or derived-token endpoint rejected an exchange
    #[error("Token exchange for {scope} failed with status code {status}")]
    TokenExchangeFailed { scope: String, status: u16 },

    /// Resource call answered with a non-200 status
    #[error("Request failed with status code {status} ({url})")]
    UpstreamError { status: u16, url: String },

    /// Inbound request lacks a required query parameter
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),

    /// Inbound request could not be decoded (body, path or query)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Transport, decoding and filesystem failures
    #[error("Internal error: {0:#}")]
    Internal(Arc<anyhow::Error>),
}

impl From<anyhow::Error> for BrokerError {
    fn from(err: anyhow::Error) -> Self {
        BrokerError::Internal(Arc::new(err))
    }
}

impl From<JsonRejection> for BrokerError {
    fn from(rejection: JsonRejection) -> Self {
        BrokerError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for BrokerError {
    fn from(rejection: PathRejection) -> Self {
        BrokerError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for BrokerError {
    fn from(rejection: QueryRejection) -> Self {
        BrokerError::BadRequest(rejection.body_text())
    }
}

impl BrokerError {
    /// Short label used in log fields
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::StorageUnavailable(_) => "storage_unavailable",
            BrokerError::LoginAborted(_) => "login_aborted",
            BrokerError::LoginTimedOut { .. } => "login_timed_out",
            BrokerError::TokenExchangeFailed { .. } => "token_exchange_failed",
            BrokerError::UpstreamError { .. } => "upstream_error",
            BrokerError::MissingParameter(_) => "missing_parameter",
            BrokerError::BadRequest(_) => "bad_request",
            BrokerError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        tracing::error!(kind = self.kind(), "{}", message);

        // The client treats every failure alike, so the status is always 500
        let body = Json(json!({ "error": message }));
        (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
    }
}

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;
