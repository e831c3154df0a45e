//! Error taxonomy and HTTP error responses
//!
//! Every terminal failure on the HTTP path becomes a JSON body
//! `{"error": <code>, "message": <text>}`. Internal details are logged, never
//! returned to the caller.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

use crate::auth::AuthError;

/// Failures of the relay path and of connection admission
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("Tunnel ID already in use: {0}")]
    TunnelConflict(String),

    #[error("Tunnel \"{0}\" is not connected")]
    TunnelNotConnected(String),

    #[error("Tunnel host failed to respond within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Tunnel \"{0}\" is not accepting requests right now")]
    HostUnavailable(String),

    #[error("Tunnel host disconnected before responding")]
    HostDisconnected,

    #[error("Duplicate request ID: {0}")]
    DuplicateRequestId(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Payload exceeds the {0}-byte limit")]
    PayloadTooLarge(usize),
}

impl RelayError {
    /// Machine-readable code used in JSON error bodies
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::TunnelConflict(_) => "tunnel_conflict",
            RelayError::TunnelNotConnected(_) => "tunnel_not_connected",
            RelayError::Timeout(_) => "gateway_timeout",
            RelayError::HostUnavailable(_) => "host_unavailable",
            RelayError::HostDisconnected => "host_disconnected",
            RelayError::DuplicateRequestId(_) => "internal_error",
            RelayError::MalformedFrame(_) => "malformed_frame",
            RelayError::PayloadTooLarge(..) => "payload_too_large",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::TunnelConflict(_) => StatusCode::CONFLICT,
            RelayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RelayError::PayloadTooLarge(..) => StatusCode::PAYLOAD_TOO_LARGE,
            RelayError::TunnelNotConnected(_)
            | RelayError::HostUnavailable(_)
            | RelayError::HostDisconnected
            | RelayError::DuplicateRequestId(_)
            | RelayError::MalformedFrame(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Text safe to show to the public caller
    fn client_message(&self) -> String {
        match self {
            RelayError::DuplicateRequestId(_) => "Internal server error".to_string(),
            RelayError::MalformedFrame(_) => "Tunnel host sent an invalid response".to_string(),
            other => other.to_string(),
        }
    }
}

/// JSON error body
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

/// Error returned by HTTP handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Relay(e) => e.status_code(),
            ApiError::Auth(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> ErrorBody {
        let (error, message) = match self {
            ApiError::Relay(e) => (e.code(), e.client_message()),
            ApiError::Auth(e) => (e.code(), e.to_string()),
            ApiError::NotFound(msg) => ("not_found", msg.clone()),
            ApiError::BadRequest(msg) => ("bad_request", msg.clone()),
            ApiError::Internal(e) => ("internal_error", sanitize_error(e)),
        };
        ErrorBody {
            error: error.to_string(),
            message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!("Request failed with {}: {}", status, self);
        }

        let mut response = (status, Json(self.body())).into_response();
        if let ApiError::Auth(_) = self {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static(crate::auth::CHALLENGE),
            );
        }
        response
    }
}

/// Sanitize error messages for client responses
///
/// Logs the full error internally but returns a generic message to the client.
pub fn sanitize_error(e: &anyhow::Error) -> String {
    error!("Internal error: {:#}", e);
    "Internal server error".to_string()
}
