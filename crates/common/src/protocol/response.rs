use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{Body, ErrorCode};

/// The response from the local service, sent back through the tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    /// Must match the request_id from the corresponding RequestFrame
    pub request_id: String,

    /// HTTP status code (200, 404, 500, etc.)
    pub status_code: u16,

    /// Lower-cased header names; `set-cookie` values are joined with '\n'
    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Body>,

    /// Processing time in milliseconds (local service response time)
    #[serde(default)]
    pub processing_time_ms: u64,
}

impl ResponseFrame {
    /// Create a new response frame without headers or body
    pub fn new(request_id: String, status_code: u16) -> Self {
        Self {
            request_id,
            status_code,
            headers: HashMap::new(),
            body: None,
            processing_time_ms: 0,
        }
    }

    /// Response synthesized from an `error` frame sent in place of a response
    pub fn from_error(request_id: String, code: ErrorCode, message: &str) -> Self {
        let mut response = Self::new(request_id, code.http_status());
        response
            .headers
            .insert("content-type".to_string(), "application/json".to_string());
        response.body = Some(Body::Json(serde_json::json!({
            "error": code.as_str(),
            "message": message,
        })));
        response
    }
}
