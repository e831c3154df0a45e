use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::utils::{decode_body, encode_body};

/// Body of a relayed request or response
///
/// Raw bytes travel base64-encoded and are passed through untouched. Structured
/// payloads travel as JSON values and are re-serialized on the way out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "data", rename_all = "snake_case")]
pub enum Body {
    Base64(String),
    Json(serde_json::Value),
}

impl Body {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Body::Base64(encode_body(bytes))
    }

    /// Pick an encoding for a payload read off the wire.
    ///
    /// Empty payloads yield `None`. Payloads declared as JSON that actually
    /// parse become [`Body::Json`]; everything else stays raw.
    pub fn from_payload(bytes: &[u8], content_type: Option<&str>) -> Option<Self> {
        if bytes.is_empty() {
            return None;
        }

        if content_type.is_some_and(is_json_content_type) {
            if let Ok(value) = serde_json::from_slice::<serde_json::Value>(bytes) {
                return Some(Body::Json(value));
            }
        }

        Some(Body::from_bytes(bytes))
    }

    /// Materialize the body as bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Body::Base64(encoded) => Ok(decode_body(encoded)?),
            Body::Json(value) => Ok(serde_json::to_vec(value)?),
        }
    }

    pub fn is_json(&self) -> bool {
        matches!(self, Body::Json(_))
    }
}

/// `application/json`, `application/problem+json`, `text/json; charset=utf-8`, ...
pub(crate) fn is_json_content_type(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    mime == "application/json" || mime == "text/json" || mime.ends_with("+json")
}
