use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{Body, RequestFrame};

/// One relayed request as seen by viewers and the log store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLogEntry {
    pub request_id: String,
    pub tunnel_id: String,
    pub method: String,
    /// Path without the query string
    pub path: String,
    pub status: u16,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,

    /// Request details kept for replay; never sent to viewers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Body>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// The request had a body too large to keep
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub body_omitted: bool,

    /// Set when this entry was produced by replaying another one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_of: Option<String>,
}

impl RequestLogEntry {
    /// Copy without the replay details, as broadcast to viewers
    pub fn summary(&self) -> Self {
        Self {
            request_id: self.request_id.clone(),
            tunnel_id: self.tunnel_id.clone(),
            method: self.method.clone(),
            path: self.path.clone(),
            status: self.status,
            duration_ms: self.duration_ms,
            timestamp: self.timestamp,
            headers: None,
            body: None,
            query: None,
            body_omitted: self.body_omitted,
            replay_of: self.replay_of.clone(),
        }
    }

    /// Rebuild the logged request under a fresh request ID
    pub fn to_request_frame(&self, request_id: String, timestamp: u64) -> RequestFrame {
        RequestFrame {
            request_id,
            method: self.method.clone(),
            path: self.full_path(),
            headers: self.headers.clone().unwrap_or_default(),
            body: self.body.clone(),
            timestamp,
        }
    }

    /// Path with the query string re-attached
    pub fn full_path(&self) -> String {
        match self.query.as_deref() {
            Some(q) if !q.is_empty() => format!("{}?{}", self.path, q),
            _ => self.path.clone(),
        }
    }
}
