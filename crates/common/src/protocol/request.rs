use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::Body;

/// An HTTP request relayed from the public ingress to a host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Unique identifier to correlate request and response
    pub request_id: String,

    /// HTTP method (GET, POST, PUT, DELETE, etc.)
    pub method: String,

    /// Request path including the query string
    /// Example: "/api/v1/users?limit=10"
    pub path: String,

    /// Lower-cased header names, hop-by-hop headers already stripped
    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Body>,

    /// Timestamp when request was received (Unix epoch in milliseconds)
    #[serde(default)]
    pub timestamp: u64,
}

impl RequestFrame {
    /// Create a new request frame without headers or body
    pub fn new(request_id: String, method: String, path: String, timestamp: u64) -> Self {
        Self {
            request_id,
            method,
            path,
            headers: HashMap::new(),
            body: None,
            timestamp,
        }
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Path without the query string
    pub fn path_only(&self) -> &str {
        self.path.split_once('?').map_or(&self.path, |(p, _)| p)
    }

    /// Query string without the leading `?`
    pub fn query(&self) -> Option<&str> {
        self.path.split_once('?').map(|(_, q)| q).filter(|q| !q.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_frame_creation() {
        let req = RequestFrame::new(
            "req_123".to_string(),
            "GET".to_string(),
            "/api/users".to_string(),
            1234567890,
        );

        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/api/users");
        assert_eq!(req.request_id, "req_123");
        assert_eq!(req.timestamp, 1234567890);
        assert!(req.headers.is_empty());
        assert!(req.body.is_none());
    }

    #[test]
    fn test_header_lookup_ignores_case() {
        let mut req = RequestFrame::new("r".into(), "GET".into(), "/".into(), 0);
        req.headers
            .insert("content-type".to_string(), "text/plain".to_string());

        assert_eq!(req.header("Content-Type"), Some("text/plain"));
        assert_eq!(req.header("accept"), None);
    }

    #[test]
    fn test_path_and_query_split() {
        let req = RequestFrame::new("r".into(), "GET".into(), "/search?q=rust&page=2".into(), 0);
        assert_eq!(req.path_only(), "/search");
        assert_eq!(req.query(), Some("q=rust&page=2"));

        let req = RequestFrame::new("r".into(), "GET".into(), "/plain?".into(), 0);
        assert_eq!(req.path_only(), "/plain");
        assert_eq!(req.query(), None);
    }

    #[test]
    fn test_body_omitted_when_absent() {
        let req = RequestFrame::new("r".into(), "GET".into(), "/".into(), 0);
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("body"));

        let parsed: RequestFrame =
            serde_json::from_str(r#"{"request_id":"r","method":"GET","path":"/"}"#).unwrap();
        assert!(parsed.body.is_none());
        assert!(parsed.headers.is_empty());
    }
}
