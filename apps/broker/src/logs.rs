//! Request log storage
//!
//! The broker only produces entries. Reads serve the dashboard log API and
//! replay; deletion happens only through the retention sweep.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use tunnelhub_common::RequestLogEntry;

/// Storage collaborator for request logs
pub trait LogStore: Send + Sync {
    fn append(&self, entry: RequestLogEntry);

    fn find(&self, request_id: &str) -> Option<RequestLogEntry>;

    /// Newest first, at most `limit` entries
    fn recent(&self, tunnel_id: &str, limit: usize) -> Vec<RequestLogEntry>;

    /// Delete entries older than `cutoff`, returning how many were removed
    fn purge_older_than(&self, cutoff: DateTime<Utc>) -> usize;
}

/// Bounded in-memory log, one ring buffer per tunnel
#[derive(Debug)]
pub struct InMemoryLogStore {
    capacity: usize,
    by_tunnel: DashMap<String, VecDeque<RequestLogEntry>>,
}

impl InMemoryLogStore {
    pub fn new(capacity_per_tunnel: usize) -> Self {
        Self {
            capacity: capacity_per_tunnel.max(1),
            by_tunnel: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_tunnel.iter().map(|e| e.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogStore for InMemoryLogStore {
    fn append(&self, entry: RequestLogEntry) {
        let mut entries = self.by_tunnel.entry(entry.tunnel_id.clone()).or_default();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    fn find(&self, request_id: &str) -> Option<RequestLogEntry> {
        self.by_tunnel.iter().find_map(|entries| {
            entries
                .iter()
                .rev()
                .find(|e| e.request_id == request_id)
                .cloned()
        })
    }

    fn recent(&self, tunnel_id: &str, limit: usize) -> Vec<RequestLogEntry> {
        self.by_tunnel
            .get(tunnel_id)
            .map(|entries| entries.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    fn purge_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        self.by_tunnel.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|e| e.timestamp >= cutoff);
            removed += before - entries.len();
            !entries.is_empty()
        });
        removed
    }
}

const STATIC_ASSET_EXTENSIONS: &[&str] = &[
    ".js", ".mjs", ".css", ".map", ".png", ".jpg", ".jpeg", ".gif", ".svg", ".ico", ".webp",
    ".avif", ".woff", ".woff2", ".ttf", ".otf", ".eot",
];

const FRAMEWORK_PATH_PREFIXES: &[&str] = &[
    "/_next/",
    "/__nextjs",
    "/@vite/",
    "/@fs/",
    "/@id/",
    "/__vite_ping",
    "/node_modules/",
    "/sockjs-node",
];

/// Whether a request path is noise (static assets, dev-server internals)
pub fn is_static_asset(path: &str) -> bool {
    let path = path.split_once('?').map_or(path, |(p, _)| p);
    let lower = path.to_ascii_lowercase();

    FRAMEWORK_PATH_PREFIXES.iter().any(|p| lower.starts_with(p))
        || STATIC_ASSET_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(tunnel_id: &str, request_id: &str, age_hours: i64) -> RequestLogEntry {
        RequestLogEntry {
            request_id: request_id.to_string(),
            tunnel_id: tunnel_id.to_string(),
            method: "GET".to_string(),
            path: "/".to_string(),
            status: 200,
            duration_ms: 3,
            timestamp: Utc::now() - Duration::hours(age_hours),
            headers: None,
            body: None,
            query: None,
            body_omitted: false,
            replay_of: None,
        }
    }

    #[test]
    fn test_recent_is_newest_first() {
        let store = InMemoryLogStore::new(10);
        for i in 0..5 {
            store.append(entry("tunnel-1", &format!("req-{}", i), 0));
        }
        store.append(entry("tunnel-2", "other", 0));

        let ids: Vec<_> = store
            .recent("tunnel-1", 3)
            .into_iter()
            .map(|e| e.request_id)
            .collect();
        assert_eq!(ids, vec!["req-4", "req-3", "req-2"]);
        assert!(store.recent("tunnel-x", 10).is_empty());
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let store = InMemoryLogStore::new(2);
        store.append(entry("tunnel-1", "req-1", 0));
        store.append(entry("tunnel-1", "req-2", 0));
        store.append(entry("tunnel-1", "req-3", 0));

        assert_eq!(store.len(), 2);
        assert!(store.find("req-1").is_none());
        assert!(store.find("req-3").is_some());
    }

    #[test]
    fn test_find_across_tunnels() {
        let store = InMemoryLogStore::new(10);
        store.append(entry("tunnel-1", "req-1", 0));
        store.append(entry("tunnel-2", "req-2", 0));

        assert_eq!(store.find("req-2").unwrap().tunnel_id, "tunnel-2");
        assert!(store.find("missing").is_none());
    }

    #[test]
    fn test_purge_older_than() {
        let store = InMemoryLogStore::new(10);
        store.append(entry("tunnel-1", "old", 80));
        store.append(entry("tunnel-1", "fresh", 1));
        store.append(entry("tunnel-2", "old-2", 100));

        let removed = store.purge_older_than(Utc::now() - Duration::hours(72));

        assert_eq!(removed, 2);
        assert_eq!(store.len(), 1);
        assert!(store.find("fresh").is_some());
        assert!(store.recent("tunnel-2", 10).is_empty());
    }

    #[test]
    fn test_is_static_asset() {
        assert!(is_static_asset("/static/app.js"));
        assert!(is_static_asset("/styles/main.CSS"));
        assert!(is_static_asset("/favicon.ico"));
        assert!(is_static_asset("/_next/data/build/index.json"));
        assert!(is_static_asset("/@vite/client"));
        assert!(is_static_asset("/logo.png?v=3"));

        assert!(!is_static_asset("/"));
        assert!(!is_static_asset("/api/users"));
        assert!(!is_static_asset("/api/report.json"));
    }
}
