//! Tunnel relay broker
//!
//! Public HTTP requests are matched to a tunnel, relayed to the host that owns
//! it over that host's WebSocket, and answered with whatever the host returns.
//! Viewers of a tunnel receive a summary of every relayed request.

use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;
use tunnelhub_common::RequestLogEntry;

pub mod auth;
pub mod config;
pub mod connection;
pub mod error_handling;
pub mod handlers;
pub mod logs;
pub mod pending;
pub mod registry;
pub mod relay;

use config::BrokerConfig;
use connection::ConnectionManager;
use logs::{InMemoryLogStore, LogStore};
use pending::PendingRequestTable;
use registry::TunnelRegistry;
use relay::RelayBroker;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BrokerConfig>,
    pub registry: Arc<TunnelRegistry>,
    pub relay: RelayBroker,
    pub connections: Arc<ConnectionManager>,
    pub logs: Arc<dyn LogStore>,
}

impl AppState {
    pub fn new(config: BrokerConfig) -> Self {
        let logs = Arc::new(InMemoryLogStore::new(config.log_capacity));
        Self::with_log_store(config, logs)
    }

    pub fn with_log_store(config: BrokerConfig, logs: Arc<dyn LogStore>) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(TunnelRegistry::new());
        let pending = Arc::new(PendingRequestTable::new());
        let relay = RelayBroker::new(registry.clone(), pending.clone(), config.request_timeout);
        let connections = Arc::new(ConnectionManager::new(
            config.clone(),
            registry.clone(),
            pending,
        ));

        Self {
            config,
            registry,
            relay,
            connections,
            logs,
        }
    }

    /// Publish a finished request to viewers and the log store
    pub fn record(&self, entry: RequestLogEntry) {
        self.connections.broadcast_log(&entry.tunnel_id, &entry);
        self.logs.append(entry);
    }
}

/// All broker routes; anything unmatched is public tunnel traffic
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(handlers::handle_connect))
        .route("/health", get(handlers::health))
        .route("/api/tunnels", get(handlers::list_tunnels))
        .route("/api/logs/{tunnel_id}", get(handlers::list_logs))
        .route("/api/replay/{request_id}", post(handlers::handle_replay))
        .fallback(handlers::handle_forwarding)
        .with_state(state)
}
