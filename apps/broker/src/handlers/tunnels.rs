//! Tunnel listing and health check

use axum::Json;
use axum::extract::State;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::AppState;

/// Public view of a connected tunnel; never carries the password hash
#[derive(Debug, Serialize)]
pub struct TunnelSummary {
    pub tunnel_id: String,
    pub public_url: String,
    pub password_protected: bool,
    pub connected_at: DateTime<Utc>,
    pub viewers: usize,
}

/// `GET /api/tunnels`
pub async fn list_tunnels(State(state): State<AppState>) -> Json<Vec<TunnelSummary>> {
    let tunnels = state
        .registry
        .list()
        .into_iter()
        .map(|registration| TunnelSummary {
            public_url: state.config.tunnel_url(&registration.tunnel_id),
            password_protected: registration.is_protected(),
            connected_at: registration.connected_at,
            viewers: state
                .connections
                .viewers()
                .viewer_count(&registration.tunnel_id),
            tunnel_id: registration.tunnel_id,
        })
        .collect();

    Json(tunnels)
}

/// `GET /health`
pub async fn health() -> &'static str {
    "OK"
}
