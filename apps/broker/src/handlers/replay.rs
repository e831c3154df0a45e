//! Replay of a logged request through the live relay path

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use chrono::Utc;
use serde::Serialize;
use std::time::Instant;
use tracing::info;
use tunnelhub_common::utils::elapsed_millis;
use tunnelhub_common::validation::validate_request_id;
use tunnelhub_common::{RequestLogEntry, current_timestamp_millis, generate_request_id};

use crate::AppState;
use crate::auth::authorize;
use crate::error_handling::{ApiError, RelayError};

#[derive(Debug, Serialize)]
pub struct ReplayResult {
    pub request_id: String,
    pub replay_of: String,
    pub status: u16,
    pub duration_ms: u64,
}

/// `POST /api/replay/{request_id}`
///
/// Re-sends the logged request under a fresh request ID and records the
/// outcome as a new log entry pointing back at the original.
pub async fn handle_replay(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ReplayResult>, ApiError> {
    validate_request_id(&request_id).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let original = state
        .logs
        .find(&request_id)
        .ok_or_else(|| ApiError::NotFound(format!("Request {} not found", request_id)))?;

    if original.body_omitted {
        return Err(ApiError::BadRequest(format!(
            "Request {} had a body too large to keep and cannot be replayed",
            request_id
        )));
    }

    let registration = state
        .registry
        .lookup(&original.tunnel_id)
        .ok_or_else(|| RelayError::TunnelNotConnected(original.tunnel_id.clone()))?;
    authorize(&registration, &headers).await?;

    let replay_id = generate_request_id();
    let frame = original.to_request_frame(replay_id.clone(), current_timestamp_millis());

    let start = Instant::now();
    let outcome = state.relay.relay_default(&original.tunnel_id, frame).await;
    let duration_ms = elapsed_millis(start);
    let status = match &outcome {
        Ok(response) => response.status_code,
        Err(e) => e.status_code().as_u16(),
    };

    info!(
        tunnel_id = %original.tunnel_id,
        request_id = %replay_id,
        replay_of = %request_id,
        status,
        duration_ms,
        "Replayed request"
    );

    state.record(RequestLogEntry {
        request_id: replay_id.clone(),
        status,
        duration_ms,
        timestamp: Utc::now(),
        replay_of: Some(request_id.clone()),
        ..original
    });

    outcome?;
    Ok(Json(ReplayResult {
        request_id: replay_id,
        replay_of: request_id,
        status,
        duration_ms,
    }))
}
