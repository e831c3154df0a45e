//! Request log query API used by the dashboard

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use tunnelhub_common::RequestLogEntry;
use tunnelhub_common::constants::{DEFAULT_LOG_PAGE_SIZE, MAX_LOG_PAGE_SIZE};
use tunnelhub_common::validation::validate_tunnel_id;

use crate::AppState;
use crate::auth::authorize;
use crate::error_handling::ApiError;

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    pub limit: Option<usize>,
}

impl LogQuery {
    /// Requested page size, clamped to 1..=100
    pub fn page_size(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_LOG_PAGE_SIZE)
            .clamp(1, MAX_LOG_PAGE_SIZE)
    }
}

#[derive(Debug, Serialize)]
pub struct LogPage {
    pub tunnel_id: String,
    pub logs: Vec<RequestLogEntry>,
}

/// `GET /api/logs/{tunnel_id}`: newest entries first
///
/// While the tunnel is connected with a password, the same Basic credentials
/// as for its public traffic are required.
pub async fn list_logs(
    State(state): State<AppState>,
    Path(tunnel_id): Path<String>,
    Query(query): Query<LogQuery>,
    headers: HeaderMap,
) -> Result<Json<LogPage>, ApiError> {
    validate_tunnel_id(&tunnel_id).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    if let Some(registration) = state.registry.lookup(&tunnel_id) {
        authorize(&registration, &headers).await?;
    }

    let logs = state.logs.recent(&tunnel_id, query.page_size());
    debug!("Returning {} log entries for tunnel {}", logs.len(), tunnel_id);

    Ok(Json(LogPage { tunnel_id, logs }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_clamp() {
        assert_eq!(LogQuery::default().page_size(), 50);
        assert_eq!(LogQuery { limit: Some(0) }.page_size(), 1);
        assert_eq!(LogQuery { limit: Some(20) }.page_size(), 20);
        assert_eq!(LogQuery { limit: Some(500) }.page_size(), 100);
    }
}
