//! WebSocket endpoint for hosts and viewers

use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::Response;
use tracing::debug;

use crate::AppState;

/// Upgrade and hand the socket to the connection manager
pub async fn handle_connect(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let max_message = state.config.max_ws_message_size();
    debug!("Upgrading WebSocket connection (max message {} bytes)", max_message);

    let manager = state.connections.clone();
    ws.max_message_size(max_message)
        .max_frame_size(max_message)
        .on_upgrade(move |socket| manager.handle_socket(socket))
}
