//! Lifecycle of host and viewer connections
//!
//! Every accepted WebSocket runs the same state machine:
//!
//! ```text
//! Connecting ──register(host)──▶ HostRegistered ──┐
//!     │      ──register(viewer)▶ ViewerJoined ────┼──▶ Closed
//!     └──────conflict / bad handshake──▶ Rejected ┘
//! ```
//!
//! The decisions (admission, frame routing, teardown) live in plain methods so
//! they can be exercised without a socket; `handle_socket` is the transport
//! adapter around them.

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, close_code};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use tunnelhub_common::{
    ErrorCode, Handshake, Message, RequestLogEntry, ResponseFrame, Role, generate_connection_id,
    validation::validate_tunnel_id,
};

use crate::auth::hash_password_blocking;
use crate::config::BrokerConfig;
use crate::error_handling::RelayError;
use crate::pending::PendingRequestTable;
use crate::registry::{ConnectionHandle, TunnelRegistration, TunnelRegistry};

/// Per-connection state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    HostRegistered { tunnel_id: String },
    ViewerJoined { tunnel_id: String },
    Rejected { code: ErrorCode },
    Closed,
}

impl ConnectionState {
    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, HostRegistered { .. })
                | (Connecting, ViewerJoined { .. })
                | (Connecting, Rejected { .. })
                | (Connecting, Closed)
                | (HostRegistered { .. }, Closed)
                | (ViewerJoined { .. }, Closed)
                | (Rejected { .. }, Closed)
        )
    }
}

/// State holder that logs every transition
#[derive(Debug)]
struct Connection {
    id: String,
    state: ConnectionState,
}

impl Connection {
    fn new() -> Self {
        Self {
            id: generate_connection_id(),
            state: ConnectionState::Connecting,
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if !self.state.can_transition_to(&next) {
            warn!(
                "Connection {}: unexpected transition {:?} -> {:?}",
                self.id, self.state, next
            );
        }
        debug!("Connection {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }
}

/// Why a connection was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub code: ErrorCode,
    pub message: String,
}

impl Rejection {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<RelayError> for Rejection {
    fn from(e: RelayError) -> Self {
        let code = match e {
            RelayError::TunnelConflict(_) => ErrorCode::TunnelConflict,
            RelayError::MalformedFrame(_) => ErrorCode::MalformedFrame,
            RelayError::PayloadTooLarge(..) => ErrorCode::PayloadTooLarge,
            _ => ErrorCode::InternalError,
        };
        Self::new(code, e.to_string())
    }
}

/// Result of a successful handshake
#[derive(Debug)]
pub enum Admission {
    Host {
        handle: ConnectionHandle,
        outbound: mpsc::Receiver<Message>,
        password_protected: bool,
    },
    Viewer {
        tunnel_id: String,
        logs: broadcast::Receiver<RequestLogEntry>,
    },
}

/// Fan-out groups of viewers, one bounded broadcast channel per tunnel
#[derive(Debug)]
pub struct ViewerHub {
    capacity: usize,
    groups: DashMap<String, broadcast::Sender<RequestLogEntry>>,
}

impl ViewerHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            groups: DashMap::new(),
        }
    }

    pub fn subscribe(&self, tunnel_id: &str) -> broadcast::Receiver<RequestLogEntry> {
        self.groups
            .entry(tunnel_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Send to every viewer of `tunnel_id`; returns how many received it
    pub fn broadcast(&self, tunnel_id: &str, entry: RequestLogEntry) -> usize {
        match self.groups.get(tunnel_id) {
            Some(tx) => tx.send(entry).unwrap_or(0),
            None => 0,
        }
    }

    /// Drop the group once its last viewer has left
    pub fn release(&self, tunnel_id: &str) {
        self.groups
            .remove_if(tunnel_id, |_, tx| tx.receiver_count() == 0);
    }

    pub fn viewer_count(&self, tunnel_id: &str) -> usize {
        self.groups
            .get(tunnel_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

/// Owns the lifecycle of every transport connection
#[derive(Debug)]
pub struct ConnectionManager {
    config: Arc<BrokerConfig>,
    registry: Arc<TunnelRegistry>,
    pending: Arc<PendingRequestTable>,
    viewers: ViewerHub,
}

impl ConnectionManager {
    pub fn new(
        config: Arc<BrokerConfig>,
        registry: Arc<TunnelRegistry>,
        pending: Arc<PendingRequestTable>,
    ) -> Self {
        let viewers = ViewerHub::new(config.viewer_queue_capacity);
        Self {
            config,
            registry,
            pending,
            viewers,
        }
    }

    pub fn viewers(&self) -> &ViewerHub {
        &self.viewers
    }

    /// Decide what a connection becomes after its `register` frame
    pub async fn admit(
        &self,
        connection_id: &str,
        handshake: Handshake,
    ) -> Result<Admission, Rejection> {
        validate_tunnel_id(&handshake.tunnel_id)
            .map_err(|e| Rejection::new(ErrorCode::InvalidRequest, e.to_string()))?;

        match handshake.role {
            Role::Viewer => {
                info!(
                    "Viewer {} joined tunnel {}",
                    connection_id, handshake.tunnel_id
                );
                let logs = self.viewers.subscribe(&handshake.tunnel_id);
                Ok(Admission::Viewer {
                    tunnel_id: handshake.tunnel_id,
                    logs,
                })
            }
            Role::Host => {
                let password_hash = match handshake.password() {
                    Some(password) => Some(
                        hash_password_blocking(password.to_string())
                            .await
                            .map_err(|e| {
                                warn!("Failed to hash password for {}: {:#}", connection_id, e);
                                Rejection::new(ErrorCode::InternalError, "Registration failed")
                            })?,
                    ),
                    None => None,
                };

                let (handle, outbound) = ConnectionHandle::new(
                    connection_id,
                    &handshake.tunnel_id,
                    self.config.outbound_queue_capacity,
                );
                let registration = TunnelRegistration::new(handle.clone(), password_hash);
                let password_protected = registration.is_protected();

                self.registry.register(registration)?;

                Ok(Admission::Host {
                    handle,
                    outbound,
                    password_protected,
                })
            }
        }
    }

    /// Route one text frame received from a host
    ///
    /// Returns a frame to send back, if any.
    pub fn on_host_message(
        &self,
        handle: &ConnectionHandle,
        text: &str,
    ) -> Result<Option<Message>, RelayError> {
        let message: Message =
            serde_json::from_str(text).map_err(|e| RelayError::MalformedFrame(e.to_string()))?;

        match message {
            Message::HttpResponse(response) => {
                debug!(
                    tunnel_id = handle.tunnel_id(),
                    request_id = %response.request_id,
                    status = response.status_code,
                    "Response from host"
                );
                self.pending.resolve_from(handle.connection_id(), response);
                Ok(None)
            }
            Message::Error {
                request_id: Some(request_id),
                code,
                message,
            } => {
                debug!(
                    tunnel_id = handle.tunnel_id(),
                    %request_id,
                    %code,
                    "Host failed request: {}",
                    message
                );
                let response = ResponseFrame::from_error(request_id, code, &message);
                self.pending.resolve_from(handle.connection_id(), response);
                Ok(None)
            }
            Message::Error {
                request_id: None,
                code,
                message,
            } => {
                warn!(
                    "Host of tunnel {} reported {}: {}",
                    handle.tunnel_id(),
                    code,
                    message
                );
                Ok(None)
            }
            Message::Ping => Ok(Some(Message::Pong)),
            Message::Pong => Ok(None),
            other => Err(RelayError::MalformedFrame(format!(
                "unexpected {} frame from host",
                other.kind()
            ))),
        }
    }

    /// Forget a host connection: no new requests reach it, in-flight ones fail
    ///
    /// Must run after the connection's outbound receiver is gone, so a request
    /// racing with teardown either fails dispatch or is failed here.
    pub fn teardown(&self, handle: &ConnectionHandle) {
        let unregistered = self.registry.unregister(handle);
        let failed = self
            .pending
            .fail_connection(handle.connection_id(), RelayError::HostDisconnected);

        info!(
            "Host {} for tunnel {} disconnected (unregistered: {}, failed in-flight: {})",
            handle.connection_id(),
            handle.tunnel_id(),
            unregistered,
            failed
        );
    }

    /// Fan a log entry out to the viewers of `tunnel_id`
    ///
    /// Never blocks; viewers that fall behind lose entries.
    pub fn broadcast_log(&self, tunnel_id: &str, entry: &RequestLogEntry) {
        let delivered = self.viewers.broadcast(tunnel_id, entry.summary());
        if delivered > 0 {
            debug!(
                "Log {} delivered to {} viewer(s) of {}",
                entry.request_id, delivered, tunnel_id
            );
        }
    }

    /// Transport adapter: drive one accepted WebSocket to completion
    pub async fn handle_socket(self: Arc<Self>, mut socket: WebSocket) {
        let mut conn = Connection::new();

        let handshake = match self.read_handshake(&mut socket).await {
            Ok(handshake) => handshake,
            Err(rejection) => {
                self.reject(&mut conn, &mut socket, rejection).await;
                return;
            }
        };

        match self.admit(&conn.id, handshake).await {
            Ok(Admission::Host {
                handle,
                outbound,
                password_protected,
            }) => {
                conn.transition(ConnectionState::HostRegistered {
                    tunnel_id: handle.tunnel_id().to_string(),
                });

                let established = Message::ConnectionEstablished {
                    connection_id: conn.id.clone(),
                    tunnel_id: handle.tunnel_id().to_string(),
                    role: Role::Host,
                    public_url: self.config.tunnel_url(handle.tunnel_id()),
                    dashboard_url: Some(self.dashboard_url(handle.tunnel_id())),
                    password_protected,
                };

                if send(&mut socket, &established).await {
                    self.run_host(socket, &handle, outbound).await;
                } else {
                    drop(outbound);
                }
                self.teardown(&handle);
            }
            Ok(Admission::Viewer { tunnel_id, logs }) => {
                conn.transition(ConnectionState::ViewerJoined {
                    tunnel_id: tunnel_id.clone(),
                });

                let established = Message::ConnectionEstablished {
                    connection_id: conn.id.clone(),
                    tunnel_id: tunnel_id.clone(),
                    role: Role::Viewer,
                    public_url: self.config.tunnel_url(&tunnel_id),
                    dashboard_url: None,
                    password_protected: false,
                };

                if send(&mut socket, &established).await {
                    self.run_viewer(socket, &conn.id, logs).await;
                } else {
                    drop(logs);
                }
                self.viewers.release(&tunnel_id);
                debug!("Viewer {} left tunnel {}", conn.id, tunnel_id);
            }
            Err(rejection) => {
                self.reject(&mut conn, &mut socket, rejection).await;
                return;
            }
        }

        conn.transition(ConnectionState::Closed);
    }

    async fn read_handshake(&self, socket: &mut WebSocket) -> Result<Handshake, Rejection> {
        let deadline = self.config.handshake_timeout;

        let first_frame = tokio::time::timeout(deadline, async {
            loop {
                match socket.recv().await {
                    Some(Ok(WsMessage::Text(text))) => return Some(text),
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
                    _ => return None,
                }
            }
        })
        .await
        .map_err(|_| {
            Rejection::new(
                ErrorCode::Timeout,
                format!("No register frame within {}s", deadline.as_secs()),
            )
        })?;

        let text = first_frame
            .ok_or_else(|| Rejection::new(ErrorCode::InvalidRequest, "Expected a register frame"))?;

        match serde_json::from_str::<Message>(text.as_str()) {
            Ok(Message::Register(handshake)) => Ok(handshake),
            Ok(other) => Err(Rejection::new(
                ErrorCode::InvalidRequest,
                format!("Expected a register frame, got {}", other.kind()),
            )),
            Err(e) => Err(Rejection::new(ErrorCode::MalformedFrame, e.to_string())),
        }
    }

    async fn reject(&self, conn: &mut Connection, socket: &mut WebSocket, rejection: Rejection) {
        warn!(
            "Rejecting connection {}: {} ({})",
            conn.id, rejection.message, rejection.code
        );
        conn.transition(ConnectionState::Rejected {
            code: rejection.code,
        });

        let frame = Message::error(None, rejection.code, rejection.message);
        if send(socket, &frame).await {
            let _ = socket
                .send(WsMessage::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: rejection.code.as_str().into(),
                })))
                .await;
        }

        conn.transition(ConnectionState::Closed);
    }

    async fn run_host(
        &self,
        socket: WebSocket,
        handle: &ConnectionHandle,
        mut outbound: mpsc::Receiver<Message>,
    ) {
        let (mut sink, mut stream) = socket.split();

        let connection_id = handle.connection_id().to_string();
        let mut writer = tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                let Some(frame) = encode(&message) else {
                    continue;
                };
                if let Err(e) = sink.send(frame).await {
                    debug!("Write to {} failed: {}", connection_id, e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let mut writer_done = false;
        let mut malformed = 0u32;

        loop {
            tokio::select! {
                _ = &mut writer => {
                    writer_done = true;
                    break;
                }
                frame = stream.next() => {
                    let outcome = match frame {
                        Some(Ok(WsMessage::Text(text))) => self.on_host_message(handle, text.as_str()),
                        Some(Ok(WsMessage::Binary(_))) => {
                            Err(RelayError::MalformedFrame("binary frames are not supported".into()))
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            debug!("Read from {} failed: {}", handle.connection_id(), e);
                            break;
                        }
                    };

                    match outcome {
                        Ok(reply) => {
                            malformed = 0;
                            if let Some(reply) = reply {
                                if let Err(e) = handle.dispatch(reply) {
                                    debug!("Dropping reply to {}: {}", handle.connection_id(), e);
                                }
                            }
                        }
                        Err(e) => {
                            malformed += 1;
                            warn!(
                                "Malformed frame {}/{} from tunnel {}: {}",
                                malformed,
                                self.config.max_malformed_frames,
                                handle.tunnel_id(),
                                e
                            );
                            if malformed >= self.config.max_malformed_frames {
                                warn!(
                                    "Closing connection {}: too many malformed frames",
                                    handle.connection_id()
                                );
                                break;
                            }
                        }
                    }
                }
            }
        }

        // The outbound receiver must be gone before teardown
        if !writer_done {
            writer.abort();
            let _ = writer.await;
        }
    }

    async fn run_viewer(
        &self,
        socket: WebSocket,
        connection_id: &str,
        mut logs: broadcast::Receiver<RequestLogEntry>,
    ) {
        let (mut sink, mut stream) = socket.split();

        loop {
            tokio::select! {
                entry = logs.recv() => match entry {
                    Ok(entry) => {
                        let Some(frame) = encode(&Message::RequestLog(entry)) else {
                            continue;
                        };
                        if sink.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Viewer {} fell behind, dropped {} log entries", connection_id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Ok(Message::Ping) = serde_json::from_str::<Message>(text.as_str()) {
                            let Some(pong) = encode(&Message::Pong) else { continue };
                            if sink.send(pong).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    fn dashboard_url(&self, tunnel_id: &str) -> String {
        format!("{}/dashboard/{}", self.config.web_url, tunnel_id)
    }
}

fn encode(message: &Message) -> Option<WsMessage> {
    match serde_json::to_string(message) {
        Ok(json) => Some(WsMessage::Text(json.into())),
        Err(e) => {
            warn!("Failed to serialize {} frame: {}", message.kind(), e);
            None
        }
    }
}

async fn send(socket: &mut WebSocket, message: &Message) -> bool {
    match encode(message) {
        Some(frame) => socket.send(frame).await.is_ok(),
        None => false,
    }
}
