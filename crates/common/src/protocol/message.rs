use serde::{Deserialize, Serialize};
use std::fmt;

use super::{RequestFrame, RequestLogEntry, ResponseFrame};

/// All WebSocket messages are wrapped in this typed envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Control plane messages
    Ping,
    Pong,

    /// First frame of every connection
    Register(Handshake),

    /// Connection lifecycle
    ConnectionEstablished {
        connection_id: String,
        tunnel_id: String,
        role: Role,
        public_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dashboard_url: Option<String>,
        #[serde(default)]
        password_protected: bool,
    },

    /// Data plane messages
    HttpRequest(RequestFrame),
    HttpResponse(ResponseFrame),

    /// Viewer stream
    RequestLog(RequestLogEntry),

    /// Error handling
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        code: ErrorCode,
        message: String,
    },
}

impl Message {
    /// Short label used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Ping => "ping",
            Message::Pong => "pong",
            Message::Register(_) => "register",
            Message::ConnectionEstablished { .. } => "connection_established",
            Message::HttpRequest(_) => "http_request",
            Message::HttpResponse(_) => "http_response",
            Message::RequestLog(_) => "request_log",
            Message::Error { .. } => "error",
        }
    }

    pub fn error(request_id: Option<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Message::Error {
            request_id,
            code,
            message: message.into(),
        }
    }
}

/// What a connection declares itself to be during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Host,
    Viewer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host => f.write_str("host"),
            Role::Viewer => f.write_str("viewer"),
        }
    }
}

/// Payload of the `register` frame
#[derive(Clone, Serialize, Deserialize)]
pub struct Handshake {
    pub tunnel_id: String,
    pub role: Role,
    /// Only meaningful for hosts; an empty string is treated as no password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Handshake {
    pub fn host(tunnel_id: impl Into<String>, password: Option<String>) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            role: Role::Host,
            password,
        }
    }

    pub fn viewer(tunnel_id: impl Into<String>) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            role: Role::Viewer,
            password: None,
        }
    }

    /// The password, if one was given and is non-empty
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref().filter(|p| !p.is_empty())
    }
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("tunnel_id", &self.tunnel_id)
            .field("role", &self.role)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Error codes for tunnel operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    Timeout,
    LocalServiceUnavailable,
    InternalError,
    TunnelConflict,
    MalformedFrame,
    PayloadTooLarge,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::Timeout => "timeout",
            ErrorCode::LocalServiceUnavailable => "local_service_unavailable",
            ErrorCode::InternalError => "internal_error",
            ErrorCode::TunnelConflict => "tunnel_conflict",
            ErrorCode::MalformedFrame => "malformed_frame",
            ErrorCode::PayloadTooLarge => "payload_too_large",
        }
    }

    /// HTTP status used when a host answers a request with this error
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::InvalidRequest => 400,
            ErrorCode::LocalServiceUnavailable => 503,
            ErrorCode::Timeout => 504,
            _ => 502,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
