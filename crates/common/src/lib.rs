//! Common utilities and types for tunnelhub
//!
//! This crate provides the wire protocol, frames and helpers shared by the
//! broker (public ingress + relay) and the host agent.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod utils;
pub mod validation;

// Re-export commonly used types for convenience
pub use error::{Result, TunnelError};
pub use protocol::{
    Body, ErrorCode, Handshake, Message, RequestFrame, RequestLogEntry, ResponseFrame, Role,
};
pub use utils::{
    current_timestamp_millis, decode_body, encode_body, generate_connection_id,
    generate_request_id, generate_tunnel_id, headers_to_map, map_to_headers,
    strip_request_headers, strip_response_headers,
};
