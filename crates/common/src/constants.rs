/// Upper bound on a relayed round-trip before the caller sees a 504 (60 seconds)
pub const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Maximum request/response body size (50 MB)
pub const MAX_BODY_SIZE_BYTES: usize = 50 * 1024 * 1024;

/// Room for the JSON envelope around a base64 body in one WebSocket message
pub const WS_ENVELOPE_OVERHEAD_BYTES: usize = 64 * 1024;

/// Largest WebSocket message needed to carry a body of `max_body_size`
/// bytes: the base64-expanded body plus its envelope
///
/// Both ends of a tunnel connection must accept messages of this size.
pub const fn max_ws_message_size(max_body_size: usize) -> usize {
    max_body_size.div_ceil(3) * 4 + WS_ENVELOPE_OVERHEAD_BYTES
}

/// Frames queued per host connection before dispatch fails fast
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Log entries buffered per viewer group before slow viewers start losing entries
pub const VIEWER_QUEUE_CAPACITY: usize = 256;

/// Time a fresh connection has to send its `register` frame (10 seconds)
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Consecutive unparsable frames tolerated before a connection is closed
pub const MAX_CONSECUTIVE_MALFORMED_FRAMES: u32 = 5;

/// Heartbeat interval used by the host agent (30 seconds)
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Request log retention window (3 days)
pub const LOG_RETENTION_SECS: i64 = 3 * 24 * 60 * 60;

/// How often the retention sweep runs (1 hour)
pub const LOG_CLEANUP_INTERVAL_SECS: u64 = 3600;

/// Log entries kept in memory per tunnel
pub const LOG_CAPACITY_PER_TUNNEL: usize = 1000;

/// Larger request bodies are not kept in the request log
pub const MAX_LOGGED_BODY_BYTES: usize = 1024 * 1024;

/// Default and maximum page sizes of the log query API
pub const DEFAULT_LOG_PAGE_SIZE: usize = 50;
pub const MAX_LOG_PAGE_SIZE: usize = 100;

/// Lifetime of the tunnel selection cookie (1 day)
pub const TUNNEL_COOKIE_MAX_AGE_SECS: u64 = 86_400;

/// Query parameter, header and cookie names used to select a tunnel
pub const TUNNEL_ID_QUERY_PARAM: &str = "tunnel_id";
pub const TUNNEL_ID_HEADER: &str = "x-tunnel-id";
pub const TUNNEL_ID_COOKIE: &str = "tunnel_id";

/// Minimum delay for exponential backoff reconnection (1 second)
pub const RECONNECT_MIN_DELAY_MS: u64 = 1000;

/// Maximum delay for exponential backoff reconnection (60 seconds)
pub const RECONNECT_MAX_DELAY_MS: u64 = 60000;

/// Multiplier for exponential backoff reconnection
pub const RECONNECT_MULTIPLIER: f64 = 2.0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_values() {
        const _: () = assert!(HEARTBEAT_INTERVAL_SECS < REQUEST_TIMEOUT_SECS);
        const _: () = assert!(HANDSHAKE_TIMEOUT_SECS < REQUEST_TIMEOUT_SECS);
        const _: () = assert!(DEFAULT_LOG_PAGE_SIZE <= MAX_LOG_PAGE_SIZE);
        const _: () = assert!(MAX_LOG_PAGE_SIZE <= LOG_CAPACITY_PER_TUNNEL);
        const _: () = assert!(MAX_LOGGED_BODY_BYTES < MAX_BODY_SIZE_BYTES);
        const _: () = assert!(RECONNECT_MIN_DELAY_MS < RECONNECT_MAX_DELAY_MS);
        const _: () = assert!(RECONNECT_MULTIPLIER > 1.0);

        assert_eq!(MAX_BODY_SIZE_BYTES, 50 * 1024 * 1024);
        assert_eq!(max_ws_message_size(3), 4 + WS_ENVELOPE_OVERHEAD_BYTES);
        assert_eq!(max_ws_message_size(4), 8 + WS_ENVELOPE_OVERHEAD_BYTES);
        assert_eq!(LOG_RETENTION_SECS, 259_200);
    }
}
