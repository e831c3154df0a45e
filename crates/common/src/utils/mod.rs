mod encoding;
mod headers;
mod id;
mod time;

pub use encoding::{decode_body, encode_body};
pub use headers::{
    REQUEST_HOP_BY_HOP_HEADERS, RESPONSE_HOP_BY_HOP_HEADERS, headers_to_map, map_to_headers,
    strip_request_headers, strip_response_headers,
};
pub use id::{generate_connection_id, generate_request_id, generate_tunnel_id};
pub use time::{current_timestamp_millis, elapsed_millis, retention_cutoff};
