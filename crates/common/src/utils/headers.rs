use http::{HeaderMap, HeaderName, HeaderValue, header::SET_COOKIE};
use std::collections::HashMap;

/// Headers removed from requests before they are relayed to a host
pub const REQUEST_HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "upgrade",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
];

/// Headers removed from responses before they are written back to the caller
pub const RESPONSE_HOP_BY_HOP_HEADERS: &[&str] = &[
    "content-encoding",
    "content-length",
    "connection",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
];

const SET_COOKIE_SEPARATOR: &str = "\n";
const VALUE_SEPARATOR: &str = ", ";

/// Flatten HTTP headers into the wire format
///
/// Keys are lower-cased. Repeated headers are joined with ", ", except
/// `set-cookie` which is joined with '\n' so it can be split back apart.
pub fn headers_to_map(headers: &HeaderMap) -> HashMap<String, String> {
    let mut map: HashMap<String, String> = HashMap::new();

    for (name, value) in headers.iter() {
        let val = String::from_utf8_lossy(value.as_bytes());
        let separator = if *name == SET_COOKIE {
            SET_COOKIE_SEPARATOR
        } else {
            VALUE_SEPARATOR
        };

        map.entry(name.as_str().to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(separator);
                existing.push_str(&val);
            })
            .or_insert_with(|| val.into_owned());
    }

    map
}

/// Convert the wire format back into an HTTP HeaderMap
///
/// Invalid names or values are skipped.
pub fn map_to_headers(map: &HashMap<String, String>) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (name, value) in map.iter() {
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };

        if header_name == SET_COOKIE {
            for cookie in value.split(SET_COOKIE_SEPARATOR).filter(|c| !c.is_empty()) {
                if let Ok(header_value) = HeaderValue::from_str(cookie) {
                    headers.append(header_name.clone(), header_value);
                }
            }
        } else if let Ok(header_value) = HeaderValue::from_str(value) {
            headers.append(header_name, header_value);
        }
    }

    headers
}

fn strip(map: &mut HashMap<String, String>, names: &[&str]) {
    map.retain(|key, _| !names.iter().any(|n| key.eq_ignore_ascii_case(n)));
}

/// Remove request hop-by-hop headers in place
pub fn strip_request_headers(map: &mut HashMap<String, String>) {
    strip(map, REQUEST_HOP_BY_HOP_HEADERS);
}

/// Remove response hop-by-hop headers in place
pub fn strip_response_headers(map: &mut HashMap<String, String>) {
    strip(map, RESPONSE_HOP_BY_HOP_HEADERS);
}
