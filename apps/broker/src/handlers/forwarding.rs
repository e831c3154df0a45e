//! ForwardingHandler - public HTTP ingress
//!
//! Every request that does not hit a broker route lands here. The handler
//! works out which tunnel the request is for, checks the tunnel's password,
//! relays the request to the tunnel's host and writes the host's answer back.
//!
//! Tunnel selection, first match wins:
//! 1. `?tunnel_id=` query parameter: remembered in a cookie, then the caller is
//!    redirected to the same URL without the parameter
//! 2. `X-Tunnel-Id` header
//! 3. `tunnel_id` cookie
//!
//! Callers without a tunnel, or with a tunnel that is not connected, are sent
//! to the entry page of the web frontend.

use axum::body::Body as HttpBody;
use axum::extract::{Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::StreamExt;
use std::time::Instant;
use tracing::{debug, info};
use tunnelhub_common::constants::{
    MAX_LOGGED_BODY_BYTES, TUNNEL_COOKIE_MAX_AGE_SECS, TUNNEL_ID_COOKIE, TUNNEL_ID_HEADER,
    TUNNEL_ID_QUERY_PARAM,
};
use tunnelhub_common::utils::elapsed_millis;
use tunnelhub_common::validation::{validate_path, validate_tunnel_id};
use tunnelhub_common::{
    Body, RequestFrame, RequestLogEntry, ResponseFrame, current_timestamp_millis,
    generate_request_id, headers_to_map, map_to_headers, strip_request_headers,
    strip_response_headers,
};
use url::form_urlencoded;

use crate::AppState;
use crate::auth::authorize;
use crate::error_handling::{ApiError, RelayError};
use crate::logs::is_static_asset;
use crate::registry::TunnelRegistration;

/// Headers never copied into the request log
const UNLOGGED_HEADERS: &[&str] = &["authorization", "proxy-authorization", "cookie"];

/// Where the tunnel ID of a request came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelSelection {
    /// Query parameter; `clean_uri` is the request URI without it
    Query {
        tunnel_id: String,
        clean_uri: String,
    },
    Header(String),
    Cookie(String),
    Missing,
}

pub fn resolve_tunnel_selection(uri: &Uri, headers: &HeaderMap) -> TunnelSelection {
    if let Some(query) = uri.query() {
        let mut tunnel_id = None;
        let mut rest = Vec::new();

        // Only `tunnel_id=` segments are removed; the others are kept verbatim
        for segment in query.split('&') {
            let is_tunnel_id = segment
                .split_once('=')
                .is_some_and(|(key, _)| key == TUNNEL_ID_QUERY_PARAM);
            if !is_tunnel_id {
                rest.push(segment);
                continue;
            }
            if tunnel_id.is_none() {
                tunnel_id = form_urlencoded::parse(segment.as_bytes())
                    .next()
                    .map(|(_, value)| value.into_owned());
            }
        }

        if let Some(tunnel_id) = tunnel_id {
            let clean_uri = if rest.is_empty() {
                uri.path().to_string()
            } else {
                format!("{}?{}", uri.path(), rest.join("&"))
            };
            return TunnelSelection::Query {
                tunnel_id,
                clean_uri,
            };
        }
    }

    if let Some(id) = headers
        .get(TUNNEL_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return TunnelSelection::Header(id.to_string());
    }

    match cookie_value(headers, TUNNEL_ID_COOKIE) {
        Some(id) if !id.is_empty() => TunnelSelection::Cookie(id),
        _ => TunnelSelection::Missing,
    }
}

fn cookie_pairs(headers: &HeaderMap) -> impl Iterator<Item = &str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
}

/// Value of the cookie `name`, if the request carries it
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    cookie_pairs(headers)
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim().to_string())
}

/// Request cookies minus the tunnel selection cookie, as one header value
fn forwarded_cookies(headers: &HeaderMap) -> Option<String> {
    let kept: Vec<&str> = cookie_pairs(headers)
        .filter(|pair| !matches!(pair.split_once('='), Some((key, _)) if key.trim() == TUNNEL_ID_COOKIE))
        .collect();
    (!kept.is_empty()).then(|| kept.join("; "))
}

pub fn tunnel_cookie(tunnel_id: &str) -> String {
    format!(
        "{}={}; Max-Age={}; Path=/; SameSite=Lax",
        TUNNEL_ID_COOKIE, tunnel_id, TUNNEL_COOKIE_MAX_AGE_SECS
    )
}

pub fn clear_tunnel_cookie() -> String {
    format!("{}=; Max-Age=0; Path=/; SameSite=Lax", TUNNEL_ID_COOKIE)
}

/// Broker-owned paths that never fall through to the entry page
pub fn is_control_path(path: &str) -> bool {
    path == "/ws" || path == "/health" || path == "/api" || path.starts_with("/api/")
}

fn first_header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// The URL the caller used, as far as proxies in front of us let us know
pub fn public_request_url(public_url: &str, parts: &Parts) -> String {
    let path = parts.uri.path_and_query().map_or("/", |pq| pq.as_str());
    let host = first_header_value(&parts.headers, "x-forwarded-host")
        .or_else(|| first_header_value(&parts.headers, header::HOST.as_str()));

    match host {
        Some(host) => {
            let proto = first_header_value(&parts.headers, "x-forwarded-proto").unwrap_or("http");
            format!("{}://{}{}", proto, host, path)
        }
        None => format!("{}{}", public_url, path),
    }
}

/// 302 with an optional Set-Cookie
fn found(location: &str, cookie: Option<&str>) -> Response {
    let mut response = StatusCode::FOUND.into_response();
    let headers = response.headers_mut();

    if let Ok(value) = HeaderValue::from_str(location) {
        headers.insert(header::LOCATION, value);
    }
    if let Some(value) = cookie.and_then(|c| HeaderValue::from_str(c).ok()) {
        headers.append(header::SET_COOKIE, value);
    }
    response
}

fn redirect_to_entry(state: &AppState, parts: &Parts) -> Response {
    let return_url = public_request_url(&state.config.public_url, parts);
    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair("returnUrl", &return_url)
        .finish();
    let location = format!("{}/entry?{}", state.config.web_url, query);

    let clear = cookie_value(&parts.headers, TUNNEL_ID_COOKIE).map(|_| clear_tunnel_cookie());
    found(&location, clear.as_deref())
}

/// Read the request body, refusing anything over `limit` bytes
async fn read_body(headers: &HeaderMap, body: HttpBody, limit: usize) -> Result<Vec<u8>, ApiError> {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|len| len > limit) {
        return Err(RelayError::PayloadTooLarge(limit).into());
    }

    let mut stream = body.into_data_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ApiError::BadRequest(format!("Failed to read body: {}", e)))?;
        if buf.len() + chunk.len() > limit {
            return Err(RelayError::PayloadTooLarge(limit).into());
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

/// Frame sent to the host for a public request
///
/// Hop-by-hop headers and the tunnel selection header/cookie are removed. For
/// password-protected tunnels the caller's credentials and cookies never
/// reach the host.
pub fn build_request_frame(
    request_id: String,
    parts: &Parts,
    body: &[u8],
    protected: bool,
) -> Result<RequestFrame, ApiError> {
    let raw_path = parts.uri.path_and_query().map_or("/", |pq| pq.as_str());
    let path = validate_path(raw_path).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let mut headers = headers_to_map(&parts.headers);
    strip_request_headers(&mut headers);
    headers.remove(TUNNEL_ID_HEADER);
    headers.remove("cookie");

    if protected {
        headers.remove("authorization");
    } else if let Some(cookies) = forwarded_cookies(&parts.headers) {
        headers.insert("cookie".to_string(), cookies);
    }

    let content_type = headers.get("content-type").map(String::as_str);
    let body = Body::from_payload(body, content_type);

    Ok(RequestFrame {
        request_id,
        method: parts.method.to_string(),
        path,
        headers,
        body,
        timestamp: current_timestamp_millis(),
    })
}

/// Log entry for a request about to be relayed; status and duration are
/// filled in once the outcome is known
pub fn request_log_entry(tunnel_id: &str, frame: &RequestFrame, body_len: usize) -> RequestLogEntry {
    let mut headers = frame.headers.clone();
    headers.retain(|key, _| !UNLOGGED_HEADERS.contains(&key.as_str()));
    let body_omitted = frame.body.is_some() && body_len > MAX_LOGGED_BODY_BYTES;

    RequestLogEntry {
        request_id: frame.request_id.clone(),
        tunnel_id: tunnel_id.to_string(),
        method: frame.method.clone(),
        path: frame.path_only().to_string(),
        status: 0,
        duration_ms: 0,
        timestamp: Utc::now(),
        headers: Some(headers),
        body: if body_omitted { None } else { frame.body.clone() },
        query: frame.query().map(str::to_string),
        body_omitted,
        replay_of: None,
    }
}

/// Write a host's response back as an HTTP response
///
/// Binary bodies pass through untouched; JSON bodies are re-serialized.
pub fn into_http_response(frame: ResponseFrame) -> Result<Response, RelayError> {
    let status = StatusCode::from_u16(frame.status_code).map_err(|_| {
        RelayError::MalformedFrame(format!("invalid status code {}", frame.status_code))
    })?;

    let bytes = match &frame.body {
        Some(body) => body
            .to_bytes()
            .map_err(|e| RelayError::MalformedFrame(e.to_string()))?,
        None => Vec::new(),
    };

    let mut headers = frame.headers;
    strip_response_headers(&mut headers);
    let mut header_map = map_to_headers(&headers);
    if frame.body.as_ref().is_some_and(Body::is_json) && !header_map.contains_key(header::CONTENT_TYPE)
    {
        header_map.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
    }

    let mut response = Response::new(HttpBody::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = header_map;
    Ok(response)
}

/// Handler for all public tunnel traffic
pub async fn handle_forwarding(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let tunnel_id = match resolve_tunnel_selection(&parts.uri, &parts.headers) {
        TunnelSelection::Query {
            tunnel_id,
            clean_uri,
        } => {
            if validate_tunnel_id(&tunnel_id).is_err() {
                debug!(?tunnel_id, "Ignoring invalid tunnel ID in query");
                return redirect_to_entry(&state, &parts);
            }
            debug!(%tunnel_id, location = %clean_uri, "Tunnel selected by query");
            return found(&clean_uri, Some(&tunnel_cookie(&tunnel_id)));
        }
        TunnelSelection::Header(id) | TunnelSelection::Cookie(id) => id,
        TunnelSelection::Missing => {
            if is_control_path(parts.uri.path()) {
                return ApiError::NotFound(format!("No route for {}", parts.uri.path()))
                    .into_response();
            }
            return redirect_to_entry(&state, &parts);
        }
    };

    let registration = validate_tunnel_id(&tunnel_id)
        .ok()
        .and_then(|_| state.registry.lookup(&tunnel_id));
    let Some(registration) = registration else {
        debug!(%tunnel_id, "Tunnel is not connected, redirecting to entry page");
        return redirect_to_entry(&state, &parts);
    };

    forward(&state, registration, parts, body)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

async fn forward(
    state: &AppState,
    registration: TunnelRegistration,
    parts: Parts,
    body: HttpBody,
) -> Result<Response, ApiError> {
    let tunnel_id = registration.tunnel_id.as_str();
    authorize(&registration, &parts.headers).await?;

    let bytes = read_body(&parts.headers, body, state.config.max_body_size).await?;
    let frame = build_request_frame(
        generate_request_id(),
        &parts,
        &bytes,
        registration.is_protected(),
    )?;
    let mut entry = request_log_entry(tunnel_id, &frame, bytes.len());
    drop(bytes);

    debug!(
        tunnel_id,
        request_id = %frame.request_id,
        "Relaying {} {}",
        frame.method,
        frame.path
    );

    let start = Instant::now();
    let outcome = state
        .relay
        .relay_default(tunnel_id, frame)
        .await
        .and_then(into_http_response);

    entry.duration_ms = elapsed_millis(start);
    entry.status = match &outcome {
        Ok(response) => response.status().as_u16(),
        Err(e) => e.status_code().as_u16(),
    };

    info!(
        tunnel_id,
        request_id = %entry.request_id,
        status = entry.status,
        duration_ms = entry.duration_ms,
        "{} {}",
        entry.method,
        entry.path
    );

    if state.config.log_static_assets || !is_static_asset(&entry.path) {
        state.record(entry);
    }

    Ok(outcome?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request as HttpRequest;
    use std::collections::HashMap;

    fn parts(uri: &str, headers: &[(&str, &str)]) -> Parts {
        let mut builder = HttpRequest::builder().method("POST").uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_query_selection_strips_only_tunnel_id() {
        let p = parts("/page?a=1&tunnel_id=tunnel-1&b=two", &[]);
        assert_eq!(
            resolve_tunnel_selection(&p.uri, &p.headers),
            TunnelSelection::Query {
                tunnel_id: "tunnel-1".to_string(),
                clean_uri: "/page?a=1&b=two".to_string(),
            }
        );

        let p = parts("/?tunnel_id=tunnel-1", &[]);
        assert_eq!(
            resolve_tunnel_selection(&p.uri, &p.headers),
            TunnelSelection::Query {
                tunnel_id: "tunnel-1".to_string(),
                clean_uri: "/".to_string(),
            }
        );
    }

    #[test]
    fn test_query_selection_keeps_other_params_verbatim() {
        let p = parts("/page?flag&q=a%20b&path=%2Fx&tunnel_id=t1", &[]);
        assert_eq!(
            resolve_tunnel_selection(&p.uri, &p.headers),
            TunnelSelection::Query {
                tunnel_id: "t1".to_string(),
                clean_uri: "/page?flag&q=a%20b&path=%2Fx".to_string(),
            }
        );

        // A bare `tunnel_id` flag selects nothing
        let p = parts("/page?tunnel_id&x=1", &[]);
        assert_eq!(
            resolve_tunnel_selection(&p.uri, &p.headers),
            TunnelSelection::Missing
        );

        let p = parts("/?q=1&tunnel_id=my%2Dapp", &[]);
        assert_eq!(
            resolve_tunnel_selection(&p.uri, &p.headers),
            TunnelSelection::Query {
                tunnel_id: "my-app".to_string(),
                clean_uri: "/?q=1".to_string(),
            }
        );
    }

    #[test]
    fn test_selection_precedence() {
        let p = parts(
            "/x?tunnel_id=from-query",
            &[("x-tunnel-id", "from-header"), ("cookie", "tunnel_id=from-cookie")],
        );
        assert!(matches!(
            resolve_tunnel_selection(&p.uri, &p.headers),
            TunnelSelection::Query { tunnel_id, .. } if tunnel_id == "from-query"
        ));

        let p = parts(
            "/x",
            &[("x-tunnel-id", "from-header"), ("cookie", "tunnel_id=from-cookie")],
        );
        assert_eq!(
            resolve_tunnel_selection(&p.uri, &p.headers),
            TunnelSelection::Header("from-header".to_string())
        );

        let p = parts("/x", &[("cookie", "theme=dark; tunnel_id=from-cookie")]);
        assert_eq!(
            resolve_tunnel_selection(&p.uri, &p.headers),
            TunnelSelection::Cookie("from-cookie".to_string())
        );

        let p = parts("/x?page=2", &[("cookie", "theme=dark")]);
        assert_eq!(
            resolve_tunnel_selection(&p.uri, &p.headers),
            TunnelSelection::Missing
        );
    }

    #[test]
    fn test_cookies() {
        assert_eq!(
            tunnel_cookie("tunnel-1"),
            "tunnel_id=tunnel-1; Max-Age=86400; Path=/; SameSite=Lax"
        );
        assert!(clear_tunnel_cookie().contains("Max-Age=0"));

        let p = parts("/", &[("cookie", "a=1; tunnel_id=t; b=2")]);
        assert_eq!(forwarded_cookies(&p.headers).as_deref(), Some("a=1; b=2"));

        let p = parts("/", &[("cookie", "tunnel_id=t")]);
        assert_eq!(forwarded_cookies(&p.headers), None);
    }

    #[test]
    fn test_control_paths() {
        assert!(is_control_path("/ws"));
        assert!(is_control_path("/health"));
        assert!(is_control_path("/api/logs/t"));
        assert!(!is_control_path("/"));
        assert!(!is_control_path("/apis"));
    }

    #[test]
    fn test_public_request_url() {
        let p = parts(
            "/a?b=1",
            &[
                ("host", "internal:3000"),
                ("x-forwarded-host", "tunnels.example.com"),
                ("x-forwarded-proto", "https"),
            ],
        );
        assert_eq!(
            public_request_url("http://fallback", &p),
            "https://tunnels.example.com/a?b=1"
        );

        let p = parts("/a", &[]);
        assert_eq!(public_request_url("http://fallback", &p), "http://fallback/a");
    }

    #[test]
    fn test_build_request_frame_unprotected() {
        let p = parts(
            "/submit?x=1",
            &[
                ("host", "tunnels.example.com"),
                ("content-type", "application/json"),
                ("content-length", "7"),
                ("authorization", "Bearer app-token"),
                ("x-tunnel-id", "tunnel-1"),
                ("cookie", "session=abc; tunnel_id=tunnel-1"),
            ],
        );
        let frame = build_request_frame("req-1".into(), &p, br#"{"a":1}"#, false).unwrap();

        assert_eq!(frame.method, "POST");
        assert_eq!(frame.path, "/submit?x=1");
        assert!(frame.header("host").is_none());
        assert!(frame.header("content-length").is_none());
        assert!(frame.header("x-tunnel-id").is_none());
        assert_eq!(frame.header("authorization"), Some("Bearer app-token"));
        assert_eq!(frame.header("cookie"), Some("session=abc"));
        assert_eq!(frame.body, Some(Body::Json(serde_json::json!({"a": 1}))));
    }

    #[test]
    fn test_build_request_frame_protected_strips_credentials() {
        let p = parts(
            "/",
            &[
                ("authorization", "Basic dTpodW50ZXIy"),
                ("cookie", "session=abc"),
            ],
        );
        let frame = build_request_frame("req-1".into(), &p, b"", true).unwrap();

        assert!(frame.header("authorization").is_none());
        assert!(frame.header("cookie").is_none());
        assert!(frame.body.is_none());
    }

    #[test]
    fn test_request_log_entry_hides_credentials() {
        let p = parts(
            "/upload?draft=1",
            &[("authorization", "Bearer t"), ("content-type", "text/plain")],
        );
        let frame = build_request_frame("req-1".into(), &p, b"hello", false).unwrap();
        let entry = request_log_entry("tunnel-1", &frame, 5);

        assert_eq!(entry.path, "/upload");
        assert_eq!(entry.query.as_deref(), Some("draft=1"));
        let headers = entry.headers.unwrap();
        assert!(!headers.contains_key("authorization"));
        assert_eq!(headers.get("content-type").unwrap(), "text/plain");
        assert!(entry.body.is_some());
        assert!(!entry.body_omitted);
    }

    #[test]
    fn test_request_log_entry_omits_large_body() {
        let p = parts("/upload", &[]);
        let body = vec![0u8; MAX_LOGGED_BODY_BYTES + 1];
        let frame = build_request_frame("req-1".into(), &p, &body, false).unwrap();
        let entry = request_log_entry("tunnel-1", &frame, body.len());

        assert!(entry.body.is_none());
        assert!(entry.body_omitted);
    }

    #[tokio::test]
    async fn test_into_http_response() {
        let mut frame = ResponseFrame::new("req-1".into(), 201);
        frame.headers = HashMap::from([
            ("content-encoding".to_string(), "gzip".to_string()),
            ("set-cookie".to_string(), "a=1\nb=2".to_string()),
        ]);
        frame.body = Some(Body::Json(serde_json::json!({"ok": true})));

        let response = into_http_response(frame).unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().get("content-encoding").is_none());
        assert_eq!(response.headers().get_all("set-cookie").iter().count(), 2);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], br#"{"ok":true}"#);
    }

    #[test]
    fn test_into_http_response_rejects_bad_frames() {
        let frame = ResponseFrame::new("req-1".into(), 1000);
        assert!(matches!(
            into_http_response(frame),
            Err(RelayError::MalformedFrame(_))
        ));

        let mut frame = ResponseFrame::new("req-1".into(), 200);
        frame.body = Some(Body::Base64("***".to_string()));
        assert!(matches!(
            into_http_response(frame),
            Err(RelayError::MalformedFrame(_))
        ));
    }
}
