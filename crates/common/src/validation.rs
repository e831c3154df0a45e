//! Input validation for identifiers and paths supplied by clients
//!
//! Tunnel IDs arrive from query strings, headers, cookies and handshakes, so they
//! are checked before they reach logs or the registry.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Regex for validating tunnel IDs (1-64 characters of [A-Za-z0-9_-])
static TUNNEL_ID_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap());

/// Regex for validating request IDs (UUID format)
static REQUEST_ID_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12}$").unwrap()
});

/// Maximum length for HTTP paths
pub const MAX_PATH_LENGTH: usize = 2048;

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid tunnel ID format: {0}")]
    InvalidTunnelId(String),

    #[error("Invalid request ID format: {0}")]
    InvalidRequestId(String),

    #[error("Path too long: {0} bytes (max: {1})")]
    PathTooLong(usize, usize),
}

/// Validate tunnel ID format
///
/// Tunnel IDs are 1 to 64 ASCII letters, digits, `-` or `_`.
///
/// # Examples
///
/// ```
/// use tunnelhub_common::validation::validate_tunnel_id;
///
/// assert!(validate_tunnel_id("th-a1b2c3").is_ok());
/// assert!(validate_tunnel_id("tunnel_1").is_ok());
/// assert!(validate_tunnel_id("has space").is_err());
/// assert!(validate_tunnel_id("").is_err());
/// ```
pub fn validate_tunnel_id(id: &str) -> Result<(), ValidationError> {
    if !TUNNEL_ID_REGEX.is_match(id) {
        return Err(ValidationError::InvalidTunnelId(
            id.chars().take(50).collect::<String>(), // Limit error message
        ));
    }
    Ok(())
}

/// Validate request ID format
///
/// # Examples
///
/// ```
/// use tunnelhub_common::validation::validate_request_id;
///
/// assert!(validate_request_id("550e8400-e29b-41d4-a716-446655440000").is_ok());
/// assert!(validate_request_id("invalid").is_err());
/// ```
pub fn validate_request_id(id: &str) -> Result<(), ValidationError> {
    if !REQUEST_ID_REGEX.is_match(id) {
        return Err(ValidationError::InvalidRequestId(
            id.chars().take(50).collect::<String>(), // Limit error message
        ));
    }
    Ok(())
}

/// Validate and sanitize HTTP path
///
/// - Removes control characters
/// - Enforces length limits
/// - Ensures path starts with /
pub fn validate_path(path: &str) -> Result<String, ValidationError> {
    if path.len() > MAX_PATH_LENGTH {
        return Err(ValidationError::PathTooLong(path.len(), MAX_PATH_LENGTH));
    }

    let sanitized: String = path.chars().filter(|c| !c.is_control()).collect();

    if sanitized.is_empty() {
        Ok("/".to_string())
    } else if sanitized.starts_with('/') {
        Ok(sanitized)
    } else {
        Ok(format!("/{}", sanitized))
    }
}
