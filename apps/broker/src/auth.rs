//! Password protection of tunnels
//!
//! Hosts may register with a password. The broker keeps only its Argon2id hash
//! and requires HTTP Basic credentials (RFC 7617) on every request to such a
//! tunnel. The username part of the credentials is ignored.

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use axum::http::{HeaderMap, header};
use base64::Engine;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error_handling::ApiError;
use crate::registry::TunnelRegistration;

/// Value of the `WWW-Authenticate` header sent with every 401
pub const CHALLENGE: &str = "Basic realm=\"tunnelhub\"";

/// Authentication failures on the HTTP path
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("This tunnel requires a password")]
    Required,

    #[error("Invalid tunnel password")]
    Invalid,
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::Required => "auth_required",
            AuthError::Invalid => "auth_invalid",
        }
    }
}

/// Error types for password operations
#[derive(Error, Debug)]
pub enum PasswordError {
    #[error("Failed to hash password: {0}")]
    HashingFailed(String),

    #[error("Failed to verify password: {0}")]
    VerificationFailed(String),

    #[error("Invalid password hash format: {0}")]
    InvalidHashFormat(String),
}

/// Hash a password using Argon2id with default parameters
///
/// Returns a PHC-formatted string, e.g. `$argon2id$v=19$m=19456,t=2,p=1$...`
pub fn hash_password(password: &str) -> Result<String, PasswordError> {
    let salt = SaltString::generate(&mut OsRng);

    let password_hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| PasswordError::HashingFailed(e.to_string()))?;

    Ok(password_hash.to_string())
}

/// Verify a password against a PHC-formatted hash
pub fn verify_password(password: &str, hash: &str) -> Result<bool, PasswordError> {
    let parsed_hash =
        PasswordHash::new(hash).map_err(|e| PasswordError::InvalidHashFormat(e.to_string()))?;

    match Argon2::default().verify_password(password.as_bytes(), &parsed_hash) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(PasswordError::VerificationFailed(e.to_string())),
    }
}

/// Hash on the blocking pool; Argon2 is deliberately slow
pub async fn hash_password_blocking(password: String) -> anyhow::Result<String> {
    let hash = tokio::task::spawn_blocking(move || hash_password(&password)).await??;
    Ok(hash)
}

/// Password part of a `Basic` Authorization header
///
/// Returns `None` when the header is missing, uses another scheme, or does not
/// decode to `username:password`.
pub fn extract_basic_password(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    let (_username, password) = credentials.split_once(':')?;
    Some(password.to_string())
}

/// Check the request's credentials against the tunnel's password, if it has one
pub async fn authorize(
    registration: &TunnelRegistration,
    headers: &HeaderMap,
) -> Result<(), ApiError> {
    let Some(hash) = registration.password_hash.clone() else {
        return Ok(());
    };

    let Some(password) = extract_basic_password(headers) else {
        debug!(
            "Missing or malformed credentials for tunnel {}",
            registration.tunnel_id
        );
        return Err(AuthError::Required.into());
    };

    let verified = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
        .await
        .map_err(anyhow::Error::from)?;

    match verified {
        Ok(true) => Ok(()),
        Ok(false) => {
            debug!("Wrong password for tunnel {}", registration.tunnel_id);
            Err(AuthError::Invalid.into())
        }
        Err(e) => {
            warn!(
                "Password check failed for tunnel {}: {}",
                registration.tunnel_id, e
            );
            Err(AuthError::Invalid.into())
        }
    }
}
