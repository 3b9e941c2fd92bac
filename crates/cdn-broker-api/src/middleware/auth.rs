//! HTTP Basic authentication for the broker API (RFC 7617)
//!
//! The platform calling the broker presents a single `username:password`
//! pair configured at startup.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
    Json,
};
use base64::Engine;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::models::ErrorResponse;

/// The one credential pair the broker accepts
#[derive(Clone)]
pub struct BasicCredentials {
    username: String,
    password: String,
}

impl BasicCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Check an `Authorization` header value
    pub fn verify(&self, auth_header: &str) -> bool {
        match decode_basic(auth_header) {
            Some((username, password)) => {
                let username_ok = username.as_bytes().ct_eq(self.username.as_bytes());
                let password_ok = password.as_bytes().ct_eq(self.password.as_bytes());
                bool::from(username_ok & password_ok)
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for BasicCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Decode `Basic <base64(username:password)>`
fn decode_basic(auth_header: &str) -> Option<(String, String)> {
    let (scheme, encoded) = auth_header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;

    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Reject requests without valid broker credentials
///
/// # Errors
/// Returns 401 Unauthorized if the Authorization header is missing, not
/// Basic, or carries the wrong credentials.
pub async fn require_basic_auth(
    State(credentials): State<Arc<BasicCredentials>>,
    request: Request,
    next: Next,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse::with_code(
                    "Unauthorized",
                    "Missing Authorization header",
                )),
            )
        })?;

    if !credentials.verify(auth_header) {
        debug!("Basic auth: invalid credentials");
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse::with_code(
                "Unauthorized",
                "Invalid broker credentials",
            )),
        ));
    }

    Ok(next.run(request).await)
}
