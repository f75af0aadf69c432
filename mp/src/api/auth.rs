//! Bearer token middleware

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use super::ApiState;
use super::error::ApiError;

fn bearer(req: &Request) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Compare without short-circuiting on the first differing byte
fn token_eq(given: &str, expected: &str) -> bool {
    let (a, b) = (given.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Reject requests without the configured bearer token. With no token
/// configured (loopback only, enforced by config validation) requests pass.
pub async fn require_token(State(state): State<ApiState>, req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    let Some(expected) = state.token.as_deref() else {
        return next.run(req).await;
    };
    match bearer(&req).map(|given| token_eq(given, expected)) {
        Some(true) => {
            debug!(%path, "require_token: authenticated");
            next.run(req).await
        }
        Some(false) => {
            warn!(%path, "auth failed: invalid token");
            ApiError::Unauthorized.into_response()
        }
        None => {
            warn!(%path, "auth failed: missing bearer token");
            ApiError::Unauthorized.into_response()
        }
    }
}
