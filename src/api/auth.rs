//! Shared-secret request authentication

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use super::AppState;
use crate::Error;

/// Header carrying the cluster shared secret
pub const AUTH_HEADER: &str = "X-Auth-Token";

/// Reject requests unless `X-Auth-Token` matches the bootstrapped secret
///
/// Answers 503 while the secret is not yet known and 403 for a missing or
/// wrong token.
pub async fn require_shared_secret(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(secret) = state.health.shared_secret().await else {
        return Error::transient("shared secret not bootstrapped yet").into_response();
    };

    let provided = request
        .headers()
        .get(AUTH_HEADER)
        .and_then(|value| value.to_str().ok());

    match provided {
        Some(token) if constant_time_eq(token.as_bytes(), secret.as_bytes()) => {
            next.run(request).await
        }
        Some(_) => {
            debug!(path = %request.uri().path(), "Rejected request with wrong auth token");
            Error::forbidden("invalid auth token").into_response()
        }
        None => Error::forbidden("missing auth token").into_response(),
    }
}

/// Compare without short-circuiting on the first differing byte
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
