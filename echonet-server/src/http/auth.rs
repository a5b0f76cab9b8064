//! Static API-key / admin-key middleware: header check plus constant-time
//! comparison, expressed once as `tower`/`axum` middleware layers rather
//! than per-handler, so a new route can't forget it.

use axum::{
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::state::AppState;

const API_KEY_HEADER: &str = "x-echonet-api-key";
const ADMIN_KEY_HEADER: &str = "x-echonet-admin-key";

/// Constant-time comparison to avoid leaking key length/prefix via timing.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn header_matches(req: &Request, header: &str, expected: &str) -> bool {
    req.headers()
        .get(header)
        .and_then(|v: &HeaderValue| v.to_str().ok())
        .map(|provided| constant_time_eq(provided.as_bytes(), expected.as_bytes()))
        .unwrap_or(false)
}

/// Applied to every route: rejects with 401 when `ECHONET_API_KEY` is set
/// and the request doesn't carry a matching `X-EchoNet-Api-Key` header.
/// When no API key is configured, auth is a no-op.
pub async fn require_api_key(State(state): State<AppState>, req: Request, next: Next) -> Response {
    match &state.config.api_key {
        None => next.run(req).await,
        Some(expected) => {
            if header_matches(&req, API_KEY_HEADER, expected) {
                next.run(req).await
            } else {
                (StatusCode::UNAUTHORIZED, "missing or invalid API key").into_response()
            }
        }
    }
}

/// Applied only to mutating admin routes (register, delete, state changes):
/// rejects with 403 when `ECHONET_ADMIN_KEY` is set and the request doesn't
/// carry a matching `X-EchoNet-Admin-Key` header.
pub async fn require_admin_key(State(state): State<AppState>, req: Request, next: Next) -> Response {
    match &state.config.admin_key {
        None => next.run(req).await,
        Some(expected) => {
            if header_matches(&req, ADMIN_KEY_HEADER, expected) {
                next.run(req).await
            } else {
                (StatusCode::FORBIDDEN, "missing or invalid admin key").into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_rejects_mismatched_length() {
        assert!(!constant_time_eq(b"short", b"muchlonger"));
    }

    #[test]
    fn constant_time_eq_accepts_equal_bytes() {
        assert!(constant_time_eq(b"secret-key", b"secret-key"));
    }

    #[test]
    fn constant_time_eq_rejects_single_byte_difference() {
        assert!(!constant_time_eq(b"secret-key", b"secret-kei"));
    }
}
