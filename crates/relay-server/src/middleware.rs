//! Bearer authentication for the admin HTTP surface.

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{debug, warn};

use crate::server::AppState;

/// Constant-time byte comparison so admin token checks leak no timing
/// information about prefix matches.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Validate an `Authorization` header value against the expected token.
/// Returns the rejection message on failure.
pub fn validate_bearer(header: Option<&str>, expected: &str) -> Result<(), &'static str> {
    let Some(value) = header else {
        return Err("Unauthorized: Missing Authorization header");
    };
    let Some(token) = value.strip_prefix("Bearer ") else {
        return Err("Unauthorized: Invalid Authorization header format. Use 'Bearer <token>'");
    };
    if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
        return Err("Unauthorized: Invalid token");
    }
    Ok(())
}

/// Axum middleware guarding the admin routes.
pub async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match validate_bearer(header, &state.config.admin_token) {
        Ok(()) => {
            debug!(path = %request.uri().path(), "admin request authenticated");
            next.run(request).await
        }
        Err(message) => {
            warn!(path = %request.uri().path(), message, "admin request rejected");
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"status": "error", "message": message})),
            )
                .into_response()
        }
    }
}
