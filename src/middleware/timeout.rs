//! Global per-request timeout.
//!
//! Wraps the whole handler chain. When the deadline passes the in-flight
//! future is dropped and the caller receives 408, never an auth or
//! rate-limit outcome.

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::time::Duration;
use tracing::warn;

use crate::error::AuthError;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn request_timeout(
    State(limit): State<Duration>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    match tokio::time::timeout(limit, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(path = %path, timeout_ms = limit.as_millis() as u64, "Request timed out");
            AuthError::Timeout.into_response()
        }
    }
}
