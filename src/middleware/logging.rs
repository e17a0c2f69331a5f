//! Request logging middleware.
//!
//! Logs every HTTP request with method, path, status code, and latency.

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{info, warn, Instrument};

/// Middleware that logs HTTP requests with timing information.
///
/// 5xx, 429 and 408 log at WARN, everything else at INFO. Client addresses
/// are included only when the server was started with connect info.
pub async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    // Skip logging for health checks to reduce noise
    if path == "/health" {
        return next.run(request).await;
    }

    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default();

    let span = tracing::info_span!(
        "http_request",
        method = %method,
        path = %path,
        client_ip = %client_ip,
    );

    let start = Instant::now();
    let response = next.run(request).instrument(span).await;
    let latency_ms = start.elapsed().as_millis() as u64;
    let status = response.status();
    let renewed = response.headers().contains_key(header::SET_COOKIE);

    if status.is_server_error() {
        warn!(
            method = %method,
            path = %path,
            status = status.as_u16(),
            latency_ms,
            client_ip = %client_ip,
            "Request failed (5xx)"
        );
    } else if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT {
        warn!(
            method = %method,
            path = %path,
            status = status.as_u16(),
            latency_ms,
            client_ip = %client_ip,
            "Request cut short"
        );
    } else if status == StatusCode::UNAUTHORIZED {
        info!(
            method = %method,
            path = %path,
            latency_ms,
            client_ip = %client_ip,
            "Request unauthenticated"
        );
    } else {
        info!(
            method = %method,
            path = %path,
            status = status.as_u16(),
            latency_ms,
            sets_cookie = renewed,
            "Request completed"
        );
    }

    response
}
