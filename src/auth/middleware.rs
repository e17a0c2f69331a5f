//! Authentication Middleware
//! Mission: Protect API endpoints with the cookie-based auth gate

use crate::auth::{
    api::AuthState,
    cookies::{read_cookie, ACCESS_COOKIE, REFRESH_COOKIE},
};
use axum::{
    extract::{Request, State},
    http::{header, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

/// Auth middleware: resolve the caller through [`crate::auth::gate::AuthGate`].
///
/// On success the [`crate::auth::models::Principal`] is placed in request extensions. When the
/// refresh path ran, the renewed access cookie is appended to the response
/// even if the handler itself only reads.
pub async fn auth_middleware(State(state): State<AuthState>, mut req: Request, next: Next) -> Response {
    let access = read_cookie(req.headers(), ACCESS_COOKIE);
    let refresh = read_cookie(req.headers(), REFRESH_COOKIE);

    let outcome = match state
        .gate
        .evaluate(access.as_deref(), refresh.as_deref())
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            if e.is_credential_failure() {
                debug!(reason = %e, path = %req.uri().path(), "Request rejected by auth gate");
            } else {
                warn!(error = %e, path = %req.uri().path(), "Auth gate could not decide");
            }
            return e.into_response();
        }
    };

    req.extensions_mut().insert(outcome.principal);
    let mut response = next.run(req).await;

    if let Some(renewed) = outcome.renewed {
        let cookie = state.cookies.set(
            ACCESS_COOKIE,
            &renewed.token,
            renewed.ttl.num_seconds(),
        );
        match HeaderValue::from_str(&cookie) {
            Ok(value) => {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
            Err(e) => warn!("Failed to encode renewed access cookie: {}", e),
        }
    }

    response
}
