//! HTTP Routing
//! Mission: Put the right guard in front of each endpoint

use crate::auth::{api as auth_api, auth_middleware, AuthState};
use crate::middleware::{
    rate_limit_guard, request_logging, request_timeout, RateLimitPolicy, RateLimiter, RouteGuard,
    SweeperHandle,
};
use axum::{
    http::{header, HeaderValue, Method},
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::warn;

/// One limiter per endpoint class. Verify-email and resend-code share a budget.
#[derive(Clone)]
pub struct EndpointGuards {
    pub register: Arc<RateLimiter>,
    pub login: Arc<RateLimiter>,
    pub verify: Arc<RateLimiter>,
    trusted_proxies: Arc<[IpAddr]>,
}

impl EndpointGuards {
    pub fn new(block_duration: Duration, trusted_proxies: Vec<IpAddr>) -> Self {
        Self {
            register: Arc::new(RateLimiter::new(
                "register",
                RateLimitPolicy::register(block_duration),
            )),
            login: Arc::new(RateLimiter::new(
                "login",
                RateLimitPolicy::login(block_duration),
            )),
            verify: Arc::new(RateLimiter::new(
                "verify",
                RateLimitPolicy::verify(block_duration),
            )),
            trusted_proxies: trusted_proxies.into(),
        }
    }

    fn guard(&self, limiter: &Arc<RateLimiter>) -> RouteGuard {
        RouteGuard::new(limiter.clone(), self.trusted_proxies.clone())
    }

    /// Start one eviction task per limiter. Stop them with [`SweeperHandle::shutdown`].
    pub fn spawn_sweepers(&self, period: Duration) -> Vec<SweeperHandle> {
        [&self.register, &self.login, &self.verify]
            .into_iter()
            .map(|limiter| limiter.spawn_sweeper(period))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub request_timeout: Duration,
    pub allowed_origins: Vec<String>,
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .map(|origin| origin.trim())
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) if origin != "*" => Some(value),
            _ => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    // Cookies need credentials, and credentials need an explicit origin list.
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true)
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Build the full application router.
///
/// Layer order, outermost first: request logging, CORS, request timeout, then
/// the per-route rate-limit or auth guard. CORS sits outside the timeout so a
/// 408 still carries the allow-origin header.
pub fn build_router(state: AuthState, guards: &EndpointGuards, config: RouterConfig) -> Router {
    let guarded_routes = Router::new()
        .route(
            "/api/register",
            post(auth_api::register).layer(middleware::from_fn_with_state(
                guards.guard(&guards.register),
                rate_limit_guard,
            )),
        )
        .route(
            "/api/login",
            post(auth_api::login).layer(middleware::from_fn_with_state(
                guards.guard(&guards.login),
                rate_limit_guard,
            )),
        )
        .route(
            "/api/verify-email",
            post(auth_api::verify_email).layer(middleware::from_fn_with_state(
                guards.guard(&guards.verify),
                rate_limit_guard,
            )),
        )
        .route(
            "/api/resend-code",
            post(auth_api::resend_code).layer(middleware::from_fn_with_state(
                guards.guard(&guards.verify),
                rate_limit_guard,
            )),
        )
        .route("/api/refresh", post(auth_api::refresh))
        .route("/api/logout", post(auth_api::logout));

    let protected_routes = Router::new()
        .route("/api/me", get(auth_api::me))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let public_routes = Router::new().route("/health", get(health_check));

    Router::new()
        .merge(public_routes)
        .merge(guarded_routes)
        .merge(protected_routes)
        .with_state(state)
        .layer(middleware::from_fn_with_state(
            config.request_timeout,
            request_timeout,
        ))
        .layer(cors_layer(&config.allowed_origins))
        .layer(middleware::from_fn(request_logging))
}
