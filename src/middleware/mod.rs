//! Middleware for observability, timeouts and rate limiting.
//!
//! This module provides:
//! - Request logging with latency tracking
//! - A global per-request timeout
//! - Sliding-window rate limiting per client address

pub mod logging;
pub mod rate_limit;
pub mod timeout;

pub use logging::request_logging;
pub use rate_limit::{rate_limit_guard, RateLimitPolicy, RateLimiter, RouteGuard, SweeperHandle};
pub use timeout::request_timeout;
