//! MarketGate Backend Library
//!
//! Access control for the marketplace API: credential issuance, session
//! revocation, the request auth gate and per-endpoint rate limiting.
//! The `marketgate` binary and the integration tests build on these modules.

pub mod auth;
pub mod config;
pub mod error;
pub mod middleware;
pub mod routes;

pub use config::Config;
pub use error::{ApiError, AuthError};
pub use routes::{build_router, EndpointGuards, RouterConfig};
