//! Error taxonomy for the access-control core.
//!
//! Every credential problem collapses into one 401 body so a caller cannot
//! tell a forged token from an expired or revoked one. Rate limiting, timeouts
//! and storage outages keep their own status codes.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

use crate::auth::jwt::TokenError;
use crate::auth::session_store::StoreError;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no credential presented")]
    MissingCredential,
    #[error("credential is malformed")]
    MalformedCredential,
    #[error("credential signature is invalid")]
    SignatureInvalid,
    #[error("credential has expired")]
    Expired,
    #[error("no active session for credential")]
    RevokedSession,
    #[error("rate limited, retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },
    #[error("request timed out")]
    Timeout,
    #[error("session storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// True for every variant that is reported to the client as plain 401.
    pub fn is_credential_failure(&self) -> bool {
        matches!(
            self,
            AuthError::MissingCredential
                | AuthError::MalformedCredential
                | AuthError::SignatureInvalid
                | AuthError::Expired
                | AuthError::RevokedSession
        )
    }
}

impl From<TokenError> for AuthError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Malformed => AuthError::MalformedCredential,
            TokenError::SignatureInvalid => AuthError::SignatureInvalid,
            TokenError::Expired => AuthError::Expired,
            TokenError::Signing(msg) => AuthError::Internal(msg),
        }
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        match err {
            // A duplicate credential is our bug, not an outage.
            StoreError::Conflict => AuthError::Internal(err.to_string()),
            other => AuthError::StorageUnavailable(other.to_string()),
        }
    }
}

/// Whole minutes left, rounded up so a user never sees "0 minutes".
pub fn minutes_ceil(d: Duration) -> u64 {
    d.as_secs().div_ceil(60).max(1)
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match self {
            e if e.is_credential_failure() => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "unauthorized", "message": "Authentication required" })),
            )
                .into_response(),
            AuthError::RateLimited { retry_after } => {
                let minutes = minutes_ceil(retry_after);
                let body = json!({
                    "error": "rate_limit_exceeded",
                    "message": format!("Too many attempts. Try again in {minutes} min."),
                    "retry_after_minutes": minutes,
                    "retry_after_seconds": retry_after.as_secs(),
                });
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(header::RETRY_AFTER, retry_after.as_secs().to_string())],
                    Json(body),
                )
                    .into_response()
            }
            AuthError::Timeout => (
                StatusCode::REQUEST_TIMEOUT,
                Json(json!({ "error": "timeout", "message": "Request timed out. Please retry." })),
            )
                .into_response(),
            AuthError::StorageUnavailable(reason) => {
                tracing::error!(%reason, "Session storage unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({ "error": "storage_unavailable", "message": "Service temporarily unavailable" })),
                )
                    .into_response()
            }
            other => {
                tracing::error!(error = %other, "Auth internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "internal", "message": "Internal server error" })),
                )
                    .into_response()
            }
        }
    }
}

/// Handler-level errors for the account endpoints.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("invalid nickname or password")]
    InvalidCredentials,
    #[error("{0}")]
    Validation(String),
    #[error("nickname or email already taken")]
    AlreadyExists,
    #[error("verification code is invalid or expired")]
    InvalidCode,
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Auth(err.into())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(format!("{err:#}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Auth(e) => return e.into_response(),
            ApiError::InvalidCredentials => {
                (StatusCode::UNAUTHORIZED, "Invalid nickname or password".to_string())
            }
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::AlreadyExists => (
                StatusCode::CONFLICT,
                "Nickname or email already taken".to_string(),
            ),
            ApiError::InvalidCode => (
                StatusCode::BAD_REQUEST,
                "Verification code is invalid or expired".to_string(),
            ),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_credential_failures_are_indistinguishable() {
        let mut bodies = Vec::new();
        for err in [
            AuthError::MissingCredential,
            AuthError::MalformedCredential,
            AuthError::SignatureInvalid,
            AuthError::Expired,
            AuthError::RevokedSession,
        ] {
            let resp = err.into_response();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
            let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
                .await
                .unwrap();
            bodies.push(bytes);
        }
        assert!(bodies.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_distinct_statuses() {
        let limited = AuthError::RateLimited {
            retry_after: Duration::from_secs(900),
        }
        .into_response();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(limited.headers()[header::RETRY_AFTER], "900");

        assert_eq!(
            AuthError::Timeout.into_response().status(),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            AuthError::StorageUnavailable("down".into())
                .into_response()
                .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_store_conflict_is_internal_not_outage() {
        let conflict = AuthError::from(StoreError::Conflict);
        assert!(matches!(conflict, AuthError::Internal(_)));
        assert_eq!(
            conflict.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );

        let outage = AuthError::from(StoreError::Unavailable("locked".into()));
        assert_eq!(outage.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_minutes_round_up() {
        assert_eq!(minutes_ceil(Duration::from_secs(900)), 15);
        assert_eq!(minutes_ceil(Duration::from_secs(61)), 2);
        assert_eq!(minutes_ceil(Duration::from_secs(5)), 1);
    }
}
