//! Authentication API Endpoints
//! Mission: Registration with email verification, login, renewal and logout

use crate::auth::{
    cookies::{read_cookie, CookiePolicy, ACCESS_COOKIE, REFRESH_COOKIE},
    gate::AuthGate,
    jwt::TokenIssuer,
    models::{
        LoginRequest, MessageResponse, Principal, RegisterRequest, ResendCodeRequest,
        SessionResponse, VerifyEmailRequest,
    },
    session_store::SessionStore,
    user_store::AccountStore,
};
use crate::error::{ApiError, AuthError};
use async_trait::async_trait;
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{AppendHeaders, IntoResponse, Response},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{info, warn};

/// Delivery boundary for verification codes.
#[async_trait]
pub trait VerificationNotifier: Send + Sync {
    async fn send_code(&self, email: &str, nickname: &str, code: &str) -> anyhow::Result<()>;
}

/// Writes codes to the log instead of sending mail.
pub struct LogNotifier;

#[async_trait]
impl VerificationNotifier for LogNotifier {
    async fn send_code(&self, email: &str, nickname: &str, code: &str) -> anyhow::Result<()> {
        info!(%email, %nickname, %code, "📧 Verification code issued");
        Ok(())
    }
}

/// Shared auth state
#[derive(Clone)]
pub struct AuthState {
    pub accounts: AccountStore,
    pub sessions: Arc<dyn SessionStore>,
    pub issuer: Arc<TokenIssuer>,
    pub gate: AuthGate,
    pub notifier: Arc<dyn VerificationNotifier>,
    pub cookies: CookiePolicy,
}

impl AuthState {
    pub fn new(
        accounts: AccountStore,
        sessions: Arc<dyn SessionStore>,
        issuer: Arc<TokenIssuer>,
        storage_deadline: std::time::Duration,
        notifier: Arc<dyn VerificationNotifier>,
        cookies: CookiePolicy,
    ) -> Self {
        let gate = AuthGate::new(issuer.clone(), sessions.clone(), storage_deadline);
        Self {
            accounts,
            sessions,
            issuer,
            gate,
            notifier,
            cookies,
        }
    }
}

/// Run a synchronous account-store call on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("blocking task failed: {e}")))?
        .map_err(ApiError::from)
}

fn validate_nickname(nickname: &str) -> Result<(), ApiError> {
    if nickname.len() < 3 || nickname.len() > 20 {
        return Err(ApiError::Validation(
            "Nickname must be 3 to 20 characters".to_string(),
        ));
    }

    let mut chars = nickname.chars();
    let starts_with_letter = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !starts_with_letter || !rest_ok {
        return Err(ApiError::Validation(
            "Nickname may contain English letters, digits and '_' and must start with a letter"
                .to_string(),
        ));
    }
    Ok(())
}

fn validate_password(password: &str) -> Result<(), ApiError> {
    if password.trim().is_empty() || password.len() < 6 || password.len() > 100 {
        return Err(ApiError::Validation(
            "Password must be 6 to 100 characters".to_string(),
        ));
    }
    Ok(())
}

fn validate_email(email: &str) -> Result<(), ApiError> {
    let valid = email.len() <= 254
        && email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
    if !valid {
        return Err(ApiError::Validation("Invalid email address".to_string()));
    }
    Ok(())
}

/// Mint a credential pair, persist the session, and set both cookies.
async fn start_session(
    state: &AuthState,
    user_id: i64,
    nickname: &str,
    message: &str,
) -> Result<Response, ApiError> {
    let access = state
        .issuer
        .mint_access(user_id, nickname)
        .map_err(AuthError::from)?;
    let refresh = state
        .issuer
        .mint_refresh(user_id, nickname)
        .map_err(AuthError::from)?;

    let expires_at = DateTime::<Utc>::from_timestamp(refresh.claims.exp, 0)
        .ok_or_else(|| ApiError::Internal("refresh expiry out of range".to_string()))?;

    timeout(
        state.gate.storage_deadline(),
        state.sessions.create(user_id, &refresh.token, expires_at),
    )
    .await
    .map_err(|_| AuthError::Timeout)??;

    let cookies = [
        (
            header::SET_COOKIE,
            state
                .cookies
                .set(ACCESS_COOKIE, &access.token, access.ttl.num_seconds()),
        ),
        (
            header::SET_COOKIE,
            state
                .cookies
                .set(REFRESH_COOKIE, &refresh.token, refresh.ttl.num_seconds()),
        ),
    ];

    Ok((
        StatusCode::OK,
        AppendHeaders(cookies),
        Json(SessionResponse {
            message: message.to_string(),
            user_id,
            nickname: nickname.to_string(),
        }),
    )
        .into_response())
}

/// Register endpoint - POST /api/register
pub async fn register(
    State(state): State<AuthState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    let nickname = payload.nickname.trim().to_string();
    let email = payload.email.trim().to_lowercase();
    validate_nickname(&nickname)?;
    validate_email(&email)?;
    validate_password(&payload.password)?;

    let accounts = state.accounts.clone();
    let (nick, mail) = (nickname.clone(), email.clone());
    if blocking(move || accounts.is_taken(&nick, &mail)).await? {
        return Err(ApiError::AlreadyExists);
    }

    let accounts = state.accounts.clone();
    let (nick, mail, password) = (nickname.clone(), email.clone(), payload.password);
    let pending = blocking(move || accounts.begin_verification(&nick, &mail, &password)).await?;

    state
        .notifier
        .send_code(&pending.email, &pending.nickname, &pending.code)
        .await?;

    info!("📝 Registration pending verification: {}", nickname);
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse::new("Verification code sent")),
    ))
}

/// Verify email endpoint - POST /api/verify-email
pub async fn verify_email(
    State(state): State<AuthState>,
    Json(payload): Json<VerifyEmailRequest>,
) -> Result<Response, ApiError> {
    let email = payload.email.trim().to_lowercase();
    let code = payload.code.trim().to_string();

    let accounts = state.accounts.clone();
    let Some(pending) = blocking(move || accounts.take_verification(&email, &code)).await? else {
        warn!("❌ Invalid verification attempt");
        return Err(ApiError::InvalidCode);
    };

    let accounts = state.accounts.clone();
    let account = blocking(move || {
        if accounts.is_taken(&pending.nickname, &pending.email)? {
            return Ok(None);
        }
        accounts
            .create_account(&pending.nickname, &pending.email, &pending.password_hash)
            .map(Some)
    })
    .await?
    .ok_or(ApiError::AlreadyExists)?;

    start_session(&state, account.id, &account.nickname, "Email verified").await
}

/// Resend code endpoint - POST /api/resend-code
pub async fn resend_code(
    State(state): State<AuthState>,
    Json(payload): Json<ResendCodeRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    let email = payload.email.trim().to_lowercase();
    validate_email(&email)?;

    let accounts = state.accounts.clone();
    let mail = email.clone();
    if let Some(pending) = blocking(move || accounts.reissue_code(&mail)).await? {
        state
            .notifier
            .send_code(&pending.email, &pending.nickname, &pending.code)
            .await?;
    }

    // Same answer whether or not a registration is pending.
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse::new(
            "If a registration is pending, a new code has been sent",
        )),
    ))
}

/// Login endpoint - POST /api/login
pub async fn login(
    State(state): State<AuthState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    let nickname = payload.nickname.trim().to_string();
    info!("🔐 Login attempt: {}", nickname);

    if nickname.is_empty() || payload.password.is_empty() {
        return Err(ApiError::InvalidCredentials);
    }

    let accounts = state.accounts.clone();
    let password = payload.password;
    let Some(account) = blocking(move || accounts.verify_login(&nickname, &password)).await? else {
        warn!("❌ Failed login attempt");
        return Err(ApiError::InvalidCredentials);
    };

    info!("✅ Login successful: {} ({})", account.nickname, account.id);
    start_session(&state, account.id, &account.nickname, "Login successful").await
}

/// Refresh endpoint - POST /api/refresh
pub async fn refresh(State(state): State<AuthState>, headers: HeaderMap) -> Result<Response, ApiError> {
    let token = read_cookie(&headers, REFRESH_COOKIE).ok_or(AuthError::MissingCredential)?;
    let (claims, renewed) = state.gate.renew(&token).await?;

    let cookie = state
        .cookies
        .set(ACCESS_COOKIE, &renewed.token, renewed.ttl.num_seconds());

    Ok((
        StatusCode::OK,
        AppendHeaders([(header::SET_COOKIE, cookie)]),
        Json(SessionResponse {
            message: "Token refreshed".to_string(),
            user_id: claims.user_id,
            nickname: claims.nickname,
        }),
    )
        .into_response())
}

/// Logout endpoint - POST /api/logout
pub async fn logout(State(state): State<AuthState>, headers: HeaderMap) -> Result<Response, ApiError> {
    if let Some(token) = read_cookie(&headers, REFRESH_COOKIE) {
        timeout(state.gate.storage_deadline(), state.sessions.delete(&token))
            .await
            .map_err(|_| AuthError::Timeout)??;
    }

    let cleared = [
        (header::SET_COOKIE, state.cookies.clear(ACCESS_COOKIE)),
        (header::SET_COOKIE, state.cookies.clear(REFRESH_COOKIE)),
    ];

    Ok((
        StatusCode::OK,
        AppendHeaders(cleared),
        Json(MessageResponse::new("Logged out")),
    )
        .into_response())
}

/// Current caller - GET /api/me (requires auth middleware)
pub async fn me(Extension(principal): Extension<Principal>) -> Json<Principal> {
    Json(principal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nickname_rules() {
        assert!(validate_nickname("trader_1").is_ok());
        assert!(validate_nickname("abc").is_ok());
        assert!(validate_nickname("ab").is_err());
        assert!(validate_nickname("1trader").is_err());
        assert!(validate_nickname("_trader").is_err());
        assert!(validate_nickname("trader one").is_err());
        assert!(validate_nickname("trädér").is_err());
        assert!(validate_nickname(&"a".repeat(21)).is_err());
    }

    #[test]
    fn test_password_rules() {
        assert!(validate_password("secret1").is_ok());
        assert!(validate_password("12345").is_err());
        assert!(validate_password("      ").is_err());
        assert!(validate_password(&"x".repeat(101)).is_err());
    }

    #[test]
    fn test_email_rules() {
        assert!(validate_email("user@example.com").is_ok());
        assert!(validate_email("user@localhost").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("user.example.com").is_err());
    }
}
