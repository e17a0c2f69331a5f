//! Service Configuration
//! Mission: One typed view of flags and environment, failing closed on secrets

use crate::middleware::rate_limit::MAX_BLOCK_DURATION;
use clap::Parser;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Shortest signing secret accepted for HS256.
pub const MIN_SECRET_LEN: usize = 32;

/// Longest credential lifetime accepted (ten years).
pub const MAX_TTL_SECS: i64 = 10 * 365 * 24 * 60 * 60;

/// Longest request timeout, storage deadline or sweep period accepted.
pub const MAX_WAIT_SECS: u64 = 24 * 60 * 60;

#[derive(Parser, Debug, Clone)]
#[command(name = "marketgate")]
#[command(about = "Marketplace API access-control service")]
pub struct Config {
    /// Listen address
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:3000")]
    pub bind_addr: String,

    /// SQLite file holding accounts, verifications and sessions
    #[arg(long, env = "AUTH_DB_PATH", default_value = "marketgate_auth.db")]
    pub auth_db_path: String,

    /// Access credential signing secret
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,

    /// Refresh credential signing secret, must differ from the access secret
    #[arg(long, env = "JWT_REFRESH_SECRET", hide_env_values = true)]
    pub jwt_refresh_secret: Option<String>,

    #[arg(long, env = "ACCESS_TOKEN_TTL_SECS", default_value = "180")]
    pub access_token_ttl_secs: i64,

    #[arg(long, env = "REFRESH_TOKEN_TTL_SECS", default_value = "2592000")]
    pub refresh_token_ttl_secs: i64,

    /// Budget for the whole handler chain
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value = "30")]
    pub request_timeout_secs: u64,

    /// Budget for a single session-store call
    #[arg(long, env = "STORAGE_DEADLINE_MS", default_value = "5000")]
    pub storage_deadline_ms: u64,

    #[arg(long, env = "RATE_LIMIT_SWEEP_SECS", default_value = "300")]
    pub rate_limit_sweep_secs: u64,

    #[arg(long, env = "RATE_LIMIT_BLOCK_SECS", default_value = "900")]
    pub rate_limit_block_secs: u64,

    /// Proxies whose X-Forwarded-For is believed (comma-separated IPs)
    #[arg(long, env = "TRUSTED_PROXIES", value_delimiter = ',')]
    pub trusted_proxies: Vec<IpAddr>,

    /// CORS origins allowed to send credentials (comma-separated)
    #[arg(
        long,
        env = "ALLOWED_ORIGINS",
        value_delimiter = ',',
        default_value = "http://localhost:5173"
    )]
    pub allowed_origins: Vec<String>,

    /// Mark auth cookies Secure
    #[arg(long, env = "COOKIE_SECURE")]
    pub cookie_secure: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    MissingSecret(&'static str),
    #[error("{0} must be at least {} bytes", MIN_SECRET_LEN)]
    WeakSecret(&'static str),
    #[error("JWT_SECRET and JWT_REFRESH_SECRET must differ")]
    SharedSecret,
    #[error("{0} must be positive")]
    NonPositive(&'static str),
    #[error("{0} is out of range")]
    OutOfRange(&'static str),
}

/// Validated signing secrets, one per credential class.
#[derive(Clone)]
pub struct SigningSecrets {
    pub access: String,
    pub refresh: String,
}

impl std::fmt::Debug for SigningSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SigningSecrets { .. }")
    }
}

fn require_secret(value: &Option<String>, name: &'static str) -> Result<String, ConfigError> {
    let secret = value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(ConfigError::MissingSecret(name))?;
    if secret.len() < MIN_SECRET_LEN {
        return Err(ConfigError::WeakSecret(name));
    }
    Ok(secret.to_string())
}

impl Config {
    /// Check everything that must hold before the service may start.
    pub fn validate(&self) -> Result<SigningSecrets, ConfigError> {
        let access = require_secret(&self.jwt_secret, "JWT_SECRET")?;
        let refresh = require_secret(&self.jwt_refresh_secret, "JWT_REFRESH_SECRET")?;
        if access == refresh {
            return Err(ConfigError::SharedSecret);
        }

        if self.access_token_ttl_secs <= 0 {
            return Err(ConfigError::NonPositive("ACCESS_TOKEN_TTL_SECS"));
        }
        if self.refresh_token_ttl_secs <= 0 {
            return Err(ConfigError::NonPositive("REFRESH_TOKEN_TTL_SECS"));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::NonPositive("REQUEST_TIMEOUT_SECS"));
        }
        if self.storage_deadline_ms == 0 {
            return Err(ConfigError::NonPositive("STORAGE_DEADLINE_MS"));
        }
        if self.rate_limit_sweep_secs == 0 {
            return Err(ConfigError::NonPositive("RATE_LIMIT_SWEEP_SECS"));
        }

        if self.access_token_ttl_secs > MAX_TTL_SECS {
            return Err(ConfigError::OutOfRange("ACCESS_TOKEN_TTL_SECS"));
        }
        if self.refresh_token_ttl_secs > MAX_TTL_SECS {
            return Err(ConfigError::OutOfRange("REFRESH_TOKEN_TTL_SECS"));
        }
        if self.request_timeout_secs > MAX_WAIT_SECS {
            return Err(ConfigError::OutOfRange("REQUEST_TIMEOUT_SECS"));
        }
        if self.storage_deadline_ms / 1000 > MAX_WAIT_SECS {
            return Err(ConfigError::OutOfRange("STORAGE_DEADLINE_MS"));
        }
        if self.rate_limit_sweep_secs > MAX_WAIT_SECS {
            return Err(ConfigError::OutOfRange("RATE_LIMIT_SWEEP_SECS"));
        }
        if self.rate_limit_block_secs > MAX_BLOCK_DURATION.as_secs() {
            return Err(ConfigError::OutOfRange("RATE_LIMIT_BLOCK_SECS"));
        }

        Ok(SigningSecrets { access, refresh })
    }

    pub fn access_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.access_token_ttl_secs.clamp(0, MAX_TTL_SECS))
    }

    pub fn refresh_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_token_ttl_secs.clamp(0, MAX_TTL_SECS))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn storage_deadline(&self) -> Duration {
        Duration::from_millis(self.storage_deadline_ms)
    }

    pub fn sweep_period(&self) -> Duration {
        Duration::from_secs(self.rate_limit_sweep_secs)
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.rate_limit_block_secs)
    }
}
