//! JWT Token Issuer
//! Mission: Mint and verify access/refresh credentials with separate secrets

use crate::auth::models::Claims;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Which secret a credential is signed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Access,
    Refresh,
}

impl CredentialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKind::Access => "access",
            CredentialKind::Refresh => "refresh",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("invalid signature")]
    SignatureInvalid,
    #[error("token expired")]
    Expired,
    #[error("failed to sign token: {0}")]
    Signing(String),
}

/// A freshly minted credential together with the claims it carries.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claims: Claims,
    pub ttl: Duration,
}

struct SigningKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl SigningKeys {
    fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        }
    }
}

/// Issues and verifies both credential classes. Holds no shared state.
pub struct TokenIssuer {
    access: SigningKeys,
    refresh: SigningKeys,
    validation: Validation,
}

impl TokenIssuer {
    /// Secrets must already be validated by [`crate::config::Config::validate`].
    pub fn new(
        access_secret: &str,
        refresh_secret: &str,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Self {
        // Expiry is checked by hand against an explicit clock reading.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.leeway = 0;

        Self {
            access: SigningKeys::new(access_secret, access_ttl),
            refresh: SigningKeys::new(refresh_secret, refresh_ttl),
            validation,
        }
    }

    fn keys(&self, kind: CredentialKind) -> &SigningKeys {
        match kind {
            CredentialKind::Access => &self.access,
            CredentialKind::Refresh => &self.refresh,
        }
    }

    pub fn ttl(&self, kind: CredentialKind) -> Duration {
        self.keys(kind).ttl
    }

    pub fn mint_access(&self, subject_id: i64, display_name: &str) -> Result<IssuedToken, TokenError> {
        self.mint_at(CredentialKind::Access, subject_id, display_name, Utc::now())
    }

    pub fn mint_refresh(&self, subject_id: i64, display_name: &str) -> Result<IssuedToken, TokenError> {
        self.mint_at(CredentialKind::Refresh, subject_id, display_name, Utc::now())
    }

    pub fn mint_at(
        &self,
        kind: CredentialKind,
        subject_id: i64,
        display_name: &str,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken, TokenError> {
        let keys = self.keys(kind);
        let issued_at = now.timestamp();
        let claims = Claims {
            user_id: subject_id,
            nickname: display_name.to_string(),
            iat: issued_at,
            exp: issued_at + keys.ttl.num_seconds(),
            jti: Uuid::new_v4(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &keys.encoding)
            .map_err(|e| TokenError::Signing(e.to_string()))?;

        debug!(
            subject = subject_id,
            kind = kind.as_str(),
            ttl_secs = keys.ttl.num_seconds(),
            "Minted credential"
        );

        Ok(IssuedToken {
            token,
            claims,
            ttl: keys.ttl,
        })
    }

    pub fn verify(&self, token: &str, kind: CredentialKind) -> Result<Claims, TokenError> {
        self.verify_at(token, kind, Utc::now())
    }

    pub fn verify_at(
        &self,
        token: &str,
        kind: CredentialKind,
        now: DateTime<Utc>,
    ) -> Result<Claims, TokenError> {
        let decoded = decode::<Claims>(token, &self.keys(kind).decoding, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => TokenError::SignatureInvalid,
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Malformed,
            })?;

        if now.timestamp() >= decoded.claims.exp {
            return Err(TokenError::Expired);
        }

        Ok(decoded.claims)
    }
}
