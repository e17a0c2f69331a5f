//! Authentication Models
//! Mission: Define credential, session and account data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// JWT claims payload, shared by access and refresh credentials
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub user_id: i64, // subject (account id)
    pub nickname: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: Uuid, // keeps two credentials minted in the same second distinct
}

/// Authenticated caller, placed in request extensions by the auth middleware
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Principal {
    pub user_id: i64,
    pub nickname: String,
}

impl From<&Claims> for Principal {
    fn from(claims: &Claims) -> Self {
        Self {
            user_id: claims.user_id,
            nickname: claims.nickname.clone(),
        }
    }
}

/// Server-side record backing a refresh credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: Uuid,
    pub owner_id: i64,
    pub credential: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// User account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub nickname: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String, // bcrypt hash - never serialize
    pub created_at: String,
}

/// Registration awaiting its emailed code
#[derive(Debug, Clone)]
pub struct PendingVerification {
    pub email: String,
    pub nickname: String,
    pub password_hash: String,
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub nickname: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyEmailRequest {
    pub email: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct ResendCodeRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub nickname: String,
    pub password: String,
}

/// Body returned after login or email verification; tokens travel in cookies
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub message: String,
    pub user_id: i64,
    pub nickname: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_session_active_window() {
        let now = Utc::now();
        let record = SessionRecord {
            id: Uuid::new_v4(),
            owner_id: 1,
            credential: "tok".to_string(),
            expires_at: now + Duration::days(30),
            created_at: now,
        };
        assert!(record.is_active_at(now));
        assert!(!record.is_active_at(now + Duration::days(30)));
    }

    #[test]
    fn test_account_hides_password_hash() {
        let account = Account {
            id: 3,
            nickname: "trader".to_string(),
            email: "t@example.com".to_string(),
            password_hash: "$2b$12$secret".to_string(),
            created_at: Utc::now().to_rfc3339(),
        };
        let json = serde_json::to_string(&account).unwrap();
        assert!(!json.contains("password_hash"));
        assert!(!json.contains("secret"));
    }
}
