//! Auth Gate
//! Mission: Decide per request whether the caller is authenticated, renewing
//! an expired access credential from a live session when possible
//!
//! `Start -> TryAccess -> {Authenticated | TryRefresh} -> {Authenticated | Rejected}`
//!
//! The access path is pure signature work. The session table is only read on
//! the refresh path, so storage load is bounded to once per access TTL per
//! active caller. Concurrent renewals for the same session are not serialized;
//! each mints its own access credential and the last cookie written wins.

use crate::auth::jwt::{CredentialKind, IssuedToken, TokenIssuer};
use crate::auth::models::{Claims, Principal};
use crate::auth::session_store::SessionStore;
use crate::error::AuthError;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

/// Result of a successful evaluation.
#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub principal: Principal,
    /// Set when the refresh path ran; the caller must write it as the access cookie.
    pub renewed: Option<IssuedToken>,
}

#[derive(Clone)]
pub struct AuthGate {
    issuer: Arc<TokenIssuer>,
    sessions: Arc<dyn SessionStore>,
    storage_deadline: Duration,
}

impl AuthGate {
    pub fn new(
        issuer: Arc<TokenIssuer>,
        sessions: Arc<dyn SessionStore>,
        storage_deadline: Duration,
    ) -> Self {
        Self {
            issuer,
            sessions,
            storage_deadline,
        }
    }

    pub fn storage_deadline(&self) -> Duration {
        self.storage_deadline
    }

    /// Evaluate with the configured storage deadline starting now.
    pub async fn evaluate(
        &self,
        access: Option<&str>,
        refresh: Option<&str>,
    ) -> Result<GateOutcome, AuthError> {
        self.evaluate_until(access, refresh, Instant::now() + self.storage_deadline)
            .await
    }

    pub async fn evaluate_until(
        &self,
        access: Option<&str>,
        refresh: Option<&str>,
        deadline: Instant,
    ) -> Result<GateOutcome, AuthError> {
        if let Some(token) = access {
            match self.issuer.verify(token, CredentialKind::Access) {
                Ok(claims) => {
                    return Ok(GateOutcome {
                        principal: Principal::from(&claims),
                        renewed: None,
                    })
                }
                Err(e) => debug!(reason = %e, "Access credential rejected, trying refresh"),
            }
        }

        let Some(refresh) = refresh else {
            return Err(AuthError::MissingCredential);
        };

        let (claims, renewed) = self.renew_until(refresh, deadline).await?;
        Ok(GateOutcome {
            principal: Principal::from(&claims),
            renewed: Some(renewed),
        })
    }

    /// Refresh path on its own: verify, check the session, mint a new access credential.
    pub async fn renew(&self, refresh: &str) -> Result<(Claims, IssuedToken), AuthError> {
        self.renew_until(refresh, Instant::now() + self.storage_deadline)
            .await
    }

    pub async fn renew_until(
        &self,
        refresh: &str,
        deadline: Instant,
    ) -> Result<(Claims, IssuedToken), AuthError> {
        let claims = self.issuer.verify(refresh, CredentialKind::Refresh)?;

        let session = timeout_at(deadline, self.sessions.find_active(refresh, claims.user_id))
            .await
            .map_err(|_| AuthError::Timeout)??;

        if session.is_none() {
            debug!(user_id = claims.user_id, "Refresh credential has no active session");
            return Err(AuthError::RevokedSession);
        }

        let renewed = self.issuer.mint_access(claims.user_id, &claims.nickname)?;
        debug!(user_id = claims.user_id, "Access credential renewed");
        Ok((claims, renewed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::models::SessionRecord;
    use crate::auth::session_store::{MemorySessionStore, StoreError};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts lookups so tests can prove the access path does no I/O.
    #[derive(Default)]
    struct CountingStore {
        inner: MemorySessionStore,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl SessionStore for CountingStore {
        async fn create(
            &self,
            owner_id: i64,
            credential: &str,
            expires_at: DateTime<Utc>,
        ) -> Result<SessionRecord, StoreError> {
            self.inner.create(owner_id, credential, expires_at).await
        }

        async fn find_active(
            &self,
            credential: &str,
            owner_id: i64,
        ) -> Result<Option<SessionRecord>, StoreError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.find_active(credential, owner_id).await
        }

        async fn delete(&self, credential: &str) -> Result<(), StoreError> {
            self.inner.delete(credential).await
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl SessionStore for BrokenStore {
        async fn create(
            &self,
            _owner_id: i64,
            _credential: &str,
            _expires_at: DateTime<Utc>,
        ) -> Result<SessionRecord, StoreError> {
            Err(StoreError::Unavailable("disk gone".into()))
        }

        async fn find_active(
            &self,
            _credential: &str,
            _owner_id: i64,
        ) -> Result<Option<SessionRecord>, StoreError> {
            Err(StoreError::Unavailable("disk gone".into()))
        }

        async fn delete(&self, _credential: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("disk gone".into()))
        }
    }

    struct StalledStore;

    #[async_trait]
    impl SessionStore for StalledStore {
        async fn create(
            &self,
            _owner_id: i64,
            _credential: &str,
            _expires_at: DateTime<Utc>,
        ) -> Result<SessionRecord, StoreError> {
            std::future::pending().await
        }

        async fn find_active(
            &self,
            _credential: &str,
            _owner_id: i64,
        ) -> Result<Option<SessionRecord>, StoreError> {
            std::future::pending().await
        }

        async fn delete(&self, _credential: &str) -> Result<(), StoreError> {
            std::future::pending().await
        }
    }

    fn issuer() -> Arc<TokenIssuer> {
        Arc::new(TokenIssuer::new(
            "gate-access-secret-0123456789abcdef",
            "gate-refresh-secret-0123456789abcdef",
            chrono::Duration::minutes(3),
            chrono::Duration::days(30),
        ))
    }

    fn gate_with(store: Arc<dyn SessionStore>) -> (AuthGate, Arc<TokenIssuer>) {
        let issuer = issuer();
        let gate = AuthGate::new(issuer.clone(), store, Duration::from_millis(200));
        (gate, issuer)
    }

    async fn login(issuer: &TokenIssuer, store: &dyn SessionStore, user_id: i64) -> IssuedToken {
        let refresh = issuer.mint_refresh(user_id, "trader").unwrap();
        store
            .create(
                user_id,
                &refresh.token,
                Utc::now() + chrono::Duration::days(30),
            )
            .await
            .unwrap();
        refresh
    }

    #[tokio::test]
    async fn test_valid_access_never_touches_store() {
        let store = Arc::new(CountingStore::default());
        let (gate, issuer) = gate_with(store.clone());
        let access = issuer.mint_access(7, "trader").unwrap();

        let outcome = gate.evaluate(Some(&access.token), None).await.unwrap();
        assert_eq!(outcome.principal.user_id, 7);
        assert!(outcome.renewed.is_none());
        assert_eq!(store.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_expired_access_renews_from_session() {
        let store = Arc::new(CountingStore::default());
        let (gate, issuer) = gate_with(store.clone());
        let refresh = login(&issuer, &*store, 7).await;

        let stale = issuer
            .mint_at(
                CredentialKind::Access,
                7,
                "trader",
                Utc::now() - chrono::Duration::minutes(10),
            )
            .unwrap();

        let outcome = gate
            .evaluate(Some(&stale.token), Some(&refresh.token))
            .await
            .unwrap();
        assert_eq!(outcome.principal.nickname, "trader");
        let renewed = outcome.renewed.expect("renewal");
        assert!(issuer
            .verify(&renewed.token, CredentialKind::Access)
            .is_ok());
        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_both_is_missing_credential() {
        let (gate, _) = gate_with(Arc::new(MemorySessionStore::new()));
        assert!(matches!(
            gate.evaluate(None, None).await,
            Err(AuthError::MissingCredential)
        ));
    }

    #[tokio::test]
    async fn test_forged_access_without_refresh_rejected() {
        let (gate, _) = gate_with(Arc::new(MemorySessionStore::new()));
        let err = gate.evaluate(Some("not.a.jwt"), None).await.unwrap_err();
        assert!(err.is_credential_failure());
    }

    #[tokio::test]
    async fn test_refresh_signed_with_access_secret_rejected() {
        let store = Arc::new(MemorySessionStore::new());
        let (gate, issuer) = gate_with(store.clone());
        let wrong = issuer.mint_access(7, "trader").unwrap();

        assert!(matches!(
            gate.evaluate(None, Some(&wrong.token)).await,
            Err(AuthError::SignatureInvalid)
        ));
    }

    #[tokio::test]
    async fn test_deleted_session_is_revoked() {
        let store = Arc::new(MemorySessionStore::new());
        let (gate, issuer) = gate_with(store.clone());
        let refresh = login(&issuer, &*store, 7).await;

        assert!(gate.evaluate(None, Some(&refresh.token)).await.is_ok());

        store.delete(&refresh.token).await.unwrap();
        assert!(matches!(
            gate.evaluate(None, Some(&refresh.token)).await,
            Err(AuthError::RevokedSession)
        ));
    }

    #[tokio::test]
    async fn test_session_owner_must_match_claims() {
        let store = Arc::new(MemorySessionStore::new());
        let (gate, issuer) = gate_with(store.clone());
        let refresh = issuer.mint_refresh(7, "trader").unwrap();
        store
            .create(8, &refresh.token, Utc::now() + chrono::Duration::days(1))
            .await
            .unwrap();

        assert!(matches!(
            gate.evaluate(None, Some(&refresh.token)).await,
            Err(AuthError::RevokedSession)
        ));
    }

    #[tokio::test]
    async fn test_store_failure_is_not_unauthorized() {
        let (gate, issuer) = gate_with(Arc::new(BrokenStore));
        let refresh = issuer.mint_refresh(7, "trader").unwrap();

        let err = gate.evaluate(None, Some(&refresh.token)).await.unwrap_err();
        assert!(matches!(err, AuthError::StorageUnavailable(_)));
        assert!(!err.is_credential_failure());
    }

    #[tokio::test]
    async fn test_stalled_store_hits_deadline() {
        let (gate, issuer) = gate_with(Arc::new(StalledStore));
        let refresh = issuer.mint_refresh(7, "trader").unwrap();

        let err = gate
            .evaluate_until(
                None,
                Some(&refresh.token),
                Instant::now() + Duration::from_millis(20),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Timeout));
    }
}
