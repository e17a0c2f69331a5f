//! Session Storage
//! Mission: Durable record of live refresh credentials, the source of truth for revocation
//!
//! `AuthGate` only sees the [`SessionStore`] trait, so the SQLite table can be
//! swapped for a keyed cache without touching the gate.

use crate::auth::models::SessionRecord;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session credential already exists")]
    Conflict,
    #[error("session storage unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
                StoreError::Conflict
            }
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a session. Fails with [`StoreError::Conflict`] if the credential exists.
    async fn create(
        &self,
        owner_id: i64,
        credential: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<SessionRecord, StoreError>;

    /// Matching, unexpired session for this credential and owner, if any.
    async fn find_active(
        &self,
        credential: &str,
        owner_id: i64,
    ) -> Result<Option<SessionRecord>, StoreError>;

    /// Remove a session. Removing an absent one is not an error.
    async fn delete(&self, credential: &str) -> Result<(), StoreError>;
}

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    owner_id INTEGER NOT NULL,
    token TEXT NOT NULL UNIQUE,
    expires_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_owner ON sessions(owner_id);
"#;

fn from_unix(secs: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| StoreError::Unavailable(format!("invalid timestamp in sessions: {secs}")))
}

/// SQLite-backed session table
#[derive(Clone)]
pub struct SqliteSessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSessionStore {
    pub fn new(db_path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(db_path).context("open session db")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("initialize sessions schema")?;

        info!("🔐 Session store initialized at: {}", db_path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a statement on the blocking pool so request tasks never stall the runtime.
    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("session task failed: {e}")))?
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create(
        &self,
        owner_id: i64,
        credential: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<SessionRecord, StoreError> {
        let record = SessionRecord {
            id: Uuid::new_v4(),
            owner_id,
            credential: credential.to_string(),
            expires_at,
            created_at: Utc::now(),
        };
        let row = record.clone();

        self.run(move |conn| {
            conn.execute(
                "INSERT INTO sessions (id, owner_id, token, expires_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    row.id.to_string(),
                    row.owner_id,
                    row.credential,
                    row.expires_at.timestamp(),
                    row.created_at.timestamp(),
                ],
            )?;
            Ok(())
        })
        .await?;

        debug!(owner_id, session_id = %record.id, "Session created");
        Ok(record)
    }

    async fn find_active(
        &self,
        credential: &str,
        owner_id: i64,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let credential = credential.to_string();
        let now = Utc::now().timestamp();

        let row = self
            .run(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, owner_id, token, expires_at, created_at
                     FROM sessions
                     WHERE token = ?1 AND owner_id = ?2 AND expires_at > ?3
                     LIMIT 1",
                )?;
                let row = stmt
                    .query_row(params![credential, owner_id, now], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, i64>(4)?,
                        ))
                    })
                    .optional()?;
                Ok(row)
            })
            .await?;

        let Some((id, owner_id, credential, expires_at, created_at)) = row else {
            return Ok(None);
        };

        Ok(Some(SessionRecord {
            id: Uuid::parse_str(&id)
                .map_err(|e| StoreError::Unavailable(format!("invalid session id: {e}")))?,
            owner_id,
            credential,
            expires_at: from_unix(expires_at)?,
            created_at: from_unix(created_at)?,
        }))
    }

    async fn delete(&self, credential: &str) -> Result<(), StoreError> {
        let credential = credential.to_string();
        let removed = self
            .run(move |conn| {
                Ok(conn.execute("DELETE FROM sessions WHERE token = ?1", params![credential])?)
            })
            .await?;

        debug!(removed, "Session delete");
        Ok(())
    }
}

/// In-process session store keyed by a SHA-256 fingerprint of the credential.
///
/// Raw credential values are never used as map keys.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn fingerprint(credential: &str) -> String {
        hex::encode(Sha256::digest(credential.as_bytes()))
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(
        &self,
        owner_id: i64,
        credential: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<SessionRecord, StoreError> {
        let key = Self::fingerprint(credential);
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&key) {
            return Err(StoreError::Conflict);
        }

        let record = SessionRecord {
            id: Uuid::new_v4(),
            owner_id,
            credential: credential.to_string(),
            expires_at,
            created_at: Utc::now(),
        };
        sessions.insert(key, record.clone());
        Ok(record)
    }

    async fn find_active(
        &self,
        credential: &str,
        owner_id: i64,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let now = Utc::now();
        let sessions = self.sessions.read();
        Ok(sessions
            .get(&Self::fingerprint(credential))
            .filter(|r| r.owner_id == owner_id && r.credential == credential && r.is_active_at(now))
            .cloned())
    }

    async fn delete(&self, credential: &str) -> Result<(), StoreError> {
        self.sessions
            .write()
            .remove(&Self::fingerprint(credential));
        Ok(())
    }
}
