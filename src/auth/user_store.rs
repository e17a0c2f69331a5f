//! Account Storage
//! Mission: Store accounts and pending email verifications with SQLite

use crate::auth::models::{Account, PendingVerification};
use anyhow::{Context, Result};
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tracing::info;

/// Lifetime of an emailed verification code
pub const VERIFICATION_CODE_TTL_MINUTES: i64 = 15;

/// Account storage with SQLite backend
#[derive(Clone)]
pub struct AccountStore {
    conn: Arc<Mutex<Connection>>,
    hash_cost: u32,
}

fn account_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        nickname: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn generate_code() -> String {
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000))
}

impl AccountStore {
    /// Create a new account store and initialize database
    pub fn new(db_path: &str) -> Result<Self> {
        Self::with_hash_cost(db_path, DEFAULT_COST)
    }

    /// Same as [`AccountStore::new`] with an explicit bcrypt cost.
    pub fn with_hash_cost(db_path: &str, hash_cost: u32) -> Result<Self> {
        let conn = Connection::open(db_path).context("open account db")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            hash_cost,
        })
    }

    /// Initialize database schema
    fn init_db(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                nickname TEXT UNIQUE NOT NULL,
                email TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS email_verifications (
                email TEXT PRIMARY KEY,
                nickname TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                code TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    /// Get account by nickname
    pub fn get_by_nickname(&self, nickname: &str) -> Result<Option<Account>> {
        let conn = self.conn.lock();
        let account = conn
            .query_row(
                "SELECT id, nickname, email, password_hash, created_at
                 FROM accounts WHERE nickname = ?1",
                params![nickname],
                account_from_row,
            )
            .optional()?;
        Ok(account)
    }

    /// Verify nickname and password, returning the account on success
    pub fn verify_login(&self, nickname: &str, password: &str) -> Result<Option<Account>> {
        let Some(account) = self.get_by_nickname(nickname)? else {
            return Ok(None);
        };

        let valid = verify(password, &account.password_hash).context("Failed to verify password")?;
        Ok(valid.then_some(account))
    }

    /// True if either the nickname or the email belongs to an existing account
    pub fn is_taken(&self, nickname: &str, email: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM accounts WHERE nickname = ?1 OR email = ?2",
            params![nickname, email],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Create an account from an already-hashed password
    pub fn create_account(&self, nickname: &str, email: &str, password_hash: &str) -> Result<Account> {
        let created_at = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO accounts (nickname, email, password_hash, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![nickname, email, password_hash, created_at],
        )
        .context("Failed to insert account")?;

        let account = Account {
            id: conn.last_insert_rowid(),
            nickname: nickname.to_string(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            created_at,
        };

        info!("✅ Created account: {} ({})", account.nickname, account.id);
        Ok(account)
    }

    /// Start (or restart) a registration: hash the password and issue a fresh code
    pub fn begin_verification(
        &self,
        nickname: &str,
        email: &str,
        password: &str,
    ) -> Result<PendingVerification> {
        let password_hash = hash(password, self.hash_cost).context("Failed to hash password")?;
        let pending = PendingVerification {
            email: email.to_string(),
            nickname: nickname.to_string(),
            password_hash,
            code: generate_code(),
            expires_at: Utc::now() + Duration::minutes(VERIFICATION_CODE_TTL_MINUTES),
        };

        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM email_verifications WHERE email = ?1 OR nickname = ?2",
            params![email, nickname],
        )?;
        conn.execute(
            "INSERT INTO email_verifications (email, nickname, password_hash, code, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                pending.email,
                pending.nickname,
                pending.password_hash,
                pending.code,
                pending.expires_at.timestamp(),
            ],
        )
        .context("Failed to insert verification")?;

        Ok(pending)
    }

    /// Issue a new code for an existing pending registration
    pub fn reissue_code(&self, email: &str) -> Result<Option<PendingVerification>> {
        let code = generate_code();
        let expires_at = Utc::now() + Duration::minutes(VERIFICATION_CODE_TTL_MINUTES);

        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE email_verifications SET code = ?1, expires_at = ?2 WHERE email = ?3",
            params![code, expires_at.timestamp(), email],
        )?;
        if updated == 0 {
            return Ok(None);
        }

        Self::load_pending(&conn, email)
    }

    /// Consume a pending registration if the code matches and has not expired
    pub fn take_verification(&self, email: &str, code: &str) -> Result<Option<PendingVerification>> {
        let conn = self.conn.lock();
        let Some(pending) = Self::load_pending(&conn, email)? else {
            return Ok(None);
        };

        if pending.code != code || pending.expires_at <= Utc::now() {
            return Ok(None);
        }

        conn.execute(
            "DELETE FROM email_verifications WHERE email = ?1",
            params![email],
        )?;
        Ok(Some(pending))
    }

    fn load_pending(conn: &Connection, email: &str) -> Result<Option<PendingVerification>> {
        let row = conn
            .query_row(
                "SELECT email, nickname, password_hash, code, expires_at
                 FROM email_verifications WHERE email = ?1",
                params![email],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((email, nickname, password_hash, code, expires_at)) = row else {
            return Ok(None);
        };

        Ok(Some(PendingVerification {
            email,
            nickname,
            password_hash,
            code,
            expires_at: DateTime::<Utc>::from_timestamp(expires_at, 0)
                .context("Invalid verification expiry")?,
        }))
    }
}
