//! PostgreSQL storage backend for storefront-auth.
//!
//! Provides persistent storage for:
//!
//! - Credentials (`auth_credentials`)
//! - Signing key versions (`auth_signing_keys`)
//! - Revoked token and session ids (`auth_revocations`)
//! - The session index (`auth_sessions`)
//! - Account verification tokens (`auth_verification_tokens`)
//!
//! Each store implements the matching `storefront_auth::storage` trait and
//! owns an `Arc<PgPool>`, so it can be shared as `Arc<dyn ...>`.
//!
//! # Example
//!
//! ```ignore
//! use storefront_auth_postgres::PostgresAuthStorage;
//!
//! let storage = PostgresAuthStorage::connect("postgres://localhost/storefront", 10).await?;
//! storage.migrate().await?;
//! let stores = storage.stores();
//! ```

pub mod credential;
pub mod key;
pub mod revoked_token;
pub mod session;
pub mod verification;

use std::sync::Arc;

use sqlx_core::pool::Pool;
use sqlx_core::query::query;
use sqlx_postgres::Postgres;
use storefront_auth::AuthError;
use storefront_auth::session::AuthStores;

pub use credential::PostgresCredentialStorage;
pub use key::PostgresKeyStorage;
pub use revoked_token::PostgresRevocationStorage;
pub use session::PostgresSessionStorage;
pub use verification::PostgresVerificationStorage;

/// PostgreSQL connection pool type alias.
pub type PgPool = Pool<Postgres>;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during auth storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx_core::Error),

    /// Row already exists (unique violation).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A stored value could not be interpreted.
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl StorageError {
    /// Create a `Conflict` error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Create a `Corrupt` error.
    #[must_use]
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt(message.into())
    }

    /// Returns `true` if this is a `Conflict` error.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Returns `true` if the failure is about availability rather than data:
    /// pool exhaustion, closed pool, network or TLS trouble.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Database(
                sqlx_core::Error::PoolTimedOut
                    | sqlx_core::Error::PoolClosed
                    | sqlx_core::Error::WorkerCrashed
                    | sqlx_core::Error::Io(_)
                    | sqlx_core::Error::Tls(_)
            )
        )
    }

    /// Returns `true` if a stored row could not be decoded.
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        matches!(
            self,
            Self::Corrupt(_)
                | Self::Database(
                    sqlx_core::Error::ColumnDecode { .. }
                        | sqlx_core::Error::Decode(_)
                        | sqlx_core::Error::ColumnNotFound(_)
                )
        )
    }

    /// Returns `true` if the database reported a unique violation.
    #[must_use]
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Database(sqlx_core::Error::Database(db)) => db.is_unique_violation(),
            _ => false,
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for AuthError {
    fn from(err: StorageError) -> Self {
        if err.is_unavailable() {
            tracing::warn!(error = %err, "Database unavailable");
            AuthError::transient(err.to_string())
        } else if err.is_corrupt() {
            tracing::error!(error = %err, "Corrupt auth row");
            AuthError::integrity(err.to_string())
        } else {
            AuthError::internal(err.to_string())
        }
    }
}

// =============================================================================
// PostgreSQL Auth Storage
// =============================================================================

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS auth_credentials (
        subject        TEXT PRIMARY KEY,
        password_hash  TEXT NOT NULL,
        salt           TEXT NOT NULL,
        key_version    INTEGER NOT NULL,
        role           TEXT NOT NULL,
        enabled        BOOLEAN NOT NULL DEFAULT TRUE,
        verified_at    TIMESTAMPTZ,
        created_at     TIMESTAMPTZ NOT NULL,
        updated_at     TIMESTAMPTZ NOT NULL
    )
    "#,
    // Accounts created before verification existed count as verified.
    "ALTER TABLE auth_credentials ADD COLUMN IF NOT EXISTS verified_at TIMESTAMPTZ DEFAULT now()",
    "ALTER TABLE auth_credentials ALTER COLUMN verified_at DROP DEFAULT",
    r#"
    CREATE TABLE IF NOT EXISTS auth_signing_keys (
        version        INTEGER PRIMARY KEY,
        algorithm      TEXT NOT NULL,
        secret         BYTEA NOT NULL,
        created_at     TIMESTAMPTZ NOT NULL,
        superseded_at  TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS auth_revocations (
        token_id    TEXT PRIMARY KEY,
        subject     TEXT NOT NULL,
        reason      TEXT NOT NULL,
        revoked_at  TIMESTAMPTZ NOT NULL,
        expires_at  TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS auth_revocations_expires_at ON auth_revocations (expires_at)",
    r#"
    CREATE TABLE IF NOT EXISTS auth_sessions (
        session_id        TEXT PRIMARY KEY,
        subject           TEXT NOT NULL,
        device            TEXT,
        refresh_token_id  TEXT NOT NULL,
        expires_at        TIMESTAMPTZ NOT NULL,
        created_at        TIMESTAMPTZ NOT NULL,
        updated_at        TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS auth_sessions_subject ON auth_sessions (subject)",
    "CREATE INDEX IF NOT EXISTS auth_sessions_expires_at ON auth_sessions (expires_at)",
    r#"
    CREATE TABLE IF NOT EXISTS auth_verification_tokens (
        token       TEXT PRIMARY KEY,
        subject     TEXT NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL,
        expires_at  TIMESTAMPTZ NOT NULL,
        used_at     TIMESTAMPTZ
    )
    "#,
    "CREATE INDEX IF NOT EXISTS auth_verification_tokens_expires_at ON auth_verification_tokens (expires_at)",
];

/// PostgreSQL storage backend for authentication data.
#[derive(Debug, Clone)]
pub struct PostgresAuthStorage {
    pool: Arc<PgPool>,
}

impl PostgresAuthStorage {
    /// Create new storage with an existing connection pool.
    #[must_use]
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Create new storage by connecting to the database.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> StorageResult<Self> {
        use sqlx_core::pool::PoolOptions;
        let pool = PoolOptions::<Postgres>::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        tracing::info!(max_connections, "Connected to PostgreSQL");
        Ok(Self::new(Arc::new(pool)))
    }

    /// Creates the auth tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if a DDL statement fails.
    pub async fn migrate(&self) -> StorageResult<()> {
        for statement in SCHEMA.iter().copied() {
            query(statement).execute(self.pool.as_ref()).await?;
        }
        tracing::debug!(statements = SCHEMA.len(), "Auth schema ready");
        Ok(())
    }

    /// Get a reference to the connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Credential storage.
    #[must_use]
    pub fn credentials(&self) -> PostgresCredentialStorage {
        PostgresCredentialStorage::new(Arc::clone(&self.pool))
    }

    /// Signing key storage.
    #[must_use]
    pub fn keys(&self) -> PostgresKeyStorage {
        PostgresKeyStorage::new(Arc::clone(&self.pool))
    }

    /// Account verification token storage.
    #[must_use]
    pub fn verifications(&self) -> PostgresVerificationStorage {
        PostgresVerificationStorage::new(Arc::clone(&self.pool))
    }

    /// Revocation storage.
    #[must_use]
    pub fn revocations(&self) -> PostgresRevocationStorage {
        PostgresRevocationStorage::new(Arc::clone(&self.pool))
    }

    /// Session index storage.
    #[must_use]
    pub fn sessions(&self) -> PostgresSessionStorage {
        PostgresSessionStorage::new(Arc::clone(&self.pool))
    }

    /// Every store, ready for the session orchestrator.
    #[must_use]
    pub fn stores(&self) -> AuthStores {
        AuthStores {
            credentials: Arc::new(self.credentials()),
            keys: Arc::new(self.keys()),
            revocations: Arc::new(self.revocations()),
            sessions: Arc::new(self.sessions()),
            verifications: Arc::new(self.verifications()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
