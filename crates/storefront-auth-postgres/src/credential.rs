//! Credential storage for PostgreSQL.
//!
//! One row per subject in `auth_credentials`. Rows are never deleted;
//! closing an account clears `enabled`. `verified_at` stays NULL while the
//! account awaits verification.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use storefront_auth::credential::{Credential, KeyVersion, Role};
use storefront_auth::storage::CredentialStorage;
use storefront_auth::{AuthError, AuthResult};
use time::OffsetDateTime;

use crate::{PgPool, StorageError, StorageResult};

type CredentialTuple = (
    String,
    String,
    String,
    i32,
    String,
    bool,
    Option<OffsetDateTime>,
    OffsetDateTime,
    OffsetDateTime,
);

/// Raw `auth_credentials` row.
#[derive(Debug, Clone)]
pub struct CredentialRow {
    pub subject: String,
    pub password_hash: String,
    pub salt: String,
    pub key_version: i32,
    pub role: String,
    pub enabled: bool,
    pub verified_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl CredentialRow {
    fn from_tuple(row: CredentialTuple) -> Self {
        let (
            subject,
            password_hash,
            salt,
            key_version,
            role,
            enabled,
            verified_at,
            created_at,
            updated_at,
        ) = row;
        Self {
            subject,
            password_hash,
            salt,
            key_version,
            role,
            enabled,
            verified_at,
            created_at,
            updated_at,
        }
    }

    /// Converts the row into a [`Credential`], rejecting values the domain
    /// does not accept.
    pub fn into_credential(self) -> StorageResult<Credential> {
        let key_version = u32::try_from(self.key_version)
            .ok()
            .filter(|v| *v > 0)
            .map(KeyVersion::new)
            .ok_or_else(|| {
                StorageError::corrupt(format!(
                    "credential '{}' has key version {}",
                    self.subject, self.key_version
                ))
            })?;
        let role: Role = self.role.parse().map_err(|e: String| {
            StorageError::corrupt(format!("credential '{}': {e}", self.subject))
        })?;
        if self.salt.is_empty() || self.password_hash.is_empty() {
            return Err(StorageError::corrupt(format!(
                "credential '{}' has no password material",
                self.subject
            )));
        }
        Ok(Credential {
            subject: self.subject,
            password_hash: self.password_hash,
            salt: self.salt,
            key_version,
            role,
            enabled: self.enabled,
            verified_at: self.verified_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn key_version_column(credential: &Credential) -> StorageResult<i32> {
    i32::try_from(credential.key_version.get())
        .map_err(|_| StorageError::corrupt(format!("key version {} out of range", credential.key_version)))
}

/// PostgreSQL [`CredentialStorage`].
#[derive(Debug, Clone)]
pub struct PostgresCredentialStorage {
    pool: Arc<PgPool>,
}

impl PostgresCredentialStorage {
    /// Create a new credential storage.
    #[must_use]
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    async fn insert_row(&self, credential: &Credential) -> StorageResult<bool> {
        let result = query(
            r#"
            INSERT INTO auth_credentials
                (subject, password_hash, salt, key_version, role, enabled, verified_at,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (subject) DO NOTHING
            "#,
        )
        .bind(&credential.subject)
        .bind(&credential.password_hash)
        .bind(&credential.salt)
        .bind(key_version_column(credential)?)
        .bind(credential.role.as_str())
        .bind(credential.enabled)
        .bind(credential.verified_at)
        .bind(credential.created_at)
        .bind(credential.updated_at)
        .execute(self.pool.as_ref())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_row(&self, subject: &str) -> StorageResult<Option<CredentialRow>> {
        let row: Option<CredentialTuple> = query_as(
            r#"
            SELECT subject, password_hash, salt, key_version, role, enabled, verified_at,
                   created_at, updated_at
            FROM auth_credentials
            WHERE subject = $1
            "#,
        )
        .bind(subject)
        .fetch_optional(self.pool.as_ref())
        .await?;
        Ok(row.map(CredentialRow::from_tuple))
    }

    async fn update_row(&self, credential: &Credential) -> StorageResult<bool> {
        let result = query(
            r#"
            UPDATE auth_credentials
            SET password_hash = $2, salt = $3, key_version = $4, role = $5,
                enabled = $6, verified_at = $7, updated_at = $8
            WHERE subject = $1
            "#,
        )
        .bind(&credential.subject)
        .bind(&credential.password_hash)
        .bind(&credential.salt)
        .bind(key_version_column(credential)?)
        .bind(credential.role.as_str())
        .bind(credential.enabled)
        .bind(credential.verified_at)
        .bind(credential.updated_at)
        .execute(self.pool.as_ref())
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl CredentialStorage for PostgresCredentialStorage {
    async fn insert(&self, credential: &Credential) -> AuthResult<()> {
        match self.insert_row(credential).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(AuthError::duplicate_subject(&credential.subject)),
            Err(e) if e.is_unique_violation() => {
                Err(AuthError::duplicate_subject(&credential.subject))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find(&self, subject: &str) -> AuthResult<Option<Credential>> {
        match self.find_row(subject).await? {
            Some(row) => Ok(Some(row.into_credential()?)),
            None => Ok(None),
        }
    }

    async fn update(&self, credential: &Credential) -> AuthResult<()> {
        if self.update_row(credential).await? {
            Ok(())
        } else {
            Err(AuthError::unknown_subject(&credential.subject))
        }
    }
}
