//! Signing key storage for PostgreSQL.
//!
//! One row per key version in `auth_signing_keys`. The primary key on
//! `version` settles concurrent rotations: the second insert of a version
//! affects no rows.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use storefront_auth::AuthResult;
use storefront_auth::credential::{KeyVersion, SigningAlgorithm};
use storefront_auth::storage::{KeyStorage, StoredKey};
use time::OffsetDateTime;

use crate::{PgPool, StorageError, StorageResult};

type KeyTuple = (i32, String, Vec<u8>, OffsetDateTime, Option<OffsetDateTime>);

fn key_from_tuple(row: KeyTuple) -> StorageResult<StoredKey> {
    let (version, algorithm, secret, created_at, superseded_at) = row;
    let version = u32::try_from(version)
        .ok()
        .filter(|v| *v > 0)
        .map(KeyVersion::new)
        .ok_or_else(|| StorageError::corrupt(format!("signing key has version {version}")))?;
    let algorithm: SigningAlgorithm = algorithm
        .parse()
        .map_err(|e| StorageError::corrupt(format!("signing key {version}: {e}")))?;
    if secret.is_empty() {
        return Err(StorageError::corrupt(format!(
            "signing key {version} has no material"
        )));
    }
    Ok(StoredKey {
        version,
        algorithm,
        secret,
        created_at,
        superseded_at,
    })
}

fn version_column(version: KeyVersion) -> StorageResult<i32> {
    i32::try_from(version.get())
        .map_err(|_| StorageError::corrupt(format!("key version {version} out of range")))
}

/// PostgreSQL [`KeyStorage`].
#[derive(Debug, Clone)]
pub struct PostgresKeyStorage {
    pool: Arc<PgPool>,
}

impl PostgresKeyStorage {
    /// Create a new key storage.
    #[must_use]
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    async fn insert_row(&self, key: &StoredKey) -> StorageResult<bool> {
        let result = query(
            r#"
            INSERT INTO auth_signing_keys (version, algorithm, secret, created_at, superseded_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (version) DO NOTHING
            "#,
        )
        .bind(version_column(key.version)?)
        .bind(key.algorithm.as_str())
        .bind(&key.secret)
        .bind(key.created_at)
        .bind(key.superseded_at)
        .execute(self.pool.as_ref())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_rows(&self) -> StorageResult<Vec<StoredKey>> {
        let rows: Vec<KeyTuple> = query_as(
            r#"
            SELECT version, algorithm, secret, created_at, superseded_at
            FROM auth_signing_keys
            ORDER BY version
            "#,
        )
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.into_iter().map(key_from_tuple).collect()
    }

    async fn supersede_row(&self, version: KeyVersion, at: OffsetDateTime) -> StorageResult<()> {
        query(
            r#"
            UPDATE auth_signing_keys
            SET superseded_at = LEAST(COALESCE(superseded_at, $2), $2)
            WHERE version = $1
            "#,
        )
        .bind(version_column(version)?)
        .bind(at)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn delete_row(&self, version: KeyVersion) -> StorageResult<bool> {
        let result = query("DELETE FROM auth_signing_keys WHERE version = $1")
            .bind(version_column(version)?)
            .execute(self.pool.as_ref())
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl KeyStorage for PostgresKeyStorage {
    async fn insert_if_absent(&self, key: &StoredKey) -> AuthResult<bool> {
        match self.insert_row(key).await {
            Ok(created) => Ok(created),
            Err(e) if e.is_unique_violation() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> AuthResult<Vec<StoredKey>> {
        Ok(self.list_rows().await?)
    }

    async fn mark_superseded(&self, version: KeyVersion, at: OffsetDateTime) -> AuthResult<()> {
        Ok(self.supersede_row(version, at).await?)
    }

    async fn delete(&self, version: KeyVersion) -> AuthResult<bool> {
        Ok(self.delete_row(version).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple() -> KeyTuple {
        let now = OffsetDateTime::now_utc();
        (3, "ES384".to_string(), vec![0x30, 0x81], now, None)
    }

    #[test]
    fn test_row_into_stored_key() {
        let key = key_from_tuple(tuple()).unwrap();
        assert_eq!(key.version, KeyVersion::new(3));
        assert_eq!(key.algorithm, SigningAlgorithm::ES384);
        assert_eq!(version_column(key.version).unwrap(), 3);
    }

    #[test]
    fn test_corrupt_key_rows_rejected() {
        let (_, algorithm, secret, created_at, superseded_at) = tuple();
        let zero = (0, algorithm.clone(), secret.clone(), created_at, superseded_at);
        assert!(key_from_tuple(zero).unwrap_err().is_corrupt());

        let unknown = (3, "none".to_string(), secret, created_at, superseded_at);
        assert!(key_from_tuple(unknown).unwrap_err().is_corrupt());

        let empty = (3, algorithm, Vec::new(), created_at, superseded_at);
        assert!(key_from_tuple(empty).unwrap_err().is_corrupt());
    }
}
