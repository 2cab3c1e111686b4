//! Revocation entry storage for PostgreSQL.
//!
//! `INSERT ... ON CONFLICT DO NOTHING` on the `token_id` primary key makes
//! the conditional revoke atomic: exactly one concurrent insert affects a
//! row.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use storefront_auth::AuthResult;
use storefront_auth::revocation::{RevocationEntry, RevocationReason};
use storefront_auth::storage::RevocationStorage;
use time::OffsetDateTime;

use crate::{PgPool, StorageError, StorageResult};

type RevocationTuple = (String, String, String, OffsetDateTime, OffsetDateTime);

fn entry_from_tuple(row: RevocationTuple) -> StorageResult<RevocationEntry> {
    let (token_id, subject, reason, revoked_at, expires_at) = row;
    let reason: RevocationReason = reason
        .parse()
        .map_err(|e: String| StorageError::corrupt(format!("revocation '{token_id}': {e}")))?;
    Ok(RevocationEntry {
        token_id,
        subject,
        reason,
        revoked_at,
        expires_at,
    })
}

/// PostgreSQL [`RevocationStorage`].
#[derive(Debug, Clone)]
pub struct PostgresRevocationStorage {
    pool: Arc<PgPool>,
}

impl PostgresRevocationStorage {
    /// Create a new revocation storage.
    #[must_use]
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    async fn insert_row(&self, entry: &RevocationEntry) -> StorageResult<bool> {
        let result = query(
            r#"
            INSERT INTO auth_revocations (token_id, subject, reason, revoked_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (token_id) DO NOTHING
            "#,
        )
        .bind(&entry.token_id)
        .bind(&entry.subject)
        .bind(entry.reason.as_str())
        .bind(entry.revoked_at)
        .bind(entry.expires_at)
        .execute(self.pool.as_ref())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_row(&self, token_id: &str) -> StorageResult<Option<RevocationEntry>> {
        let row: Option<RevocationTuple> = query_as(
            r#"
            SELECT token_id, subject, reason, revoked_at, expires_at
            FROM auth_revocations
            WHERE token_id = $1
            "#,
        )
        .bind(token_id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        row.map(entry_from_tuple).transpose()
    }

    async fn delete_rows_before(&self, cutoff: OffsetDateTime) -> StorageResult<u64> {
        let result = query("DELETE FROM auth_revocations WHERE expires_at < $1")
            .bind(cutoff)
            .execute(self.pool.as_ref())
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RevocationStorage for PostgresRevocationStorage {
    async fn insert_if_absent(&self, entry: &RevocationEntry) -> AuthResult<bool> {
        Ok(self.insert_row(entry).await?)
    }

    async fn find(&self, token_id: &str) -> AuthResult<Option<RevocationEntry>> {
        Ok(self.find_row(token_id).await?)
    }

    async fn delete_expired_before(&self, cutoff: OffsetDateTime) -> AuthResult<u64> {
        Ok(self.delete_rows_before(cutoff).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_from_tuple() {
        let now = OffsetDateTime::now_utc();
        let entry = entry_from_tuple((
            "jti-1".to_string(),
            "alice".to_string(),
            "session_replaced".to_string(),
            now,
            now,
        ))
        .unwrap();
        assert_eq!(entry.reason, RevocationReason::SessionReplaced);

        let err = entry_from_tuple((
            "jti-2".to_string(),
            "alice".to_string(),
            "forgotten".to_string(),
            now,
            now,
        ))
        .unwrap_err();
        assert!(err.is_corrupt());
    }
}
