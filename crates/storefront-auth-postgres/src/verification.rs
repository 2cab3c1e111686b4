//! Account verification token storage for PostgreSQL.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use storefront_auth::AuthResult;
use storefront_auth::storage::VerificationStorage;
use storefront_auth::verification::VerificationToken;
use time::OffsetDateTime;

use crate::{PgPool, StorageResult};

type TokenTuple = (
    String,
    String,
    OffsetDateTime,
    OffsetDateTime,
    Option<OffsetDateTime>,
);

fn token_from_tuple(row: TokenTuple) -> VerificationToken {
    let (token, subject, created_at, expires_at, used_at) = row;
    VerificationToken {
        token,
        subject,
        created_at,
        expires_at,
        used_at,
    }
}

/// PostgreSQL [`VerificationStorage`].
#[derive(Debug, Clone)]
pub struct PostgresVerificationStorage {
    pool: Arc<PgPool>,
}

impl PostgresVerificationStorage {
    /// Create a new verification token storage.
    #[must_use]
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    async fn insert_row(&self, token: &VerificationToken) -> StorageResult<()> {
        query(
            r#"
            INSERT INTO auth_verification_tokens
                (token, subject, created_at, expires_at, used_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&token.token)
        .bind(&token.subject)
        .bind(token.created_at)
        .bind(token.expires_at)
        .bind(token.used_at)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn find_row(&self, token: &str) -> StorageResult<Option<VerificationToken>> {
        let row: Option<TokenTuple> = query_as(
            r#"
            SELECT token, subject, created_at, expires_at, used_at
            FROM auth_verification_tokens
            WHERE token = $1
            "#,
        )
        .bind(token)
        .fetch_optional(self.pool.as_ref())
        .await?;
        Ok(row.map(token_from_tuple))
    }

    /// Conditional update: only the caller that flips `used_at` from NULL
    /// sees a row affected.
    async fn mark_used_row(&self, token: &str, at: OffsetDateTime) -> StorageResult<bool> {
        let result = query(
            r#"
            UPDATE auth_verification_tokens
            SET used_at = $2
            WHERE token = $1 AND used_at IS NULL
            "#,
        )
        .bind(token)
        .bind(at)
        .execute(self.pool.as_ref())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_rows_before(&self, cutoff: OffsetDateTime) -> StorageResult<u64> {
        let result = query("DELETE FROM auth_verification_tokens WHERE expires_at < $1")
            .bind(cutoff)
            .execute(self.pool.as_ref())
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl VerificationStorage for PostgresVerificationStorage {
    async fn insert(&self, token: &VerificationToken) -> AuthResult<()> {
        Ok(self.insert_row(token).await?)
    }

    async fn find(&self, token: &str) -> AuthResult<Option<VerificationToken>> {
        Ok(self.find_row(token).await?)
    }

    async fn mark_used(&self, token: &str, at: OffsetDateTime) -> AuthResult<bool> {
        Ok(self.mark_used_row(token, at).await?)
    }

    async fn delete_expired_before(&self, cutoff: OffsetDateTime) -> AuthResult<u64> {
        Ok(self.delete_rows_before(cutoff).await?)
    }
}
