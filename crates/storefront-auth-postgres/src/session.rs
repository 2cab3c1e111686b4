//! Session index storage for PostgreSQL.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use storefront_auth::AuthResult;
use storefront_auth::storage::{SessionRecord, SessionStorage};
use time::OffsetDateTime;

use crate::{PgPool, StorageResult};

type SessionTuple = (
    String,
    String,
    Option<String>,
    String,
    OffsetDateTime,
    OffsetDateTime,
    OffsetDateTime,
);

fn record_from_tuple(row: SessionTuple) -> SessionRecord {
    let (session_id, subject, device, refresh_token_id, expires_at, created_at, updated_at) = row;
    SessionRecord {
        session_id,
        subject,
        device,
        refresh_token_id,
        expires_at,
        created_at,
        updated_at,
    }
}

const SELECT_COLUMNS: &str =
    "SELECT session_id, subject, device, refresh_token_id, expires_at, created_at, updated_at FROM auth_sessions";

/// PostgreSQL [`SessionStorage`].
#[derive(Debug, Clone)]
pub struct PostgresSessionStorage {
    pool: Arc<PgPool>,
}

impl PostgresSessionStorage {
    /// Create a new session storage.
    #[must_use]
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    async fn upsert_row(&self, record: &SessionRecord) -> StorageResult<()> {
        query(
            r#"
            INSERT INTO auth_sessions
                (session_id, subject, device, refresh_token_id, expires_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (session_id) DO UPDATE SET
                refresh_token_id = EXCLUDED.refresh_token_id,
                expires_at = EXCLUDED.expires_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.session_id)
        .bind(&record.subject)
        .bind(&record.device)
        .bind(&record.refresh_token_id)
        .bind(record.expires_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn find_row(&self, session_id: &str) -> StorageResult<Option<SessionRecord>> {
        let sql = format!("{SELECT_COLUMNS} WHERE session_id = $1");
        let row: Option<SessionTuple> = query_as(&sql)
            .bind(session_id)
            .fetch_optional(self.pool.as_ref())
            .await?;
        Ok(row.map(record_from_tuple))
    }

    async fn list_rows(&self, subject: &str) -> StorageResult<Vec<SessionRecord>> {
        let sql = format!("{SELECT_COLUMNS} WHERE subject = $1 ORDER BY created_at");
        let rows: Vec<SessionTuple> = query_as(&sql)
            .bind(subject)
            .fetch_all(self.pool.as_ref())
            .await?;
        Ok(rows.into_iter().map(record_from_tuple).collect())
    }

    async fn delete_row(&self, session_id: &str) -> StorageResult<bool> {
        let result = query("DELETE FROM auth_sessions WHERE session_id = $1")
            .bind(session_id)
            .execute(self.pool.as_ref())
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_rows_before(&self, cutoff: OffsetDateTime) -> StorageResult<u64> {
        let result = query("DELETE FROM auth_sessions WHERE expires_at < $1")
            .bind(cutoff)
            .execute(self.pool.as_ref())
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SessionStorage for PostgresSessionStorage {
    async fn upsert(&self, record: &SessionRecord) -> AuthResult<()> {
        Ok(self.upsert_row(record).await?)
    }

    async fn find(&self, session_id: &str) -> AuthResult<Option<SessionRecord>> {
        Ok(self.find_row(session_id).await?)
    }

    async fn list_by_subject(&self, subject: &str) -> AuthResult<Vec<SessionRecord>> {
        Ok(self.list_rows(subject).await?)
    }

    async fn delete(&self, session_id: &str) -> AuthResult<bool> {
        Ok(self.delete_row(session_id).await?)
    }

    async fn delete_expired_before(&self, cutoff: OffsetDateTime) -> AuthResult<u64> {
        Ok(self.delete_rows_before(cutoff).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_from_tuple() {
        let now = OffsetDateTime::now_utc();
        let record = record_from_tuple((
            "sid".to_string(),
            "alice".to_string(),
            None,
            "jti".to_string(),
            now,
            now,
            now,
        ));
        assert!(record.same_device(None));
        assert!(record.is_expired(now));
    }
}
