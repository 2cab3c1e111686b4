//! Session index storage trait.
//!
//! A session groups one refresh token with the access tokens derived from
//! it. The index records which refresh token is currently active for each
//! session so that logins under the single-session policy and
//! "end all sessions" can find and revoke it. Token bodies are never stored.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::AuthResult;

/// One active session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session id (`sid` claim), stable across refreshes.
    pub session_id: String,

    /// Subject the session belongs to.
    pub subject: String,

    /// Device context supplied at login, if any.
    pub device: Option<String>,

    /// `jti` of the refresh token currently valid for this session.
    pub refresh_token_id: String,

    /// Expiry of that refresh token.
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,

    /// When the session was established.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,

    /// When the session was last refreshed.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl SessionRecord {
    /// Returns `true` if the record's refresh token has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    /// Returns `true` if this session was opened from `device`.
    ///
    /// Sessions without a device context form their own group.
    #[must_use]
    pub fn same_device(&self, device: Option<&str>) -> bool {
        self.device.as_deref() == device
    }
}

/// Storage trait for the session index.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Inserts or replaces a session record.
    async fn upsert(&self, record: &SessionRecord) -> AuthResult<()>;

    /// Finds a session by id.
    async fn find(&self, session_id: &str) -> AuthResult<Option<SessionRecord>>;

    /// Lists all sessions of a subject.
    async fn list_by_subject(&self, subject: &str) -> AuthResult<Vec<SessionRecord>>;

    /// Removes a session. Returns `true` if it existed.
    async fn delete(&self, session_id: &str) -> AuthResult<bool>;

    /// Removes sessions whose refresh token expired strictly before `cutoff`.
    ///
    /// Returns the number of records deleted.
    async fn delete_expired_before(&self, cutoff: OffsetDateTime) -> AuthResult<u64>;
}
