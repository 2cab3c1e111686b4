//! Revocation registry.
//!
//! Tracks tokens that were invalidated before their natural expiry, plus the
//! session index used to find a subject's active refresh tokens.
//!
//! Two identifiers can be revoked:
//!
//! - a token id (`jti`), which kills exactly one token
//! - a session id (`sid`), which kills the refresh token of that session and
//!   every access token derived from it
//!
//! Entries are kept until the referenced token could no longer pass
//! verification (expiry plus leeway) and are purged after that.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::AuthResult;
use crate::clock::{Clock, span};
use crate::config::AuthConfig;
use crate::storage::{RevocationStorage, SessionRecord, SessionStorage, bounded};
use crate::token::Claims;

// =============================================================================
// Types
// =============================================================================

/// Why a token was revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    /// The holder logged out.
    Logout,
    /// A refresh token was exchanged for a new pair.
    Rotated,
    /// Revoked by an operator or API call.
    Explicit,
    /// Replaced by a newer login under the single-session policy.
    SessionReplaced,
    /// The subject's password changed.
    CredentialChange,
    /// The account was closed.
    AccountClosed,
}

impl RevocationReason {
    /// Returns the reason as stored.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Logout => "logout",
            Self::Rotated => "rotated",
            Self::Explicit => "explicit",
            Self::SessionReplaced => "session_replaced",
            Self::CredentialChange => "credential_change",
            Self::AccountClosed => "account_closed",
        }
    }
}

impl fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RevocationReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "logout" => Ok(Self::Logout),
            "rotated" => Ok(Self::Rotated),
            "explicit" => Ok(Self::Explicit),
            "session_replaced" => Ok(Self::SessionReplaced),
            "credential_change" => Ok(Self::CredentialChange),
            "account_closed" => Ok(Self::AccountClosed),
            other => Err(format!("unknown revocation reason '{other}'")),
        }
    }
}

/// A revoked token or session id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationEntry {
    /// The revoked `jti` or `sid`.
    pub token_id: String,

    /// Subject the token was issued to.
    pub subject: String,

    /// Why it was revoked.
    pub reason: RevocationReason,

    /// When it was revoked.
    #[serde(with = "time::serde::rfc3339")]
    pub revoked_at: OffsetDateTime,

    /// When the referenced token expires naturally.
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

/// Counts returned by [`RevocationRegistry::purge_expired`] and the
/// orchestrator's housekeeping pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Revocation entries removed.
    pub revocations: u64,
    /// Session records removed.
    pub sessions: u64,
    /// Expired verification tokens removed.
    pub verification_tokens: u64,
}

// =============================================================================
// Registry
// =============================================================================

/// Shared registry of revoked tokens and active sessions.
pub struct RevocationRegistry {
    revocations: Arc<dyn RevocationStorage>,
    sessions: Arc<dyn SessionStorage>,
    clock: Arc<dyn Clock>,
    leeway: Duration,
    storage_timeout: StdDuration,
}

impl RevocationRegistry {
    /// Creates a registry over the given stores.
    pub fn new(
        revocations: Arc<dyn RevocationStorage>,
        sessions: Arc<dyn SessionStorage>,
        clock: Arc<dyn Clock>,
        config: &AuthConfig,
    ) -> Self {
        Self {
            revocations,
            sessions,
            clock,
            leeway: span(config.tokens.leeway),
            storage_timeout: config.sessions.storage_timeout,
        }
    }

    /// Revokes a token id. Revoking an already revoked id is a no-op.
    pub async fn revoke(
        &self,
        token_id: &str,
        subject: &str,
        reason: RevocationReason,
        expires_at: OffsetDateTime,
    ) -> AuthResult<()> {
        self.revoke_if_active(token_id, subject, reason, expires_at)
            .await
            .map(|_| ())
    }

    /// Revokes a token id and reports whether this call did it.
    ///
    /// This is the serialization point for refresh rotation: of several
    /// concurrent callers for the same id exactly one gets `true`.
    pub async fn revoke_if_active(
        &self,
        token_id: &str,
        subject: &str,
        reason: RevocationReason,
        expires_at: OffsetDateTime,
    ) -> AuthResult<bool> {
        let entry = RevocationEntry {
            token_id: token_id.to_string(),
            subject: subject.to_string(),
            reason,
            revoked_at: self.clock.now(),
            expires_at,
        };
        let inserted = bounded(
            self.storage_timeout,
            "revocation insert",
            self.revocations.insert_if_absent(&entry),
        )
        .await?;
        if inserted {
            tracing::debug!(jti = %token_id, subject = %subject, reason = %reason, "Token revoked");
        }
        Ok(inserted)
    }

    /// Revokes the token described by `claims`.
    pub async fn revoke_claims(
        &self,
        claims: &Claims,
        reason: RevocationReason,
    ) -> AuthResult<bool> {
        self.revoke_if_active(&claims.jti, &claims.sub, reason, claims.expires_at())
            .await
    }

    /// Returns `true` if the id has been revoked.
    pub async fn is_revoked(&self, token_id: &str) -> AuthResult<bool> {
        Ok(self.entry(token_id).await?.is_some())
    }

    /// Returns the revocation entry for an id, if any.
    pub async fn entry(&self, token_id: &str) -> AuthResult<Option<RevocationEntry>> {
        bounded(
            self.storage_timeout,
            "revocation lookup",
            self.revocations.find(token_id),
        )
        .await
    }

    /// Removes entries and session records whose token expired before
    /// `before`.
    ///
    /// The cutoff is clamped to `now - leeway`, so an entry is never removed
    /// while its token could still pass the verifier's expiry check.
    pub async fn purge_expired(&self, before: OffsetDateTime) -> AuthResult<PurgeReport> {
        let cutoff = before.min(self.clock.now() - self.leeway);
        let revocations = bounded(
            self.storage_timeout,
            "revocation purge",
            self.revocations.delete_expired_before(cutoff),
        )
        .await?;
        let sessions = bounded(
            self.storage_timeout,
            "session purge",
            self.sessions.delete_expired_before(cutoff),
        )
        .await?;
        let report = PurgeReport {
            revocations,
            sessions,
            ..PurgeReport::default()
        };
        if report != PurgeReport::default() {
            tracing::info!(
                revocations = report.revocations,
                sessions = report.sessions,
                cutoff = %cutoff,
                "Purged expired revocation state"
            );
        }
        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Session index
    // -------------------------------------------------------------------------

    /// Records or updates the active refresh token of a session.
    pub async fn record_session(&self, record: &SessionRecord) -> AuthResult<()> {
        bounded(
            self.storage_timeout,
            "session upsert",
            self.sessions.upsert(record),
        )
        .await
    }

    /// Looks up a session.
    pub async fn session(&self, session_id: &str) -> AuthResult<Option<SessionRecord>> {
        bounded(
            self.storage_timeout,
            "session lookup",
            self.sessions.find(session_id),
        )
        .await
    }

    /// Lists the subject's sessions that have not yet expired.
    pub async fn sessions_for(&self, subject: &str) -> AuthResult<Vec<SessionRecord>> {
        let now = self.clock.now();
        let records = bounded(
            self.storage_timeout,
            "session list",
            self.sessions.list_by_subject(subject),
        )
        .await?;
        Ok(records.into_iter().filter(|r| !r.is_expired(now)).collect())
    }

    /// Ends a session: revokes its id and current refresh token, then drops
    /// the index record. Access tokens carrying the session id stop
    /// verifying immediately.
    pub async fn end_session(
        &self,
        record: &SessionRecord,
        reason: RevocationReason,
    ) -> AuthResult<()> {
        // Session ids must outlive every token that carries them.
        let expires_at = record.expires_at;
        self.revoke(&record.session_id, &record.subject, reason, expires_at)
            .await?;
        self.revoke(&record.refresh_token_id, &record.subject, reason, expires_at)
            .await?;
        bounded(
            self.storage_timeout,
            "session delete",
            self.sessions.delete(&record.session_id),
        )
        .await?;
        tracing::debug!(
            sid = %record.session_id,
            subject = %record.subject,
            reason = %reason,
            "Session ended"
        );
        Ok(())
    }

    /// Ends every session of a subject. Returns how many were ended.
    pub async fn revoke_all_for_subject(
        &self,
        subject: &str,
        reason: RevocationReason,
    ) -> AuthResult<usize> {
        let records = self.sessions_for(subject).await?;
        for record in &records {
            self.end_session(record, reason).await?;
        }
        if !records.is_empty() {
            tracing::info!(
                subject = %subject,
                count = records.len(),
                reason = %reason,
                "Ended all sessions"
            );
        }
        Ok(records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::{MemoryRevocationStorage, MemorySessionStorage};

    fn registry(clock: &ManualClock) -> RevocationRegistry {
        RevocationRegistry::new(
            Arc::new(MemoryRevocationStorage::new()),
            Arc::new(MemorySessionStorage::new()),
            Arc::new(clock.clone()),
            &AuthConfig::default(),
        )
    }

    fn session(clock: &ManualClock, sid: &str, jti: &str) -> SessionRecord {
        let now = clock.now();
        SessionRecord {
            session_id: sid.to_string(),
            subject: "alice".to_string(),
            device: None,
            refresh_token_id: jti.to_string(),
            expires_at: now + Duration::days(7),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent() {
        let clock = ManualClock::starting_now();
        let registry = registry(&clock);
        let exp = clock.now() + Duration::minutes(15);

        registry
            .revoke("jti-1", "alice", RevocationReason::Logout, exp)
            .await
            .unwrap();
        let first = registry.entry("jti-1").await.unwrap().unwrap();

        clock.advance(Duration::seconds(5));
        registry
            .revoke("jti-1", "alice", RevocationReason::Explicit, exp)
            .await
            .unwrap();
        let second = registry.entry("jti-1").await.unwrap().unwrap();

        assert_eq!(first, second);
        assert!(registry.is_revoked("jti-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_revoke_if_active_reports_winner() {
        let clock = ManualClock::starting_now();
        let registry = registry(&clock);
        let exp = clock.now() + Duration::days(1);

        assert!(
            registry
                .revoke_if_active("r-1", "alice", RevocationReason::Rotated, exp)
                .await
                .unwrap()
        );
        assert!(
            !registry
                .revoke_if_active("r-1", "alice", RevocationReason::Rotated, exp)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_revoked() {
        let clock = ManualClock::starting_now();
        assert!(!registry(&clock).is_revoked("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_never_removes_live_entries() {
        let clock = ManualClock::starting_now();
        let registry = registry(&clock);
        let exp = clock.now() + Duration::minutes(15);
        registry
            .revoke("jti-1", "alice", RevocationReason::Logout, exp)
            .await
            .unwrap();

        // A cutoff far in the future is clamped to now - leeway.
        let report = registry
            .purge_expired(clock.now() + Duration::days(30))
            .await
            .unwrap();
        assert_eq!(report.revocations, 0);
        assert!(registry.is_revoked("jti-1").await.unwrap());

        // Expired, but still inside the leeway window.
        clock.advance(Duration::minutes(15) + Duration::seconds(10));
        registry.purge_expired(clock.now()).await.unwrap();
        assert!(registry.is_revoked("jti-1").await.unwrap());

        // Past expiry plus leeway.
        clock.advance(Duration::minutes(1));
        let report = registry.purge_expired(clock.now()).await.unwrap();
        assert_eq!(report.revocations, 1);
        assert!(!registry.is_revoked("jti-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_end_session_revokes_sid_and_refresh() {
        let clock = ManualClock::starting_now();
        let registry = registry(&clock);
        let record = session(&clock, "sid-1", "r-1");
        registry.record_session(&record).await.unwrap();

        registry
            .end_session(&record, RevocationReason::Logout)
            .await
            .unwrap();

        assert!(registry.is_revoked("sid-1").await.unwrap());
        assert!(registry.is_revoked("r-1").await.unwrap());
        assert!(registry.session("sid-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_revoke_all_for_subject() {
        let clock = ManualClock::starting_now();
        let registry = registry(&clock);
        registry
            .record_session(&session(&clock, "sid-1", "r-1"))
            .await
            .unwrap();
        registry
            .record_session(&session(&clock, "sid-2", "r-2"))
            .await
            .unwrap();

        let ended = registry
            .revoke_all_for_subject("alice", RevocationReason::CredentialChange)
            .await
            .unwrap();
        assert_eq!(ended, 2);
        assert!(registry.sessions_for("alice").await.unwrap().is_empty());
        assert!(registry.is_revoked("r-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_sessions_are_hidden() {
        let clock = ManualClock::starting_now();
        let registry = registry(&clock);
        registry
            .record_session(&session(&clock, "sid-1", "r-1"))
            .await
            .unwrap();
        clock.advance(Duration::days(8));
        assert!(registry.sessions_for("alice").await.unwrap().is_empty());
    }

    #[test]
    fn test_reason_names() {
        for reason in [
            RevocationReason::Logout,
            RevocationReason::Rotated,
            RevocationReason::Explicit,
            RevocationReason::SessionReplaced,
            RevocationReason::CredentialChange,
            RevocationReason::AccountClosed,
        ] {
            assert_eq!(reason.as_str().parse::<RevocationReason>().unwrap(), reason);
        }
    }
}
