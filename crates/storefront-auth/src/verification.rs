//! Account verification.
//!
//! A newly registered account stays pending until its owner presents the
//! single-use token delivered through a [`VerificationSender`]. Tokens
//! expire after the configured lifetime; a pending owner can ask for a new
//! one at any time.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::AuthResult;
use crate::clock::{Clock, span};
use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::storage::{VerificationStorage, bounded};

/// A single-use account verification token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationToken {
    /// Opaque token value handed to the account owner.
    pub token: String,
    /// Subject the token verifies.
    pub subject: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    /// Set once the token has been redeemed.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub used_at: Option<OffsetDateTime>,
}

impl VerificationToken {
    /// Issues a fresh token for `subject`, valid for `lifetime` from `now`.
    #[must_use]
    pub fn new(subject: &str, now: OffsetDateTime, lifetime: time::Duration) -> Self {
        Self {
            token: Uuid::new_v4().to_string(),
            subject: subject.to_string(),
            created_at: now,
            expires_at: now + lifetime,
            used_at: None,
        }
    }

    /// Whether the token has been redeemed.
    #[must_use]
    pub fn is_used(&self) -> bool {
        self.used_at.is_some()
    }

    /// Whether the token is past its expiry at `now`.
    #[must_use]
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }
}

/// Delivers verification tokens to account owners.
///
/// Implementations wrap whatever channel the deployment uses (mail relay,
/// message queue).
#[async_trait]
pub trait VerificationSender: Send + Sync {
    /// Sends `token` to the owner of `token.subject`.
    async fn send(&self, token: &VerificationToken) -> AuthResult<()>;
}

/// Writes tokens to the log. For development setups without a delivery
/// channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogVerificationSender;

#[async_trait]
impl VerificationSender for LogVerificationSender {
    async fn send(&self, token: &VerificationToken) -> AuthResult<()> {
        tracing::info!(
            subject = %token.subject,
            token = %token.token,
            expires_at = %token.expires_at,
            "Account verification token issued"
        );
        Ok(())
    }
}

/// Issues and redeems verification tokens.
pub struct AccountVerifier {
    storage: Arc<dyn VerificationStorage>,
    sender: Arc<dyn VerificationSender>,
    clock: Arc<dyn Clock>,
    lifetime: time::Duration,
    storage_timeout: std::time::Duration,
}

impl AccountVerifier {
    /// Creates a verifier that delivers through [`LogVerificationSender`].
    #[must_use]
    pub fn new(
        storage: Arc<dyn VerificationStorage>,
        clock: Arc<dyn Clock>,
        config: &AuthConfig,
    ) -> Self {
        Self {
            storage,
            sender: Arc::new(LogVerificationSender),
            clock,
            lifetime: span(config.credentials.verification_token_lifetime),
            storage_timeout: config.sessions.storage_timeout,
        }
    }

    /// Replaces the delivery channel.
    #[must_use]
    pub fn with_sender(mut self, sender: Arc<dyn VerificationSender>) -> Self {
        self.sender = sender;
        self
    }

    /// Stores a new token for `subject` and hands it to the sender.
    ///
    /// The token is stored before delivery; a failed send leaves it
    /// redeemable.
    pub async fn issue(&self, subject: &str) -> AuthResult<VerificationToken> {
        let token = VerificationToken::new(subject, self.clock.now(), self.lifetime);
        bounded(
            self.storage_timeout,
            "verification insert",
            self.storage.insert(&token),
        )
        .await?;
        self.sender.send(&token).await?;
        tracing::debug!(subject = %subject, "Verification token stored");
        Ok(token)
    }

    /// Redeems `token`. Of several concurrent redemptions exactly one
    /// succeeds.
    ///
    /// # Errors
    ///
    /// [`AuthError::InvalidVerificationToken`] if the token is unknown,
    /// already used or expired.
    pub async fn consume(&self, token: &str) -> AuthResult<VerificationToken> {
        let Some(mut found) = bounded(
            self.storage_timeout,
            "verification find",
            self.storage.find(token),
        )
        .await?
        else {
            return Err(AuthError::invalid_verification_token("unknown verification token"));
        };

        if found.is_used() {
            return Err(AuthError::invalid_verification_token(
                "verification token already used",
            ));
        }
        let now = self.clock.now();
        if found.is_expired(now) {
            return Err(AuthError::invalid_verification_token(
                "verification token expired; request a new one",
            ));
        }

        let claimed = bounded(
            self.storage_timeout,
            "verification mark used",
            self.storage.mark_used(token, now),
        )
        .await?;
        if !claimed {
            return Err(AuthError::invalid_verification_token(
                "verification token already used",
            ));
        }
        found.used_at = Some(now);
        Ok(found)
    }

    /// Deletes tokens that expired before `cutoff`.
    pub async fn purge(&self, cutoff: OffsetDateTime) -> AuthResult<u64> {
        bounded(
            self.storage_timeout,
            "verification purge",
            self.storage.delete_expired_before(cutoff),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryVerificationStorage;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Outbox(Mutex<Vec<VerificationToken>>);

    #[async_trait]
    impl VerificationSender for Outbox {
        async fn send(&self, token: &VerificationToken) -> AuthResult<()> {
            self.0.lock().push(token.clone());
            Ok(())
        }
    }

    struct Unreachable;

    #[async_trait]
    impl VerificationSender for Unreachable {
        async fn send(&self, _token: &VerificationToken) -> AuthResult<()> {
            Err(AuthError::transient("mail relay unreachable"))
        }
    }

    fn verifier(clock: &ManualClock) -> (AccountVerifier, Arc<MemoryVerificationStorage>) {
        let storage = Arc::new(MemoryVerificationStorage::new());
        let verifier = AccountVerifier::new(
            Arc::clone(&storage) as Arc<dyn VerificationStorage>,
            Arc::new(clock.clone()),
            &AuthConfig::default(),
        );
        (verifier, storage)
    }

    #[tokio::test]
    async fn test_issue_stores_and_sends() {
        let clock = ManualClock::starting_now();
        let outbox = Arc::new(Outbox::default());
        let (verifier, storage) = verifier(&clock);
        let verifier = verifier.with_sender(Arc::clone(&outbox) as Arc<dyn VerificationSender>);

        let token = verifier.issue("alice").await.unwrap();
        assert_eq!(token.expires_at - token.created_at, time::Duration::minutes(15));
        assert_eq!(outbox.0.lock().as_slice(), &[token.clone()]);
        assert_eq!(storage.find(&token.token).await.unwrap(), Some(token));
    }

    #[tokio::test]
    async fn test_token_redeems_once() {
        let clock = ManualClock::starting_now();
        let (verifier, _) = verifier(&clock);
        let token = verifier.issue("alice").await.unwrap();

        let redeemed = verifier.consume(&token.token).await.unwrap();
        assert_eq!(redeemed.subject, "alice");
        assert!(redeemed.is_used());

        let err = verifier.consume(&token.token).await.unwrap_err();
        assert!(err.to_string().contains("already used"));
    }

    #[tokio::test]
    async fn test_expired_and_unknown_tokens_are_rejected() {
        let clock = ManualClock::starting_now();
        let (verifier, _) = verifier(&clock);
        let token = verifier.issue("alice").await.unwrap();

        clock.advance(time::Duration::minutes(15));
        let err = verifier.consume(&token.token).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidVerificationToken { .. }));
        assert!(err.to_string().contains("expired"));

        let err = verifier.consume("no-such-token").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidVerificationToken { .. }));
    }

    #[tokio::test]
    async fn test_failed_send_keeps_token() {
        let clock = ManualClock::starting_now();
        let (verifier, storage) = verifier(&clock);
        let verifier = verifier.with_sender(Arc::new(Unreachable));

        assert!(verifier.issue("alice").await.unwrap_err().is_retryable());
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn test_purge_drops_expired_tokens() {
        let clock = ManualClock::starting_now();
        let (verifier, storage) = verifier(&clock);
        verifier.issue("alice").await.unwrap();

        assert_eq!(verifier.purge(clock.now()).await.unwrap(), 0);
        clock.advance(time::Duration::hours(1));
        assert_eq!(verifier.purge(clock.now()).await.unwrap(), 1);
        assert_eq!(storage.len(), 0);
    }
}
