//! Account verification token storage trait.

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::AuthResult;
use crate::verification::VerificationToken;

/// Persistence for single-use account verification tokens.
#[async_trait]
pub trait VerificationStorage: Send + Sync {
    /// Stores a freshly issued token.
    async fn insert(&self, token: &VerificationToken) -> AuthResult<()>;

    /// Finds a token by its value.
    async fn find(&self, token: &str) -> AuthResult<Option<VerificationToken>>;

    /// Marks a token used at `at` if it is still unused.
    ///
    /// Returns `true` if this call consumed the token. The check and the
    /// update must be atomic: of several concurrent callers exactly one
    /// observes `true`.
    async fn mark_used(&self, token: &str, at: OffsetDateTime) -> AuthResult<bool>;

    /// Deletes tokens that expired strictly before `cutoff`, used or not.
    async fn delete_expired_before(&self, cutoff: OffsetDateTime) -> AuthResult<u64>;
}
