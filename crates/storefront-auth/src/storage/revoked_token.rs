//! Revoked token storage trait.
//!
//! Revocation entries record the token identifier (`jti`) together with the
//! token's own expiry. Tokens are validated by signature, so only the fact of
//! revocation needs to be stored, and only until the token would have
//! expired anyway.

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::AuthResult;
use crate::revocation::RevocationEntry;

/// Storage trait for revocation entries.
#[async_trait]
pub trait RevocationStorage: Send + Sync {
    /// Stores `entry` unless an entry for the same token id exists.
    ///
    /// Returns `true` if this call created the entry. The existence check and
    /// the insert must be atomic: of several concurrent callers for one token
    /// id, exactly one observes `true`.
    async fn insert_if_absent(&self, entry: &RevocationEntry) -> AuthResult<bool>;

    /// Finds the entry for a token id.
    async fn find(&self, token_id: &str) -> AuthResult<Option<RevocationEntry>>;

    /// Deletes entries whose token expired strictly before `cutoff`.
    ///
    /// Returns the number of records deleted.
    async fn delete_expired_before(&self, cutoff: OffsetDateTime) -> AuthResult<u64>;
}
