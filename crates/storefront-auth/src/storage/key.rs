//! Signing key storage trait.
//!
//! Every key version the ring has ever issued is written here before it is
//! used to sign, so a restarted process (or another instance on the same
//! backend) can keep verifying tokens until they expire.

use std::fmt;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::AuthResult;
use crate::credential::{KeyVersion, SigningAlgorithm};

/// One persisted key version.
#[derive(Clone, PartialEq, Eq)]
pub struct StoredKey {
    /// Version number, unique per backend.
    pub version: KeyVersion,
    /// Algorithm bound to this version.
    pub algorithm: SigningAlgorithm,
    /// Raw HMAC secret, or the PKCS#8 DER private key for RSA and EC.
    pub secret: Vec<u8>,
    /// When the version was generated.
    pub created_at: OffsetDateTime,
    /// When a newer version replaced it. `None` for the current version.
    pub superseded_at: Option<OffsetDateTime>,
}

impl fmt::Debug for StoredKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredKey")
            .field("version", &self.version)
            .field("algorithm", &self.algorithm)
            .field("secret", &"<redacted>")
            .field("created_at", &self.created_at)
            .field("superseded_at", &self.superseded_at)
            .finish()
    }
}

/// Persistence for signing key versions.
#[async_trait]
pub trait KeyStorage: Send + Sync {
    /// Stores `key` unless its version is already taken.
    ///
    /// Returns `true` if this call created the version. Two instances
    /// rotating at once race on the version number; exactly one wins.
    async fn insert_if_absent(&self, key: &StoredKey) -> AuthResult<bool>;

    /// All stored versions, oldest first.
    async fn list(&self) -> AuthResult<Vec<StoredKey>>;

    /// Records that `version` was superseded at `at`. Keeps an earlier
    /// timestamp if one is already set.
    async fn mark_superseded(&self, version: KeyVersion, at: OffsetDateTime) -> AuthResult<()>;

    /// Deletes a retired version. Returns `true` if it existed.
    async fn delete(&self, version: KeyVersion) -> AuthResult<bool>;
}
