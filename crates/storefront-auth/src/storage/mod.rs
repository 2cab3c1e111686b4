//! Storage traits for credential, signing key, revocation, session and
//! verification token data.
//!
//! All traits are object safe and shared as `Arc<dyn ...>`. Every call is a
//! potential suspension point; the services bound each one with the
//! configured storage timeout.
//!
//! # Implementations
//!
//! - [`memory`] - `DashMap`-backed stores for tests and single-node setups
//! - `storefront-auth-postgres` - PostgreSQL storage backend

use std::future::Future;
use std::time::Duration;

use crate::AuthResult;
use crate::error::AuthError;

pub mod credential;
pub mod key;
pub mod memory;
pub mod revoked_token;
pub mod session;
pub mod verification;

pub use credential::CredentialStorage;
pub use key::{KeyStorage, StoredKey};
pub use memory::{
    MemoryCredentialStorage, MemoryKeyStorage, MemoryRevocationStorage, MemorySessionStorage,
    MemoryVerificationStorage,
};
pub use revoked_token::RevocationStorage;
pub use session::{SessionRecord, SessionStorage};
pub use verification::VerificationStorage;

/// Runs a storage call under `limit`. An elapsed timeout becomes
/// [`AuthError::Transient`] so callers can tell it apart from a definitive
/// rejection.
pub(crate) async fn bounded<T, F>(limit: Duration, operation: &'static str, call: F) -> AuthResult<T>
where
    F: Future<Output = AuthResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                operation,
                timeout_ms = limit.as_millis() as u64,
                "Storage call timed out"
            );
            Err(AuthError::transient(format!(
                "{operation} timed out after {limit:?}"
            )))
        }
    }
}
