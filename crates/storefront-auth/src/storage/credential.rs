//! Credential storage trait.

use async_trait::async_trait;

use crate::AuthResult;
use crate::credential::Credential;

/// Persistence for [`Credential`] records, keyed by subject.
#[async_trait]
pub trait CredentialStorage: Send + Sync {
    /// Inserts a new credential.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::DuplicateSubject`](crate::AuthError::DuplicateSubject)
    /// if the subject already exists. The check and the insert must be a
    /// single atomic step.
    async fn insert(&self, credential: &Credential) -> AuthResult<()>;

    /// Finds a credential by subject.
    async fn find(&self, subject: &str) -> AuthResult<Option<Credential>>;

    /// Replaces an existing credential.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::UnknownSubject`](crate::AuthError::UnknownSubject)
    /// if no credential exists for the subject.
    async fn update(&self, credential: &Credential) -> AuthResult<()>;
}
