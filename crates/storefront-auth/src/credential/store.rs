//! Credential store service.
//!
//! Registration, password verification, password change, account
//! verification and closure, and signing key rotation. Password hashing runs on the blocking pool and
//! every storage call is bounded by the configured timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;

use crate::AuthResult;
use crate::clock::Clock;
use crate::config::{AuthConfig, CredentialConfig};
use crate::error::AuthError;
use crate::storage::{CredentialStorage, bounded};

use super::password::{HashedPassword, hash_password_blocking, verify_password_blocking};
use super::{Credential, KeyRing, KeyStore, KeyVersion, Role};

/// Longest accepted subject identifier (an e-mail address in practice).
pub const MAX_SUBJECT_LENGTH: usize = 254;

/// Verified against the decoy hash in place of an over-length password.
const OVERLONG_STAND_IN: &str = "over-length-password";

/// Owns credentials and the signing key ring.
pub struct CredentialStore {
    storage: Arc<dyn CredentialStorage>,
    keys: Arc<KeyStore>,
    clock: Arc<dyn Clock>,
    policy: CredentialConfig,
    storage_timeout: Duration,
    /// Hash verified against when the subject is unknown, so lookups of
    /// missing subjects cost the same as a wrong password.
    decoy: OnceCell<HashedPassword>,
}

impl CredentialStore {
    /// Creates the store.
    pub fn new(
        storage: Arc<dyn CredentialStorage>,
        keys: Arc<KeyStore>,
        clock: Arc<dyn Clock>,
        config: &AuthConfig,
    ) -> Self {
        Self {
            storage,
            keys,
            clock,
            policy: config.credentials.clone(),
            storage_timeout: config.sessions.storage_timeout,
            decoy: OnceCell::new(),
        }
    }

    /// The signing key ring.
    #[must_use]
    pub fn keys(&self) -> &Arc<KeyRing> {
        self.keys.ring()
    }

    /// The persistent key store behind [`Self::keys`].
    #[must_use]
    pub fn key_store(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    /// Whether new accounts start pending verification.
    #[must_use]
    pub fn requires_verification(&self) -> bool {
        self.policy.require_verification
    }

    /// Registers a subject with the default role.
    ///
    /// # Errors
    ///
    /// - [`AuthError::DuplicateSubject`] if the subject exists
    /// - [`AuthError::InvalidRequest`] if the subject or password is rejected
    ///   by the policy
    pub async fn register(&self, subject: &str, password: &str) -> AuthResult<Credential> {
        self.register_with_role(subject, password, Role::User).await
    }

    /// Registers a subject with an explicit role. The account starts
    /// pending when verification is required.
    #[tracing::instrument(skip_all, fields(subject = %subject))]
    pub async fn register_with_role(
        &self,
        subject: &str,
        password: &str,
        role: Role,
    ) -> AuthResult<Credential> {
        validate_subject(subject)?;
        self.validate_password(password)?;

        let hashed = hash_password_blocking(password.to_string()).await?;
        let now = self.clock.now();
        let credential = Credential {
            subject: subject.to_string(),
            password_hash: hashed.hash,
            salt: hashed.salt,
            key_version: self.keys.ring().current_version(),
            role,
            enabled: true,
            verified_at: (!self.policy.require_verification).then_some(now),
            created_at: now,
            updated_at: now,
        };

        bounded(
            self.storage_timeout,
            "credential insert",
            self.storage.insert(&credential),
        )
        .await?;
        tracing::info!(role = %role, "Subject registered");
        Ok(credential)
    }

    /// Finds a credential by subject.
    pub async fn find(&self, subject: &str) -> AuthResult<Option<Credential>> {
        bounded(
            self.storage_timeout,
            "credential lookup",
            self.storage.find(subject),
        )
        .await
    }

    /// Checks a password.
    ///
    /// Returns `Ok(false)` on a wrong password. An unknown subject still pays
    /// for a full hash verification before failing with
    /// [`AuthError::UnknownSubject`].
    pub async fn verify(&self, subject: &str, password: &str) -> AuthResult<bool> {
        if self.exceeds_max_length(password) {
            self.burn_decoy(OVERLONG_STAND_IN).await?;
            return Ok(false);
        }
        match self.find(subject).await? {
            Some(credential) => {
                verify_password_blocking(
                    password.to_string(),
                    credential.password_hash,
                    credential.salt,
                )
                .await
            }
            None => {
                self.burn_decoy(password).await?;
                Err(AuthError::unknown_subject(subject))
            }
        }
    }

    /// Verifies a login attempt and returns the credential.
    ///
    /// Unknown subject, wrong password, a password over the policy maximum
    /// and disabled account all fail with [`AuthError::InvalidCredentials`].
    /// The right password for a pending account fails with
    /// [`AuthError::AccountNotVerified`]. Storage failures propagate
    /// unchanged.
    pub async fn authenticate(&self, subject: &str, password: &str) -> AuthResult<Credential> {
        if self.exceeds_max_length(password) {
            // Never hash attacker-sized input, but take as long as a miss.
            self.burn_decoy(OVERLONG_STAND_IN).await?;
            return Err(AuthError::InvalidCredentials);
        }
        let Some(credential) = self.find(subject).await? else {
            self.burn_decoy(password).await?;
            return Err(AuthError::InvalidCredentials);
        };
        let matches = verify_password_blocking(
            password.to_string(),
            credential.password_hash.clone(),
            credential.salt.clone(),
        )
        .await?;
        if !matches || !credential.enabled {
            return Err(AuthError::InvalidCredentials);
        }
        if !credential.is_verified() {
            return Err(AuthError::AccountNotVerified);
        }
        Ok(credential)
    }

    /// Rotates the signing key and stamps the subject's credential with the
    /// new version. Tokens signed under earlier versions keep verifying
    /// until they expire.
    #[tracing::instrument(skip_all, fields(subject = %subject))]
    pub async fn rotate_key(&self, subject: &str) -> AuthResult<KeyVersion> {
        let mut credential = self
            .find(subject)
            .await?
            .ok_or_else(|| AuthError::unknown_subject(subject))?;

        let now = self.clock.now();
        let version = self.keys.rotate(now).await?;

        credential.key_version = version;
        credential.updated_at = now;
        self.update(&credential).await?;
        Ok(version)
    }

    /// Replaces the password after checking the current one.
    #[tracing::instrument(skip_all, fields(subject = %subject))]
    pub async fn change_password(
        &self,
        subject: &str,
        current: &str,
        new: &str,
    ) -> AuthResult<Credential> {
        let mut credential = self.authenticate(subject, current).await?;
        self.validate_password(new)?;

        let hashed = hash_password_blocking(new.to_string()).await?;
        credential.password_hash = hashed.hash;
        credential.salt = hashed.salt;
        credential.updated_at = self.clock.now();
        self.update(&credential).await?;
        tracing::info!("Password changed");
        Ok(credential)
    }

    /// Marks a pending account verified.
    ///
    /// # Errors
    ///
    /// - [`AuthError::UnknownSubject`] if the subject does not exist
    /// - [`AuthError::InvalidCredentials`] if the account is disabled
    /// - [`AuthError::AlreadyVerified`] if it was verified before
    #[tracing::instrument(skip_all, fields(subject = %subject))]
    pub async fn mark_verified(&self, subject: &str) -> AuthResult<Credential> {
        let mut credential = self
            .find(subject)
            .await?
            .ok_or_else(|| AuthError::unknown_subject(subject))?;
        if !credential.enabled {
            return Err(AuthError::InvalidCredentials);
        }
        if credential.is_verified() {
            return Err(AuthError::already_verified(subject));
        }
        let now = self.clock.now();
        credential.verified_at = Some(now);
        credential.updated_at = now;
        self.update(&credential).await?;
        tracing::info!("Account verified");
        Ok(credential)
    }

    /// Soft-disables an account. Disabling twice is a no-op.
    #[tracing::instrument(skip_all, fields(subject = %subject))]
    pub async fn disable(&self, subject: &str) -> AuthResult<Credential> {
        let mut credential = self
            .find(subject)
            .await?
            .ok_or_else(|| AuthError::unknown_subject(subject))?;
        if credential.enabled {
            credential.enabled = false;
            credential.updated_at = self.clock.now();
            self.update(&credential).await?;
            tracing::info!("Account disabled");
        }
        Ok(credential)
    }

    async fn update(&self, credential: &Credential) -> AuthResult<()> {
        bounded(
            self.storage_timeout,
            "credential update",
            self.storage.update(credential),
        )
        .await
    }

    async fn burn_decoy(&self, password: &str) -> AuthResult<()> {
        let decoy = self
            .decoy
            .get_or_try_init(|| hash_password_blocking("decoy-password-never-matches".to_string()))
            .await?;
        verify_password_blocking(password.to_string(), decoy.hash.clone(), decoy.salt.clone())
            .await?;
        Ok(())
    }

    fn exceeds_max_length(&self, password: &str) -> bool {
        password.chars().count() > self.policy.max_password_length
    }

    fn validate_password(&self, password: &str) -> AuthResult<()> {
        let len = password.chars().count();
        if len < self.policy.min_password_length {
            return Err(AuthError::invalid_request(format!(
                "password must be at least {} characters",
                self.policy.min_password_length
            )));
        }
        if len > self.policy.max_password_length {
            return Err(AuthError::invalid_request(format!(
                "password must be at most {} characters",
                self.policy.max_password_length
            )));
        }
        Ok(())
    }
}

fn validate_subject(subject: &str) -> AuthResult<()> {
    if subject.is_empty() {
        return Err(AuthError::invalid_request("subject cannot be empty"));
    }
    if subject.chars().count() > MAX_SUBJECT_LENGTH {
        return Err(AuthError::invalid_request(format!(
            "subject must be at most {MAX_SUBJECT_LENGTH} characters"
        )));
    }
    if subject.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(AuthError::invalid_request(
            "subject cannot contain whitespace or control characters",
        ));
    }
    Ok(())
}
