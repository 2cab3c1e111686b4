//! Session orchestrator.
//!
//! The entry point for register, account verification, login, refresh and
//! logout. Each session moves through two states:
//!
//! ```text
//! Anonymous --login--> Authenticated --refresh--> Authenticated
//!     ^                      |
//!     +--logout / revocation / failed verification--+
//! ```
//!
//! Writes for one subject are serialized by a per-subject async lock; other
//! subjects never contend. A credential write and the session sweep that
//! follows it happen under one hold of the lock, and login re-reads the
//! credential under the lock before opening a session, so no login that
//! checked the old password survives a password change or closure. The refresh commit runs on its own task, so a
//! caller that goes away mid-request cannot leave a rotation half-applied.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use time::{Duration, OffsetDateTime};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::AuthResult;
use crate::clock::{Clock, SystemClock, span};
use crate::config::AuthConfig;
use crate::credential::{Credential, CredentialStore, Jwks, KeyRing, KeyStore, KeyVersion};
use crate::error::AuthError;
use crate::revocation::{PurgeReport, RevocationReason, RevocationRegistry};
use crate::signer::Signer;
use crate::storage::{
    CredentialStorage, KeyStorage, MemoryCredentialStorage, MemoryKeyStorage,
    MemoryRevocationStorage, MemorySessionStorage, MemoryVerificationStorage, RevocationStorage,
    SessionRecord, SessionStorage, VerificationStorage,
};
use crate::token::{Claims, ExtraClaims, SessionContext, TokenIssuer, TokenPair, TokenVerifier};
use crate::verification::{AccountVerifier, VerificationSender, VerificationToken};

/// Session lifecycle state, used for transition logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No valid tokens.
    Anonymous,
    /// Holds a valid access/refresh pair.
    Authenticated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("anonymous"),
            Self::Authenticated => f.write_str("authenticated"),
        }
    }
}

/// The stores a deployment provides.
#[derive(Clone)]
pub struct AuthStores {
    /// Credential storage.
    pub credentials: Arc<dyn CredentialStorage>,
    /// Signing key storage.
    pub keys: Arc<dyn KeyStorage>,
    /// Revocation entry storage.
    pub revocations: Arc<dyn RevocationStorage>,
    /// Session index storage.
    pub sessions: Arc<dyn SessionStorage>,
    /// Account verification token storage.
    pub verifications: Arc<dyn VerificationStorage>,
}

impl AuthStores {
    /// `DashMap`-backed stores.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            credentials: Arc::new(MemoryCredentialStorage::new()),
            keys: Arc::new(MemoryKeyStorage::new()),
            revocations: Arc::new(MemoryRevocationStorage::new()),
            sessions: Arc::new(MemorySessionStorage::new()),
            verifications: Arc::new(MemoryVerificationStorage::new()),
        }
    }
}

/// Coordinates credentials, tokens and revocation.
pub struct SessionOrchestrator {
    credentials: Arc<CredentialStore>,
    issuer: Arc<TokenIssuer>,
    verifier: TokenVerifier,
    registry: Arc<RevocationRegistry>,
    verifications: AccountVerifier,
    clock: Arc<dyn Clock>,
    config: AuthConfig,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionOrchestrator {
    /// Validates `config`, loads the signing keys from `stores.keys` (seeding
    /// them from the configured key source on first start) and wires every
    /// component over `stores`.
    ///
    /// # Errors
    ///
    /// - [`AuthError::Configuration`] if the configuration is invalid or the
    ///   configured key material cannot be loaded
    /// - [`AuthError::Integrity`] if a stored key version cannot be decoded
    /// - [`AuthError::Transient`] if key storage is unavailable
    pub async fn new(
        stores: AuthStores,
        clock: Arc<dyn Clock>,
        config: AuthConfig,
    ) -> AuthResult<Self> {
        config.validate()?;
        let keys = KeyStore::open(Arc::clone(&stores.keys), &config, clock.now()).await?;
        Ok(Self::assemble(stores, Arc::new(keys), clock, config))
    }

    /// In-memory stores and the system clock.
    pub async fn in_memory(config: AuthConfig) -> AuthResult<Self> {
        Self::new(AuthStores::in_memory(), Arc::new(SystemClock), config).await
    }

    /// Wires the components around an existing key ring. Rotations are
    /// persisted to `stores.keys`; the versions already in `keys` are not.
    /// The configuration is assumed to be valid.
    #[must_use]
    pub fn with_keys(
        stores: AuthStores,
        keys: Arc<KeyRing>,
        clock: Arc<dyn Clock>,
        config: AuthConfig,
    ) -> Self {
        let keys = Arc::new(KeyStore::new(
            keys,
            Arc::clone(&stores.keys),
            config.sessions.storage_timeout,
        ));
        Self::assemble(stores, keys, clock, config)
    }

    /// Delivers verification tokens through `sender` instead of the log.
    #[must_use]
    pub fn with_verification_sender(mut self, sender: Arc<dyn VerificationSender>) -> Self {
        self.verifications = self.verifications.with_sender(sender);
        self
    }

    fn assemble(
        stores: AuthStores,
        keys: Arc<KeyStore>,
        clock: Arc<dyn Clock>,
        config: AuthConfig,
    ) -> Self {
        let registry = Arc::new(RevocationRegistry::new(
            stores.revocations,
            stores.sessions,
            Arc::clone(&clock),
            &config,
        ));
        let signer = Signer::new(Arc::clone(keys.ring()));
        let issuer = Arc::new(TokenIssuer::new(
            signer.clone(),
            Arc::clone(&registry),
            Arc::clone(&clock),
            &config,
        ));
        let verifier =
            TokenVerifier::new(signer, Arc::clone(&registry), Arc::clone(&clock), &config)
                .with_key_source(Arc::clone(&keys));
        let credentials = Arc::new(CredentialStore::new(
            stores.credentials,
            keys,
            Arc::clone(&clock),
            &config,
        ));
        let verifications = AccountVerifier::new(stores.verifications, Arc::clone(&clock), &config);
        Self {
            credentials,
            issuer,
            verifier,
            registry,
            verifications,
            clock,
            config,
            locks: DashMap::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// The credential store.
    #[must_use]
    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    /// The token verifier.
    #[must_use]
    pub fn verifier(&self) -> &TokenVerifier {
        &self.verifier
    }

    /// The revocation registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<RevocationRegistry> {
        &self.registry
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Current time according to the orchestrator's clock.
    #[must_use]
    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    /// Access token lifetime in whole seconds.
    #[must_use]
    pub fn access_token_lifetime(&self) -> i64 {
        self.issuer.access_ttl().whole_seconds()
    }

    /// Public keys of the signing ring.
    #[must_use]
    pub fn jwks(&self) -> Jwks {
        self.credentials.keys().jwks()
    }

    // -------------------------------------------------------------------------
    // Session operations
    // -------------------------------------------------------------------------

    /// Registers a new subject. When verification is required the account
    /// starts pending and a verification token is sent.
    ///
    /// A failed send does not fail the registration; the owner can ask for
    /// a new token with [`Self::resend_verification`].
    pub async fn register(&self, subject: &str, password: &str) -> AuthResult<Credential> {
        let credential = self
            .credentials
            .register(subject, password)
            .await
            .inspect_err(|e| log_failure("register", e))?;
        if !credential.is_verified()
            && let Err(err) = self.verifications.issue(subject).await
        {
            log_failure("issue_verification", &err);
        }
        Ok(credential)
    }

    /// Redeems a verification token and activates the account it names.
    ///
    /// # Errors
    ///
    /// - [`AuthError::InvalidVerificationToken`] if the token is unknown,
    ///   already used or expired
    /// - [`AuthError::AlreadyVerified`] if the account was verified with
    ///   another token
    /// - [`AuthError::InvalidCredentials`] if the account is gone or closed
    pub async fn verify_account(&self, token: &str) -> AuthResult<Credential> {
        let redeemed = self
            .verifications
            .consume(token)
            .await
            .inspect_err(|e| log_failure("verify_account", e))?;
        let _guard = self.subject_lock(&redeemed.subject).lock_owned().await;
        self.credentials
            .mark_verified(&redeemed.subject)
            .await
            .map_err(collapse_subject_errors)
            .inspect_err(|e| log_failure("verify_account", e))
    }

    /// Issues and sends a new verification token for a pending account.
    /// Earlier tokens stay valid until they expire.
    ///
    /// # Errors
    ///
    /// - [`AuthError::UnknownSubject`] if the subject does not exist or the
    ///   account is closed
    /// - [`AuthError::AlreadyVerified`] if the account is verified
    pub async fn resend_verification(&self, subject: &str) -> AuthResult<VerificationToken> {
        let credential = match self.credentials.find(subject).await? {
            Some(credential) if credential.enabled => credential,
            _ => return Err(AuthError::unknown_subject(subject)),
        };
        if credential.is_verified() {
            return Err(AuthError::already_verified(subject));
        }
        self.verifications
            .issue(subject)
            .await
            .inspect_err(|e| log_failure("resend_verification", e))
    }

    /// Authenticates a subject and opens a session.
    ///
    /// # Errors
    ///
    /// - [`AuthError::InvalidCredentials`] for an unknown subject, wrong
    ///   password or disabled account, or if the password was changed or
    ///   the account closed while this login was being checked
    /// - [`AuthError::AccountNotVerified`] for the right password on a
    ///   pending account
    /// - [`AuthError::Transient`] if storage is unavailable
    #[tracing::instrument(skip_all, fields(subject = %subject))]
    pub async fn login(
        &self,
        subject: &str,
        password: &str,
        device: Option<String>,
    ) -> AuthResult<TokenPair> {
        let checked = self
            .credentials
            .authenticate(subject, password)
            .await
            .map_err(collapse_subject_errors)
            .inspect_err(|e| log_failure("login", e))?;

        let _guard = self.subject_lock(subject).lock_owned().await;
        let credential = match self.credentials.find(subject).await? {
            Some(current) if current.is_active() && same_password(&current, &checked) => current,
            _ => {
                tracing::info!(subject = %subject, "Credential changed during login");
                return Err(AuthError::InvalidCredentials);
            }
        };
        if self.config.sessions.single_session {
            self.replace_sessions(subject, device.as_deref()).await?;
        }

        let session = SessionContext::new(device);
        let pair = self
            .issuer
            .issue_pair(subject, role_claims(&credential)?, &session, None)
            .await
            .inspect_err(|e| log_failure("login", e))?;
        let now = self.clock.now();
        self.registry
            .record_session(&session_record(&session, &pair, subject, now, now))
            .await?;

        transition(
            subject,
            &session.session_id,
            SessionState::Anonymous,
            SessionState::Authenticated,
            "login",
        );
        Ok(pair)
    }

    /// Exchanges a refresh token for a new pair. The presented token is
    /// revoked; of several concurrent refreshes with one token exactly one
    /// succeeds and the others fail with [`AuthError::Revoked`].
    ///
    /// The session id carries over. Refreshing requires the account to
    /// still exist and be enabled.
    pub async fn refresh(&self, refresh_token: &str) -> AuthResult<TokenPair> {
        let claims = self
            .verifier
            .verify_refresh(refresh_token)
            .await
            .inspect_err(|e| log_failure("refresh", e))?;
        let subject = claims.sub.clone();

        let credential = match self.credentials.find(&subject).await? {
            Some(credential) if credential.is_active() => credential,
            _ => {
                tracing::info!(subject = %subject, "Refresh for missing or disabled account");
                return Err(AuthError::InvalidCredentials);
            }
        };
        let extra = role_claims(&credential)?;
        let session = SessionContext::from_claims(&claims)
            .unwrap_or_else(|| SessionContext::new(claims.device.clone()));
        let created_at = self
            .registry
            .session(&session.session_id)
            .await?
            .map(|record| record.created_at);

        let guard = self.subject_lock(&subject).lock_owned().await;
        let issuer = Arc::clone(&self.issuer);
        let registry = Arc::clone(&self.registry);
        let now = self.clock.now();
        let commit = tokio::spawn(async move {
            let _guard: OwnedMutexGuard<()> = guard;
            let pair = issuer
                .issue_pair(&claims.sub, extra, &session, Some(&claims))
                .await?;
            let record = session_record(
                &session,
                &pair,
                &claims.sub,
                created_at.unwrap_or(now),
                now,
            );
            registry.record_session(&record).await?;
            Ok::<_, AuthError>((pair, session.session_id))
        });

        let (pair, sid) = commit
            .await
            .map_err(|e| AuthError::internal(format!("refresh task failed: {e}")))?
            .inspect_err(|e| log_failure("refresh", e))?;
        transition(
            &subject,
            &sid,
            SessionState::Authenticated,
            SessionState::Authenticated,
            "refresh",
        );
        Ok(pair)
    }

    /// Ends the session a refresh token belongs to.
    ///
    /// Always succeeds from the caller's point of view: an invalid token
    /// or a storage failure is logged and swallowed.
    pub async fn logout(&self, refresh_token: &str) {
        let claims = match self.verifier.verify_refresh(refresh_token).await {
            Ok(claims) => claims,
            Err(err) => {
                tracing::debug!(error = %err, "Logout with unusable refresh token");
                return;
            }
        };
        if let Err(err) = self.end_session_of(&claims).await {
            log_failure("logout", &err);
            return;
        }
        let sid = claims.sid.as_deref().unwrap_or("-");
        transition(
            &claims.sub,
            sid,
            SessionState::Authenticated,
            SessionState::Anonymous,
            "logout",
        );
    }

    /// Verifies a bearer access token for a protected route.
    pub async fn authenticate(&self, access_token: &str) -> AuthResult<Claims> {
        self.verifier
            .verify_access(access_token)
            .await
            .inspect_err(|e| log_failure("authenticate", e))
    }

    /// Ends every session of `subject`. Returns how many were ended.
    pub async fn end_all_sessions(
        &self,
        subject: &str,
        reason: RevocationReason,
    ) -> AuthResult<usize> {
        let _guard = self.subject_lock(subject).lock_owned().await;
        self.end_all_sessions_locked(subject, reason).await
    }

    /// Changes a password and ends every session of the subject.
    pub async fn change_password(
        &self,
        subject: &str,
        current: &str,
        new: &str,
    ) -> AuthResult<()> {
        let _guard = self.subject_lock(subject).lock_owned().await;
        self.credentials
            .change_password(subject, current, new)
            .await
            .map_err(collapse_subject_errors)
            .inspect_err(|e| log_failure("change_password", e))?;
        self.end_all_sessions_locked(subject, RevocationReason::CredentialChange)
            .await?;
        Ok(())
    }

    /// Disables an account and ends every session of the subject.
    pub async fn close_account(&self, subject: &str) -> AuthResult<()> {
        let _guard = self.subject_lock(subject).lock_owned().await;
        self.credentials
            .disable(subject)
            .await
            .map_err(collapse_subject_errors)
            .inspect_err(|e| log_failure("close_account", e))?;
        self.end_all_sessions_locked(subject, RevocationReason::AccountClosed)
            .await?;
        Ok(())
    }

    /// Rotates the signing key on behalf of `subject`. The new version is
    /// persisted before it signs anything.
    pub async fn rotate_key(&self, subject: &str) -> AuthResult<KeyVersion> {
        let _guard = self.subject_lock(subject).lock_owned().await;
        self.credentials
            .rotate_key(subject)
            .await
            .inspect_err(|e| log_failure("rotate_key", e))
    }

    /// Housekeeping: purges revocation entries and session records past
    /// the purge grace and expired verification tokens, picks up key
    /// versions other instances wrote, retires key versions no live token
    /// can reference and drops idle subject locks.
    pub async fn purge(&self, now: OffsetDateTime) -> AuthResult<PurgeReport> {
        let mut report = self
            .registry
            .purge_expired(now - span(self.config.revocation.purge_grace))
            .await?;
        report.verification_tokens = self.verifications.purge(now).await?;

        let keys = self.credentials.key_store();
        keys.sync().await?;
        let retention: Duration = self.issuer.refresh_ttl() + span(self.config.tokens.leeway);
        keys.retire_expired(now, retention).await?;
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Caller holds the subject lock.
    async fn end_all_sessions_locked(
        &self,
        subject: &str,
        reason: RevocationReason,
    ) -> AuthResult<usize> {
        let ended = self.registry.revoke_all_for_subject(subject, reason).await?;
        if ended > 0 {
            transition(
                subject,
                "*",
                SessionState::Authenticated,
                SessionState::Anonymous,
                reason.as_str(),
            );
        }
        Ok(ended)
    }

    fn subject_lock(&self, subject: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(subject.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Ends the subject's sessions opened from `device`. Caller holds the
    /// subject lock.
    async fn replace_sessions(&self, subject: &str, device: Option<&str>) -> AuthResult<()> {
        for record in self.registry.sessions_for(subject).await? {
            if record.same_device(device) {
                self.registry
                    .end_session(&record, RevocationReason::SessionReplaced)
                    .await?;
                transition(
                    subject,
                    &record.session_id,
                    SessionState::Authenticated,
                    SessionState::Anonymous,
                    "session_replaced",
                );
            }
        }
        Ok(())
    }

    async fn end_session_of(&self, claims: &Claims) -> AuthResult<()> {
        let _guard = self.subject_lock(&claims.sub).lock_owned().await;
        let Some(sid) = &claims.sid else {
            self.registry
                .revoke_claims(claims, RevocationReason::Logout)
                .await?;
            return Ok(());
        };
        match self.registry.session(sid).await? {
            Some(record) => {
                self.registry
                    .end_session(&record, RevocationReason::Logout)
                    .await
            }
            None => {
                self.registry
                    .revoke(sid, &claims.sub, RevocationReason::Logout, claims.expires_at())
                    .await?;
                self.registry
                    .revoke_claims(claims, RevocationReason::Logout)
                    .await
                    .map(|_| ())
            }
        }
    }
}

fn same_password(current: &Credential, checked: &Credential) -> bool {
    current.password_hash == checked.password_hash && current.salt == checked.salt
}

fn role_claims(credential: &Credential) -> AuthResult<ExtraClaims> {
    ExtraClaims::new().with("role", credential.role.as_str())
}

fn session_record(
    session: &SessionContext,
    pair: &TokenPair,
    subject: &str,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
) -> SessionRecord {
    SessionRecord {
        session_id: session.session_id.clone(),
        subject: subject.to_string(),
        device: session.device.clone(),
        refresh_token_id: pair.refresh.claims.jti.clone(),
        expires_at: pair.refresh.claims.expires_at(),
        created_at,
        updated_at,
    }
}

fn collapse_subject_errors(err: AuthError) -> AuthError {
    match err {
        AuthError::UnknownSubject { .. } => AuthError::InvalidCredentials,
        other => other,
    }
}

fn transition(subject: &str, sid: &str, from: SessionState, to: SessionState, event: &str) {
    tracing::info!(
        subject = %subject,
        sid = %sid,
        from = %from,
        to = %to,
        event,
        "Session transition"
    );
}

fn log_failure(operation: &'static str, err: &AuthError) {
    match err {
        AuthError::Integrity { .. } | AuthError::Internal { .. } => {
            tracing::error!(
                operation,
                category = %err.category(),
                error = %err,
                "Auth operation failed"
            );
        }
        AuthError::Transient { .. } => {
            tracing::warn!(operation, error = %err, "Auth operation failed transiently");
        }
        _ => {
            tracing::debug!(
                operation,
                category = %err.category(),
                error = %err,
                "Auth operation rejected"
            );
        }
    }
}
