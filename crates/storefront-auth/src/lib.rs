//! # storefront-auth
//!
//! Credential, token and session core for the storefront backend.
//!
//! This crate provides:
//! - Argon2id password storage with a per-subject salt
//! - Versioned signing keys (HS256, RS256, RS384, ES384), persisted per
//!   version, with rotation
//! - Account verification with single-use, expiring tokens
//! - Access and refresh token issuance and verification
//! - A revocation registry with a session index
//! - The session orchestrator behind register, login, refresh and logout
//! - Axum handlers for the HTTP surface
//!
//! ## Modules
//!
//! - [`config`] - Token lifetimes, key source and session policy
//! - [`credential`] - Credential store, key ring and key store
//! - [`signer`] - Signing and verification with a specific key version
//! - [`token`] - Claims, wire codec, issuer and verifier
//! - [`revocation`] - Revoked token ids and the session index
//! - [`session`] - The [`SessionOrchestrator`]
//! - [`storage`] - Storage traits and in-memory implementations
//! - [`verification`] - Verification tokens and their delivery
//! - [`http`] - Axum router and handlers

pub mod clock;
pub mod config;
pub mod credential;
pub mod error;
pub mod http;
pub mod revocation;
pub mod session;
pub mod signer;
pub mod storage;
pub mod token;
pub mod verification;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AuthConfig, ConfigError};
pub use credential::{
    Credential, CredentialStore, KeyRing, KeyStore, KeyVersion, Role, SigningAlgorithm,
};
pub use error::{AuthError, ErrorCategory};
pub use http::{AuthState, BearerAuth, TokenResponse, router};
pub use revocation::{PurgeReport, RevocationEntry, RevocationReason, RevocationRegistry};
pub use session::{AuthStores, SessionOrchestrator, SessionState};
pub use signer::Signer;
pub use storage::{
    CredentialStorage, KeyStorage, RevocationStorage, SessionRecord, SessionStorage, StoredKey,
    VerificationStorage,
};
pub use token::{
    Claims, ExtraClaims, SessionContext, Token, TokenIssuer, TokenPair, TokenType, TokenVerifier,
};
pub use verification::{
    AccountVerifier, LogVerificationSender, VerificationSender, VerificationToken,
};

/// Type alias for authentication results.
pub type AuthResult<T> = Result<T, AuthError>;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::AuthResult;
    pub use crate::config::AuthConfig;
    pub use crate::error::AuthError;
    pub use crate::revocation::RevocationReason;
    pub use crate::session::{AuthStores, SessionOrchestrator};
    pub use crate::token::{Claims, TokenPair, TokenType};
}
