//! Credential store.
//!
//! Owns password material for every subject and the versioned signing keys.
//!
//! - [`password`] - Argon2id hashing
//! - [`keys`] - Versioned key material and the key ring
//! - [`key_store`] - Loads and persists the key ring
//! - [`store`] - The [`CredentialStore`] service

pub mod key_store;
pub mod keys;
pub mod password;
pub mod store;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub use key_store::KeyStore;
pub use keys::{Jwk, Jwks, KeyError, KeyMaterial, KeyRing, KeyVersion, SigningAlgorithm};
pub use store::CredentialStore;

/// Authorization role attached to a subject.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Regular shopper.
    #[default]
    User,
    /// Store administrator.
    Admin,
}

impl Role {
    /// Returns the role name as stored and carried in tokens.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "admin" => Ok(Self::Admin),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// Stored credential for one subject.
///
/// Never physically deleted; account closure clears `enabled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Unique subject identifier (the login name).
    pub subject: String,

    /// PHC-formatted Argon2id hash.
    #[serde(skip_serializing)]
    pub password_hash: String,

    /// Salt the hash was computed with.
    #[serde(skip_serializing)]
    pub salt: String,

    /// Signing key version current when the credential was last rotated.
    pub key_version: KeyVersion,

    /// Role carried into issued tokens.
    pub role: Role,

    /// Disabled accounts cannot log in or refresh.
    pub enabled: bool,

    /// When the account was verified. Unverified accounts cannot log in.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub verified_at: Option<OffsetDateTime>,

    /// When the credential was registered.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,

    /// When the credential was last modified.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Credential {
    /// Returns `true` once the account has been verified.
    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.verified_at.is_some()
    }

    /// Returns `true` if the subject may authenticate.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.enabled && self.is_verified()
    }
}
