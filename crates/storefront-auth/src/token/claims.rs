//! Token claims.
//!
//! Registered claims are typed fields; anything else lives in
//! [`ExtraClaims`], which refuses keys that would shadow a registered one.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::AuthResult;
use crate::credential::KeyVersion;
use crate::error::AuthError;

/// Claim names that cannot appear in [`ExtraClaims`].
pub const RESERVED_CLAIMS: &[&str] = &[
    "iss", "sub", "aud", "iat", "nbf", "exp", "jti", "typ", "kver", "sid", "device",
];

/// Access or refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    /// Short-lived bearer credential.
    Access,
    /// Long-lived credential exchangeable for a new pair.
    Refresh,
}

impl TokenType {
    /// Returns the type as carried in the `typ` claim.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional application claims, validated on every insert.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtraClaims(BTreeMap<String, Value>);

impl ExtraClaims {
    /// Creates an empty claim set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a claim set from a map, rejecting reserved names.
    pub fn from_map(map: BTreeMap<String, Value>) -> AuthResult<Self> {
        let claims = Self(map);
        claims.validate()?;
        Ok(claims)
    }

    /// Adds a claim.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidRequest`] if `name` is reserved or empty.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> AuthResult<()> {
        let name = name.into();
        check_name(&name)?;
        self.0.insert(name, value.into());
        Ok(())
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> AuthResult<Self> {
        self.insert(name, value)?;
        Ok(self)
    }

    /// Looks up a claim.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Iterates over all claims in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Number of claims.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no claims.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Re-checks every name. Used on claims decoded from a token.
    pub fn validate(&self) -> AuthResult<()> {
        self.0.keys().try_for_each(|name| check_name(name))
    }
}

fn check_name(name: &str) -> AuthResult<()> {
    if name.is_empty() {
        return Err(AuthError::invalid_request("claim name cannot be empty"));
    }
    if RESERVED_CLAIMS.contains(&name) {
        return Err(AuthError::invalid_request(format!(
            "claim '{name}' is reserved"
        )));
    }
    Ok(())
}

/// Claims carried by every token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Issuer.
    pub iss: String,

    /// Subject.
    pub sub: String,

    /// Issued at (Unix timestamp).
    pub iat: i64,

    /// Expiration time (Unix timestamp).
    pub exp: i64,

    /// Token id, the revocation key.
    pub jti: String,

    /// Access or refresh.
    pub typ: TokenType,

    /// Key version the token was signed with.
    pub kver: KeyVersion,

    /// Session id shared by a refresh token and its access tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,

    /// Device context the session was opened from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    /// Application claims.
    #[serde(flatten)]
    pub extra: ExtraClaims,
}

impl Claims {
    /// Issued-at as a timestamp.
    #[must_use]
    pub fn issued_at(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.iat).unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    /// Expiry as a timestamp.
    #[must_use]
    pub fn expires_at(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.exp).unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    /// The `role` application claim, if present.
    #[must_use]
    pub fn role(&self) -> Option<&str> {
        self.extra.get("role").and_then(Value::as_str)
    }

    /// Returns `true` for refresh tokens.
    #[must_use]
    pub fn is_refresh(&self) -> bool {
        self.typ == TokenType::Refresh
    }
}
