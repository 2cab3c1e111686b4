//! Authentication error types.
//!
//! Every failure the credential, token and session layers can produce is a
//! variant of [`AuthError`]. Variants are split into definitive rejections,
//! which callers must not retry, and [`AuthError::Transient`], which they may.

use std::fmt;

/// Errors that can occur during credential, token and session operations.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Wrong password, unknown subject or disabled account.
    ///
    /// These are deliberately collapsed into one variant so callers cannot
    /// enumerate registered subjects.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// The subject is not registered. Only surfaced by the credential store;
    /// the session layer converts it into [`AuthError::InvalidCredentials`].
    #[error("Unknown subject: {subject}")]
    UnknownSubject {
        /// The subject that was looked up.
        subject: String,
    },

    /// Correct password, but the account has not been verified yet.
    #[error("Account not verified")]
    AccountNotVerified,

    /// The verification token is unknown, already used or expired.
    #[error("Invalid verification token: {message}")]
    InvalidVerificationToken {
        /// Why the token was rejected.
        message: String,
    },

    /// Verification was requested for an account that is already verified.
    #[error("Account already verified: {subject}")]
    AlreadyVerified {
        /// The verified subject.
        subject: String,
    },

    /// The token is structurally invalid or carries unacceptable claims.
    #[error("Malformed token: {message}")]
    Malformed {
        /// Description of what is wrong with the token.
        message: String,
    },

    /// The token is past its expiry plus leeway.
    #[error("Token expired")]
    Expired,

    /// The signature does not verify under the declared key.
    #[error("Token signature invalid")]
    SignatureInvalid,

    /// The token has been explicitly revoked.
    #[error("Token revoked")]
    Revoked,

    /// The token names a key version that is not (or no longer) known.
    #[error("Unknown key version: {version}")]
    UnknownKeyVersion {
        /// The key version declared in the token header.
        version: String,
    },

    /// Storage was unavailable or timed out. Safe to retry with backoff.
    #[error("Transient failure: {message}")]
    Transient {
        /// Description of the underlying failure.
        message: String,
    },

    /// Registration conflict.
    #[error("Subject already registered: {subject}")]
    DuplicateSubject {
        /// The conflicting subject.
        subject: String,
    },

    /// The request body failed validation.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Description of why the request is invalid.
        message: String,
    },

    /// Stored records are inconsistent or corrupt.
    #[error("Integrity violation: {message}")]
    Integrity {
        /// Description of the violation.
        message: String,
    },

    /// The auth configuration is invalid.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration error.
        message: String,
    },

    /// An unexpected internal error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl AuthError {
    /// Creates a new `UnknownSubject` error.
    #[must_use]
    pub fn unknown_subject(subject: impl Into<String>) -> Self {
        Self::UnknownSubject {
            subject: subject.into(),
        }
    }

    /// Creates a new `Malformed` error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    /// Creates a new `UnknownKeyVersion` error.
    #[must_use]
    pub fn unknown_key_version(version: impl Into<String>) -> Self {
        Self::UnknownKeyVersion {
            version: version.into(),
        }
    }

    /// Creates a new `InvalidVerificationToken` error.
    #[must_use]
    pub fn invalid_verification_token(message: impl Into<String>) -> Self {
        Self::InvalidVerificationToken {
            message: message.into(),
        }
    }

    /// Creates a new `AlreadyVerified` error.
    #[must_use]
    pub fn already_verified(subject: impl Into<String>) -> Self {
        Self::AlreadyVerified {
            subject: subject.into(),
        }
    }

    /// Creates a new `Transient` error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Creates a new `DuplicateSubject` error.
    #[must_use]
    pub fn duplicate_subject(subject: impl Into<String>) -> Self {
        Self::DuplicateSubject {
            subject: subject.into(),
        }
    }

    /// Creates a new `InvalidRequest` error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates a new `Integrity` error.
    #[must_use]
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }

    /// Creates a new `Configuration` error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` if this is a client error (4xx category).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidCredentials
                | Self::UnknownSubject { .. }
                | Self::AccountNotVerified
                | Self::InvalidVerificationToken { .. }
                | Self::AlreadyVerified { .. }
                | Self::Malformed { .. }
                | Self::Expired
                | Self::SignatureInvalid
                | Self::Revoked
                | Self::UnknownKeyVersion { .. }
                | Self::DuplicateSubject { .. }
                | Self::InvalidRequest { .. }
        )
    }

    /// Returns `true` if this is a server error (5xx category).
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. }
                | Self::Integrity { .. }
                | Self::Configuration { .. }
                | Self::Internal { .. }
        )
    }

    /// Returns `true` if the caller may retry the operation.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns `true` if this is a token rejection.
    #[must_use]
    pub fn is_token_error(&self) -> bool {
        matches!(
            self,
            Self::Malformed { .. }
                | Self::Expired
                | Self::SignatureInvalid
                | Self::Revoked
                | Self::UnknownKeyVersion { .. }
        )
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidCredentials | Self::UnknownSubject { .. } | Self::AccountNotVerified => {
                ErrorCategory::Authentication
            }
            Self::Malformed { .. }
            | Self::Expired
            | Self::SignatureInvalid
            | Self::Revoked
            | Self::UnknownKeyVersion { .. } => ErrorCategory::Token,
            Self::DuplicateSubject { .. } | Self::AlreadyVerified { .. } => ErrorCategory::Conflict,
            Self::InvalidRequest { .. } | Self::InvalidVerificationToken { .. } => {
                ErrorCategory::Validation
            }
            Self::Transient { .. } => ErrorCategory::Infrastructure,
            Self::Integrity { .. } => ErrorCategory::Integrity,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Stable machine-readable code used in response bodies.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials | Self::UnknownSubject { .. } => "invalid_credentials",
            Self::AccountNotVerified => "account_not_verified",
            Self::InvalidVerificationToken { .. } => "invalid_verification_token",
            Self::AlreadyVerified { .. } => "account_already_verified",
            Self::Malformed { .. } => "malformed_token",
            Self::Expired => "token_expired",
            Self::SignatureInvalid => "signature_invalid",
            Self::Revoked => "token_revoked",
            Self::UnknownKeyVersion { .. } => "unknown_key_version",
            Self::Transient { .. } => "temporarily_unavailable",
            Self::DuplicateSubject { .. } => "duplicate_subject",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Integrity { .. } | Self::Configuration { .. } | Self::Internal { .. } => {
                "server_error"
            }
        }
    }
}

impl From<crate::config::ConfigError> for AuthError {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::configuration(err.to_string())
    }
}

/// Categories of authentication errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Credential verification failures.
    Authentication,
    /// Token validation failures.
    Token,
    /// Request validation errors.
    Validation,
    /// Uniqueness conflicts.
    Conflict,
    /// Storage availability errors.
    Infrastructure,
    /// Data integrity violations.
    Integrity,
    /// Configuration errors.
    Configuration,
    /// Internal server errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authentication => write!(f, "authentication"),
            Self::Token => write!(f, "token"),
            Self::Validation => write!(f, "validation"),
            Self::Conflict => write!(f, "conflict"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Integrity => write!(f, "integrity"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
