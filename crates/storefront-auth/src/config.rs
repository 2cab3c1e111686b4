//! Authentication configuration.
//!
//! Token lifetimes, signing key source, session policy and revocation
//! housekeeping are all configured here. Durations use humantime notation
//! (`"15m"`, `"7d"`).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::credential::SigningAlgorithm;

/// Minimum length of a shared HMAC secret, in bytes.
pub const MIN_HMAC_SECRET_BYTES: usize = 32;

/// Root authentication configuration.
///
/// # Example (TOML)
///
/// ```toml
/// [auth]
/// issuer = "storefront"
///
/// [auth.tokens]
/// access_token_lifetime = "15m"
/// refresh_token_lifetime = "7d"
/// leeway = "30s"
///
/// [auth.sessions]
/// single_session = true
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Value of the `iss` claim. Tokens from any other issuer are rejected.
    pub issuer: String,

    /// Token lifetime configuration.
    pub tokens: TokenConfig,

    /// Token signing configuration.
    pub signing: SigningConfig,

    /// Password policy.
    pub credentials: CredentialConfig,

    /// Session policy.
    pub sessions: SessionConfig,

    /// Revocation registry housekeeping.
    pub revocation: RevocationConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: "storefront".to_string(),
            tokens: TokenConfig::default(),
            signing: SigningConfig::default(),
            credentials: CredentialConfig::default(),
            sessions: SessionConfig::default(),
            revocation: RevocationConfig::default(),
        }
    }
}

/// Token lifetimes and clock-skew tolerance.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Access token lifetime (minutes-scale).
    #[serde(with = "humantime_serde")]
    pub access_token_lifetime: Duration,

    /// Refresh token lifetime (days-scale).
    #[serde(with = "humantime_serde")]
    pub refresh_token_lifetime: Duration,

    /// Tolerance applied to expiry checks to absorb clock drift.
    #[serde(with = "humantime_serde")]
    pub leeway: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            access_token_lifetime: Duration::from_secs(15 * 60),
            refresh_token_lifetime: Duration::from_secs(7 * 24 * 3600),
            leeway: Duration::from_secs(30),
        }
    }
}

/// Token signing configuration.
///
/// With no key source configured a fresh key of the chosen algorithm is
/// generated at startup, which invalidates outstanding tokens on restart.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SigningConfig {
    /// Signing algorithm.
    /// Supported: "HS256", "RS256", "RS384", "ES384"
    pub algorithm: String,

    /// Hex-encoded HMAC secret (HS256 only).
    pub secret: Option<String>,

    /// PEM file holding the private key (RS256, RS384, ES384).
    pub private_key_path: Option<PathBuf>,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            algorithm: "HS256".to_string(),
            secret: None,
            private_key_path: None,
        }
    }
}

impl SigningConfig {
    /// Parses the configured algorithm name.
    pub fn algorithm(&self) -> Result<SigningAlgorithm, ConfigError> {
        self.algorithm.parse().map_err(|_| {
            ConfigError::InvalidValue(format!(
                "Invalid signing algorithm: '{}'. Must be HS256, RS256, RS384, or ES384",
                self.algorithm
            ))
        })
    }

    /// Decodes the configured HMAC secret, if any.
    pub fn secret_bytes(&self) -> Result<Option<Vec<u8>>, ConfigError> {
        let Some(secret) = self.secret.as_deref() else {
            return Ok(None);
        };
        let bytes = hex::decode(secret.trim())
            .map_err(|e| ConfigError::InvalidValue(format!("signing.secret is not hex: {e}")))?;
        Ok(Some(bytes))
    }
}

/// Password acceptance rules and account verification policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Minimum password length in characters.
    pub min_password_length: usize,

    /// Maximum password length in characters.
    pub max_password_length: usize,

    /// New accounts stay pending until verified with a single-use token.
    /// When off, accounts are verified at registration.
    pub require_verification: bool,

    /// How long a verification token can be redeemed.
    #[serde(with = "humantime_serde")]
    pub verification_token_lifetime: Duration,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            min_password_length: 8,
            max_password_length: 128,
            require_verification: true,
            verification_token_lifetime: Duration::from_secs(15 * 60),
        }
    }
}

/// Session policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Allow at most one active refresh token per subject and device.
    /// A new login for the same device revokes the previous session.
    pub single_session: bool,

    /// Upper bound on any single storage call.
    #[serde(with = "humantime_serde")]
    pub storage_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            single_session: false,
            storage_timeout: Duration::from_secs(5),
        }
    }
}

/// Revocation registry housekeeping.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RevocationConfig {
    /// How long past a token's expiry its revocation entry is kept.
    /// Must be at least the token leeway.
    #[serde(with = "humantime_serde")]
    pub purge_grace: Duration,

    /// How often the background purge runs.
    #[serde(with = "humantime_serde")]
    pub purge_interval: Duration,
}

impl Default for RevocationConfig {
    fn default() -> Self {
        Self {
            purge_grace: Duration::from_secs(5 * 60),
            purge_interval: Duration::from_secs(10 * 60),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// An invalid configuration value was provided.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// A required configuration value is missing.
    #[error("Missing required configuration: {0}")]
    Missing(String),
}

impl AuthConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if:
    /// - The issuer is empty
    /// - The signing algorithm is not supported, or the key source does not
    ///   match it
    /// - A lifetime is zero or the access lifetime is not shorter than the
    ///   refresh lifetime
    /// - The purge grace is shorter than the leeway
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.issuer.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "issuer cannot be empty".to_string(),
            ));
        }

        let algorithm = self.signing.algorithm()?;
        let secret = self.signing.secret_bytes()?;
        if algorithm.is_hmac() {
            if self.signing.private_key_path.is_some() {
                return Err(ConfigError::InvalidValue(
                    "signing.private_key_path cannot be used with HS256".to_string(),
                ));
            }
            if let Some(secret) = secret
                && secret.len() < MIN_HMAC_SECRET_BYTES
            {
                return Err(ConfigError::InvalidValue(format!(
                    "signing.secret must be at least {MIN_HMAC_SECRET_BYTES} bytes"
                )));
            }
        } else if secret.is_some() {
            return Err(ConfigError::InvalidValue(format!(
                "signing.secret cannot be used with {}",
                algorithm.as_str()
            )));
        }

        if self.tokens.access_token_lifetime.is_zero() {
            return Err(ConfigError::InvalidValue(
                "access_token_lifetime must be > 0".to_string(),
            ));
        }
        if self.tokens.refresh_token_lifetime.is_zero() {
            return Err(ConfigError::InvalidValue(
                "refresh_token_lifetime must be > 0".to_string(),
            ));
        }
        if self.tokens.access_token_lifetime >= self.tokens.refresh_token_lifetime {
            return Err(ConfigError::InvalidValue(
                "access_token_lifetime must be shorter than refresh_token_lifetime".to_string(),
            ));
        }

        if self.revocation.purge_grace < self.tokens.leeway {
            return Err(ConfigError::InvalidValue(
                "revocation.purge_grace must be >= tokens.leeway".to_string(),
            ));
        }
        if self.revocation.purge_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "revocation.purge_interval must be > 0".to_string(),
            ));
        }

        if self.sessions.storage_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "sessions.storage_timeout must be > 0".to_string(),
            ));
        }

        let creds = &self.credentials;
        if creds.min_password_length == 0 || creds.min_password_length > creds.max_password_length
        {
            return Err(ConfigError::InvalidValue(
                "password length bounds must satisfy 0 < min <= max".to_string(),
            ));
        }
        if creds.verification_token_lifetime.is_zero() {
            return Err(ConfigError::InvalidValue(
                "credentials.verification_token_lifetime must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AuthConfig::default();
        assert_eq!(config.issuer, "storefront");
        assert_eq!(config.signing.algorithm, "HS256");
        assert!(!config.sessions.single_session);
        assert_eq!(config.tokens.leeway, Duration::from_secs(30));
        assert!(config.credentials.require_verification);
        assert_eq!(
            config.credentials.verification_token_lifetime,
            Duration::from_secs(900)
        );
    }

    #[test]
    fn test_default_config_validates() {
        assert!(AuthConfig::default().validate().is_ok());
    }

    #[test]
    fn test_empty_issuer_fails_validation() {
        let mut config = AuthConfig::default();
        config.issuer = "  ".to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
        assert!(err.to_string().contains("issuer"));
    }

    #[test]
    fn test_valid_algorithms() {
        for alg in ["HS256", "RS256", "RS384", "ES384"] {
            let mut config = AuthConfig::default();
            config.signing.algorithm = alg.to_string();
            assert!(
                config.validate().is_ok(),
                "Algorithm {} should be valid",
                alg
            );
        }
    }

    #[test]
    fn test_invalid_algorithm_fails_validation() {
        let mut config = AuthConfig::default();
        config.signing.algorithm = "none".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("signing algorithm"));
    }

    #[test]
    fn test_short_secret_fails_validation() {
        let mut config = AuthConfig::default();
        config.signing.secret = Some("deadbeef".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("at least 32 bytes"));
    }

    #[test]
    fn test_non_hex_secret_fails_validation() {
        let mut config = AuthConfig::default();
        config.signing.secret = Some("not-a-hex-secret".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("not hex"));
    }

    #[test]
    fn test_hex_secret_decodes() {
        let mut config = AuthConfig::default();
        config.signing.secret = Some("ab".repeat(32));
        assert!(config.validate().is_ok());
        assert_eq!(config.signing.secret_bytes().unwrap().unwrap().len(), 32);
    }

    #[test]
    fn test_secret_with_asymmetric_algorithm_fails() {
        let mut config = AuthConfig::default();
        config.signing.algorithm = "ES384".to_string();
        config.signing.secret = Some("ab".repeat(32));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_key_path_with_hmac_fails() {
        let mut config = AuthConfig::default();
        config.signing.private_key_path = Some(PathBuf::from("/etc/keys/signing.pem"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_access_lifetime_must_be_shorter_than_refresh() {
        let mut config = AuthConfig::default();
        config.tokens.access_token_lifetime = config.tokens.refresh_token_lifetime;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("shorter"));
    }

    #[test]
    fn test_zero_lifetime_fails_validation() {
        let mut config = AuthConfig::default();
        config.tokens.access_token_lifetime = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_purge_grace_below_leeway_fails() {
        let mut config = AuthConfig::default();
        config.tokens.leeway = Duration::from_secs(120);
        config.revocation.purge_grace = Duration::from_secs(60);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("purge_grace"));
    }

    #[test]
    fn test_password_bounds_validation() {
        let mut config = AuthConfig::default();
        config.credentials.min_password_length = 200;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_verification_lifetime_fails() {
        let mut config = AuthConfig::default();
        config.credentials.verification_token_lifetime = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("verification_token_lifetime"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue("test error".to_string());
        assert_eq!(err.to_string(), "Invalid configuration value: test error");

        let err = ConfigError::Missing("signing.private_key_path".to_string());
        assert_eq!(
            err.to_string(),
            "Missing required configuration: signing.private_key_path"
        );
    }

    #[test]
    fn test_humantime_durations_deserialize() {
        let json = r#"{
            "issuer": "shop",
            "tokens": { "access_token_lifetime": "5m", "refresh_token_lifetime": "2days" },
            "sessions": { "single_session": true }
        }"#;
        let config: AuthConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.issuer, "shop");
        assert_eq!(config.tokens.access_token_lifetime, Duration::from_secs(300));
        assert_eq!(
            config.tokens.refresh_token_lifetime,
            Duration::from_secs(2 * 24 * 3600)
        );
        assert_eq!(config.tokens.leeway, Duration::from_secs(30));
        assert!(config.sessions.single_session);
    }
}
