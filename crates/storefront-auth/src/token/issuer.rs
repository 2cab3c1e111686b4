//! Token issuer.
//!
//! Mints access and refresh tokens signed with the current key version.
//! Pair issuance during refresh rotation revokes the presented refresh token
//! first; only the caller that wins that revocation gets a new pair.

use std::sync::Arc;

use time::Duration;
use uuid::Uuid;

use crate::AuthResult;
use crate::clock::{Clock, span};
use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::revocation::{RevocationReason, RevocationRegistry};
use crate::signer::Signer;

use super::claims::{Claims, ExtraClaims, TokenType};
use super::codec::{Header, encode};

/// An issued token and the claims it carries.
#[derive(Debug, Clone)]
pub struct Token {
    /// Compact encoded form handed to the client.
    pub value: String,
    /// Claims as signed.
    pub claims: Claims,
}

impl Token {
    /// The token id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.claims.jti
    }

    /// Access or refresh.
    #[must_use]
    pub fn token_type(&self) -> TokenType {
        self.claims.typ
    }
}

/// Access and refresh token issued together.
#[derive(Debug, Clone)]
pub struct TokenPair {
    /// Access token.
    pub access: Token,
    /// Refresh token.
    pub refresh: Token,
}

/// Session a token pair belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    /// Session id carried in the `sid` claim.
    pub session_id: String,
    /// Device context, if the client supplied one.
    pub device: Option<String>,
}

impl SessionContext {
    /// Starts a new session with a random id.
    #[must_use]
    pub fn new(device: Option<String>) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            device,
        }
    }

    /// The session a verified refresh token belongs to.
    #[must_use]
    pub fn from_claims(claims: &Claims) -> Option<Self> {
        claims.sid.as_ref().map(|sid| Self {
            session_id: sid.clone(),
            device: claims.device.clone(),
        })
    }
}

/// Builds and signs tokens.
pub struct TokenIssuer {
    signer: Signer,
    registry: Arc<RevocationRegistry>,
    clock: Arc<dyn Clock>,
    issuer: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenIssuer {
    /// Creates an issuer.
    pub fn new(
        signer: Signer,
        registry: Arc<RevocationRegistry>,
        clock: Arc<dyn Clock>,
        config: &AuthConfig,
    ) -> Self {
        Self {
            signer,
            registry,
            clock,
            issuer: config.issuer.clone(),
            access_ttl: span(config.tokens.access_token_lifetime),
            refresh_ttl: span(config.tokens.refresh_token_lifetime),
        }
    }

    /// Access token lifetime.
    #[must_use]
    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    /// Refresh token lifetime.
    #[must_use]
    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    /// Issues a standalone access token.
    pub fn issue_access(&self, subject: &str, extra: ExtraClaims) -> AuthResult<Token> {
        self.mint(subject, TokenType::Access, extra, None)
    }

    /// Issues a standalone refresh token.
    pub fn issue_refresh(&self, subject: &str) -> AuthResult<Token> {
        self.mint(subject, TokenType::Refresh, ExtraClaims::new(), None)
    }

    /// Issues an access/refresh pair for `session`.
    ///
    /// With `rotating` set, the presented refresh token is revoked before
    /// anything is minted. If another caller already revoked it the result
    /// is [`AuthError::Revoked`]. If minting fails after the revocation the
    /// old token stays revoked and the subject has to log in again.
    pub async fn issue_pair(
        &self,
        subject: &str,
        extra: ExtraClaims,
        session: &SessionContext,
        rotating: Option<&Claims>,
    ) -> AuthResult<TokenPair> {
        if let Some(previous) = rotating {
            if previous.sub != subject || !previous.is_refresh() {
                return Err(AuthError::malformed("rotated token does not belong to subject"));
            }
            let won = self
                .registry
                .revoke_claims(previous, RevocationReason::Rotated)
                .await?;
            if !won {
                tracing::warn!(
                    jti = %previous.jti,
                    subject = %subject,
                    "Refresh token already used"
                );
                return Err(AuthError::Revoked);
            }
        }

        let minted = self
            .mint(subject, TokenType::Access, extra, Some(session))
            .and_then(|access| {
                let refresh =
                    self.mint(subject, TokenType::Refresh, ExtraClaims::new(), Some(session))?;
                Ok(TokenPair { access, refresh })
            });
        if let (Err(err), Some(previous)) = (&minted, rotating) {
            tracing::error!(
                subject = %subject,
                jti = %previous.jti,
                error = %err,
                "Issuance failed after rotation; session must re-authenticate"
            );
        }
        minted
    }

    fn mint(
        &self,
        subject: &str,
        typ: TokenType,
        extra: ExtraClaims,
        session: Option<&SessionContext>,
    ) -> AuthResult<Token> {
        let material = self.signer.keys().current();
        let now = self.clock.now();
        let ttl = match typ {
            TokenType::Access => self.access_ttl,
            TokenType::Refresh => self.refresh_ttl,
        };
        let claims = Claims {
            iss: self.issuer.clone(),
            sub: subject.to_string(),
            iat: now.unix_timestamp(),
            exp: (now + ttl).unix_timestamp(),
            jti: Uuid::new_v4().to_string(),
            typ,
            kver: material.version(),
            sid: session.map(|s| s.session_id.clone()),
            device: session.and_then(|s| s.device.clone()),
            extra,
        };
        let header = Header::new(material.algorithm(), material.version());
        let value = encode(&header, &claims, material.version(), &self.signer)?;
        tracing::debug!(
            jti = %claims.jti,
            subject = %subject,
            typ = %typ,
            kid = %material.version(),
            "Token issued"
        );
        Ok(Token { value, claims })
    }
}
