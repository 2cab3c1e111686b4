//! Token verifier.
//!
//! Checks run in a fixed order and stop at the first failure:
//!
//! 1. structure (segments, base64url, header JSON, `typ`, `kid` syntax)
//! 2. key lookup and signature under the version named by `kid`; a version
//!    newer than any in the ring triggers one reload from the key store
//! 3. claims (decodable, `kver` equals `kid`, issuer, sane timestamps)
//! 4. expiry, with leeway
//! 5. revocation of the token id or its session id

use std::sync::Arc;

use time::Duration;

use crate::AuthResult;
use crate::clock::{Clock, span};
use crate::config::AuthConfig;
use crate::credential::{KeyStore, KeyVersion};
use crate::error::AuthError;
use crate::revocation::RevocationRegistry;
use crate::signer::Signer;

use super::claims::{Claims, TokenType};
use super::codec::{TOKEN_TYPE, UnverifiedToken};

/// Validates tokens issued by [`TokenIssuer`](super::TokenIssuer).
pub struct TokenVerifier {
    signer: Signer,
    registry: Arc<RevocationRegistry>,
    clock: Arc<dyn Clock>,
    issuer: String,
    leeway: Duration,
    key_source: Option<Arc<KeyStore>>,
}

impl TokenVerifier {
    /// Creates a verifier.
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
            leeway: span(config.tokens.leeway),
            key_source: None,
        }
    }

    /// Reloads from `keys` when a token names a version the ring has not
    /// seen yet, so tokens signed by a peer after a rotation verify here
    /// too. `keys` must wrap the signer's ring.
    #[must_use]
    pub fn with_key_source(mut self, keys: Arc<KeyStore>) -> Self {
        self.key_source = Some(keys);
        self
    }

    /// Verifies a token of either type and returns its claims.
    ///
    /// # Errors
    ///
    /// - [`AuthError::Malformed`] for structural or claim problems
    /// - [`AuthError::UnknownKeyVersion`] if `kid` is not retained
    /// - [`AuthError::SignatureInvalid`] if the signature does not verify
    /// - [`AuthError::Expired`] at or after expiry plus leeway
    /// - [`AuthError::Revoked`] if the token or its session was revoked
    /// - [`AuthError::Transient`] if the revocation lookup failed
    pub async fn verify(&self, token: &str) -> AuthResult<Claims> {
        let claims = self.verify_signed(token).await?;
        self.check_revocation(&claims).await?;
        Ok(claims)
    }

    /// Verifies an access token.
    pub async fn verify_access(&self, token: &str) -> AuthResult<Claims> {
        self.verify_typed(token, TokenType::Access).await
    }

    /// Verifies a refresh token.
    pub async fn verify_refresh(&self, token: &str) -> AuthResult<Claims> {
        self.verify_typed(token, TokenType::Refresh).await
    }

    async fn verify_typed(&self, token: &str, expected: TokenType) -> AuthResult<Claims> {
        let claims = self.verify_signed(token).await?;
        if claims.typ != expected {
            return Err(AuthError::malformed(format!(
                "expected {expected} token, got {}",
                claims.typ
            )));
        }
        self.check_revocation(&claims).await?;
        Ok(claims)
    }

    async fn verify_signed(&self, token: &str) -> AuthResult<Claims> {
        let err = match self.verify_stateless(token) {
            Err(err @ AuthError::UnknownKeyVersion { .. }) => err,
            other => return other,
        };
        let kid = match &err {
            AuthError::UnknownKeyVersion { version } => version.parse::<KeyVersion>().ok(),
            _ => None,
        };
        let (Some(keys), Some(kid)) = (&self.key_source, kid) else {
            return Err(err);
        };
        match keys.sync_for(kid).await {
            Ok(true) => self.verify_stateless(token),
            Ok(false) => Err(err),
            Err(sync_err) => {
                tracing::warn!(kid = %kid, error = %sync_err, "Key reload failed");
                Err(err)
            }
        }
    }

    /// Everything except the revocation lookup.
    fn verify_stateless(&self, token: &str) -> AuthResult<Claims> {
        let parsed = UnverifiedToken::parse(token)?;
        if parsed.header.typ != TOKEN_TYPE {
            return Err(AuthError::malformed(format!(
                "unexpected header type '{}'",
                parsed.header.typ
            )));
        }
        let kid: KeyVersion = parsed
            .header
            .kid
            .parse()
            .map_err(|_| AuthError::malformed(format!("bad key id '{}'", parsed.header.kid)))?;

        if self.signer.keys().get(kid).is_none() {
            return Err(AuthError::unknown_key_version(kid.to_string()));
        }
        if !self.signer.verify_declared(
            parsed.signing_input(),
            parsed.signature(),
            kid,
            &parsed.header.alg,
        ) {
            return Err(AuthError::SignatureInvalid);
        }

        let claims: Claims = parsed.claims()?;
        claims
            .extra
            .validate()
            .map_err(|e| AuthError::malformed(e.to_string()))?;
        if claims.kver != kid {
            return Err(AuthError::malformed(format!(
                "key version claim {} does not match signing key {kid}",
                claims.kver
            )));
        }
        if claims.iss != self.issuer {
            return Err(AuthError::malformed(format!(
                "unexpected issuer '{}'",
                claims.iss
            )));
        }

        let now = self.clock.now();
        if claims.exp <= claims.iat {
            return Err(AuthError::malformed("expiry precedes issue time"));
        }
        if claims.issued_at() > now + self.leeway {
            return Err(AuthError::malformed("token issued in the future"));
        }
        if now >= claims.expires_at() + self.leeway {
            return Err(AuthError::Expired);
        }
        Ok(claims)
    }

    async fn check_revocation(&self, claims: &Claims) -> AuthResult<()> {
        if self.registry.is_revoked(&claims.jti).await? {
            tracing::debug!(jti = %claims.jti, subject = %claims.sub, "Rejected revoked token");
            return Err(AuthError::Revoked);
        }
        if let Some(sid) = &claims.sid {
            if self.registry.is_revoked(sid).await? {
                tracing::debug!(
                    jti = %claims.jti,
                    sid = %sid,
                    subject = %claims.sub,
                    "Rejected token of ended session"
                );
                return Err(AuthError::Revoked);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::credential::{KeyRing, SigningAlgorithm};
    use crate::revocation::RevocationReason;
    use crate::storage::{MemoryRevocationStorage, MemorySessionStorage};
    use crate::token::codec::{Header, encode};
    use crate::token::{ExtraClaims, SessionContext, TokenIssuer};
    use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};

    struct Fixture {
        clock: ManualClock,
        keys: Arc<KeyRing>,
        registry: Arc<RevocationRegistry>,
        issuer: TokenIssuer,
        verifier: TokenVerifier,
    }

    fn fixture_with(algorithm: SigningAlgorithm) -> Fixture {
        let clock = ManualClock::starting_now();
        let config = AuthConfig::default();
        let keys = Arc::new(KeyRing::generate(algorithm, clock.now()).unwrap());
        let registry = Arc::new(RevocationRegistry::new(
            Arc::new(MemoryRevocationStorage::new()),
            Arc::new(MemorySessionStorage::new()),
            Arc::new(clock.clone()),
            &config,
        ));
        let signer = Signer::new(Arc::clone(&keys));
        let issuer = TokenIssuer::new(
            signer.clone(),
            Arc::clone(&registry),
            Arc::new(clock.clone()),
            &config,
        );
        let verifier =
            TokenVerifier::new(signer, Arc::clone(&registry), Arc::new(clock.clone()), &config);
        Fixture {
            clock,
            keys,
            registry,
            issuer,
            verifier,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(SigningAlgorithm::HS256)
    }

    #[tokio::test]
    async fn test_claims_round_trip() {
        let f = fixture();
        let extra = ExtraClaims::new().with("role", "admin").unwrap();
        let token = f.issuer.issue_access("alice", extra).unwrap();

        let claims = f.verifier.verify(&token.value).await.unwrap();
        assert_eq!(claims, token.claims);
    }

    #[tokio::test]
    async fn test_expiry_boundary_with_leeway() {
        let f = fixture();
        let token = f.issuer.issue_access("alice", ExtraClaims::new()).unwrap();

        // Past exp but inside the 30s leeway.
        f.clock.advance(Duration::minutes(15) + Duration::seconds(29));
        assert!(f.verifier.verify(&token.value).await.is_ok());

        // Exactly exp + leeway.
        f.clock.advance(Duration::seconds(1));
        assert!(matches!(
            f.verifier.verify(&token.value).await.unwrap_err(),
            AuthError::Expired
        ));
    }

    #[tokio::test]
    async fn test_tampered_claims_fail_signature() {
        let f = fixture();
        let token = f.issuer.issue_access("alice", ExtraClaims::new()).unwrap();
        let mut parts: Vec<&str> = token.value.split('.').collect();
        let mut forged = token.claims.clone();
        forged.sub = "mallory".to_string();
        let forged = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap());
        parts[1] = &forged;

        let err = f.verifier.verify(&parts.join(".")).await.unwrap_err();
        assert!(matches!(err, AuthError::SignatureInvalid));
    }

    #[tokio::test]
    async fn test_garbage_is_malformed() {
        let f = fixture();
        for input in ["", "abc", "a.b.c", "..."] {
            let err = f.verifier.verify(input).await.unwrap_err();
            assert!(matches!(err, AuthError::Malformed { .. }), "{input:?}");
        }
    }

    #[tokio::test]
    async fn test_unknown_key_version() {
        let f = fixture();
        let token = f.issuer.issue_access("alice", ExtraClaims::new()).unwrap();
        let (_, rest) = token.value.split_once('.').unwrap();
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT","kid":"v7"}"#);
        let err = f
            .verifier
            .verify(&format!("{header}.{rest}"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UnknownKeyVersion { .. }));
    }

    #[tokio::test]
    async fn test_kver_claim_must_match_kid() {
        let f = fixture();
        let v1 = f.keys.current_version();
        f.keys.rotate(f.clock.now()).unwrap();

        // Signed by v1 but claiming v2.
        let mut claims = f.issuer.issue_access("alice", ExtraClaims::new()).unwrap().claims;
        assert_eq!(claims.kver, KeyVersion::new(2));
        let token = encode(
            &Header::new(SigningAlgorithm::HS256, v1),
            &claims,
            v1,
            &Signer::new(Arc::clone(&f.keys)),
        )
        .unwrap();
        let err = f.verifier.verify(&token).await.unwrap_err();
        assert!(matches!(err, AuthError::Malformed { .. }));

        claims.kver = v1;
        let token = encode(
            &Header::new(SigningAlgorithm::HS256, v1),
            &claims,
            v1,
            &Signer::new(Arc::clone(&f.keys)),
        )
        .unwrap();
        assert!(f.verifier.verify(&token).await.is_ok());
    }

    #[tokio::test]
    async fn test_foreign_issuer_rejected() {
        let f = fixture();
        let mut claims = f.issuer.issue_access("alice", ExtraClaims::new()).unwrap().claims;
        claims.iss = "elsewhere".to_string();
        let v = f.keys.current_version();
        let token = encode(
            &Header::new(SigningAlgorithm::HS256, v),
            &claims,
            v,
            &Signer::new(Arc::clone(&f.keys)),
        )
        .unwrap();
        assert!(matches!(
            f.verifier.verify(&token).await.unwrap_err(),
            AuthError::Malformed { .. }
        ));
    }

    #[tokio::test]
    async fn test_revoked_token_and_session() {
        let f = fixture();
        let session = SessionContext::new(None);
        let pair = f
            .issuer
            .issue_pair("alice", ExtraClaims::new(), &session, None)
            .await
            .unwrap();

        f.registry
            .revoke_claims(&pair.refresh.claims, RevocationReason::Logout)
            .await
            .unwrap();
        assert!(matches!(
            f.verifier.verify(&pair.refresh.value).await.unwrap_err(),
            AuthError::Revoked
        ));
        assert!(f.verifier.verify(&pair.access.value).await.is_ok());

        f.registry
            .revoke(
                &session.session_id,
                "alice",
                RevocationReason::Logout,
                pair.refresh.claims.expires_at(),
            )
            .await
            .unwrap();
        assert!(matches!(
            f.verifier.verify(&pair.access.value).await.unwrap_err(),
            AuthError::Revoked
        ));
    }

    #[tokio::test]
    async fn test_type_checks() {
        let f = fixture();
        let access = f.issuer.issue_access("alice", ExtraClaims::new()).unwrap();
        let refresh = f.issuer.issue_refresh("alice").unwrap();

        assert!(f.verifier.verify_access(&access.value).await.is_ok());
        assert!(f.verifier.verify_refresh(&refresh.value).await.is_ok());
        assert!(matches!(
            f.verifier.verify_access(&refresh.value).await.unwrap_err(),
            AuthError::Malformed { .. }
        ));
        assert!(matches!(
            f.verifier.verify_refresh(&access.value).await.unwrap_err(),
            AuthError::Malformed { .. }
        ));
    }

    #[tokio::test]
    async fn test_rotation_keeps_old_tokens_valid() {
        let f = fixture_with(SigningAlgorithm::ES384);
        let old = f.issuer.issue_access("alice", ExtraClaims::new()).unwrap();

        f.keys.rotate(f.clock.now()).unwrap();
        let new = f.issuer.issue_access("alice", ExtraClaims::new()).unwrap();

        assert_eq!(old.claims.kver, KeyVersion::new(1));
        assert_eq!(new.claims.kver, KeyVersion::new(2));
        assert!(f.verifier.verify(&old.value).await.is_ok());
        assert!(f.verifier.verify(&new.value).await.is_ok());

        f.clock.advance(Duration::minutes(16));
        assert!(matches!(
            f.verifier.verify(&old.value).await.unwrap_err(),
            AuthError::Expired
        ));
    }

    #[tokio::test]
    async fn test_future_issued_token_rejected() {
        let f = fixture();
        let token = f.issuer.issue_access("alice", ExtraClaims::new()).unwrap();
        f.clock.advance(Duration::minutes(-5));
        assert!(matches!(
            f.verifier.verify(&token.value).await.unwrap_err(),
            AuthError::Malformed { .. }
        ));
    }

    #[tokio::test]
    async fn test_token_from_peer_rotation_verifies() {
        use crate::storage::{KeyStorage, MemoryKeyStorage};

        let clock = ManualClock::starting_now();
        let config = AuthConfig::default();
        let storage: Arc<dyn KeyStorage> = Arc::new(MemoryKeyStorage::new());
        let ours = Arc::new(
            KeyStore::open(Arc::clone(&storage), &config, clock.now())
                .await
                .unwrap(),
        );
        let peer = KeyStore::open(storage, &config, clock.now()).await.unwrap();
        peer.rotate(clock.now()).await.unwrap();

        let registry = Arc::new(RevocationRegistry::new(
            Arc::new(MemoryRevocationStorage::new()),
            Arc::new(MemorySessionStorage::new()),
            Arc::new(clock.clone()),
            &config,
        ));
        let peer_issuer = TokenIssuer::new(
            Signer::new(Arc::clone(peer.ring())),
            Arc::clone(&registry),
            Arc::new(clock.clone()),
            &config,
        );
        let token = peer_issuer.issue_access("alice", ExtraClaims::new()).unwrap();

        let verifier = TokenVerifier::new(
            Signer::new(Arc::clone(ours.ring())),
            registry,
            Arc::new(clock.clone()),
            &config,
        );
        assert!(matches!(
            verifier.verify(&token.value).await.unwrap_err(),
            AuthError::UnknownKeyVersion { .. }
        ));

        let verifier = verifier.with_key_source(Arc::clone(&ours));
        let claims = verifier.verify(&token.value).await.unwrap();
        assert_eq!(claims.kver, KeyVersion::new(2));
    }
}
