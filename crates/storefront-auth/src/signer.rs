//! Cryptographic signer.
//!
//! Signs and verifies raw payload bytes with a specific key version from the
//! [`KeyRing`]. Verification fails closed: every problem (unknown version,
//! algorithm mismatch, undecodable signature, wrong key) yields `false`.

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};

use crate::AuthResult;
use crate::credential::{KeyRing, KeyVersion, SigningAlgorithm};
use crate::error::AuthError;

/// Signs and verifies with versioned key material.
#[derive(Debug, Clone)]
pub struct Signer {
    keys: Arc<KeyRing>,
}

impl Signer {
    /// Creates a signer over `keys`.
    #[must_use]
    pub fn new(keys: Arc<KeyRing>) -> Self {
        Self { keys }
    }

    /// The key ring this signer reads from.
    #[must_use]
    pub fn keys(&self) -> &Arc<KeyRing> {
        &self.keys
    }

    /// Signs `payload` with the given key version.
    ///
    /// # Errors
    ///
    /// - [`AuthError::UnknownKeyVersion`] if the version is not retained
    /// - [`AuthError::Internal`] if the crypto backend fails
    pub fn sign(&self, payload: &[u8], version: KeyVersion) -> AuthResult<Vec<u8>> {
        let material = self
            .keys
            .get(version)
            .ok_or_else(|| AuthError::unknown_key_version(version.to_string()))?;
        let encoded = jsonwebtoken::crypto::sign(
            payload,
            material.encoding_key(),
            material.algorithm().to_jwt_algorithm(),
        )
        .map_err(|e| AuthError::internal(format!("signing failed: {e}")))?;
        URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| AuthError::internal(format!("signature encoding: {e}")))
    }

    /// Verifies `signature` over `payload` under the given key version.
    #[must_use]
    pub fn verify(&self, payload: &[u8], signature: &[u8], version: KeyVersion) -> bool {
        let Some(material) = self.keys.get(version) else {
            return false;
        };
        if signature.is_empty() {
            return false;
        }
        let encoded = URL_SAFE_NO_PAD.encode(signature);
        jsonwebtoken::crypto::verify(
            &encoded,
            payload,
            material.decoding_key(),
            material.algorithm().to_jwt_algorithm(),
        )
        .unwrap_or(false)
    }

    /// Like [`verify`](Self::verify), but first requires the algorithm the
    /// token declares to be the one bound to the key version.
    #[must_use]
    pub fn verify_declared(
        &self,
        payload: &[u8],
        signature: &[u8],
        version: KeyVersion,
        declared: &str,
    ) -> bool {
        let Some(material) = self.keys.get(version) else {
            return false;
        };
        let Ok(declared) = declared.parse::<SigningAlgorithm>() else {
            return false;
        };
        if declared != material.algorithm() {
            tracing::warn!(
                kid = %version,
                declared = %declared,
                expected = %material.algorithm(),
                "Rejected signature with mismatched algorithm"
            );
            return false;
        }
        self.verify(payload, signature, version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn signer(algorithm: SigningAlgorithm) -> Signer {
        Signer::new(Arc::new(
            KeyRing::generate(algorithm, OffsetDateTime::now_utc()).unwrap(),
        ))
    }

    #[test]
    fn test_sign_and_verify_hs256() {
        let signer = signer(SigningAlgorithm::HS256);
        let version = signer.keys().current_version();
        let sig = signer.sign(b"header.claims", version).unwrap();
        assert_eq!(sig.len(), 32);
        assert!(signer.verify(b"header.claims", &sig, version));
        assert!(!signer.verify(b"header.claimz", &sig, version));
    }

    #[test]
    fn test_sign_and_verify_es384() {
        let signer = signer(SigningAlgorithm::ES384);
        let version = signer.keys().current_version();
        let sig = signer.sign(b"payload", version).unwrap();
        assert!(signer.verify(b"payload", &sig, version));
        assert!(signer.verify_declared(b"payload", &sig, version, "ES384"));
    }

    #[test]
    fn test_verify_fails_closed() {
        let signer = signer(SigningAlgorithm::HS256);
        let version = signer.keys().current_version();
        let sig = signer.sign(b"payload", version).unwrap();

        assert!(!signer.verify(b"payload", &[], version));
        assert!(!signer.verify(b"payload", &sig[..16], version));
        assert!(!signer.verify(b"payload", &sig, KeyVersion::new(99)));
    }

    #[test]
    fn test_unknown_version_cannot_sign() {
        let signer = signer(SigningAlgorithm::HS256);
        let err = signer.sign(b"payload", KeyVersion::new(9)).unwrap_err();
        assert!(matches!(err, AuthError::UnknownKeyVersion { .. }));
    }

    #[test]
    fn test_declared_algorithm_must_match() {
        let signer = signer(SigningAlgorithm::HS256);
        let version = signer.keys().current_version();
        let sig = signer.sign(b"payload", version).unwrap();

        assert!(signer.verify_declared(b"payload", &sig, version, "HS256"));
        assert!(!signer.verify_declared(b"payload", &sig, version, "RS256"));
        assert!(!signer.verify_declared(b"payload", &sig, version, "none"));
    }

    #[test]
    fn test_old_version_verifies_after_rotation() {
        let signer = signer(SigningAlgorithm::HS256);
        let v1 = signer.keys().current_version();
        let sig = signer.sign(b"payload", v1).unwrap();

        let v2 = signer.keys().rotate(OffsetDateTime::now_utc()).unwrap();
        assert!(signer.verify(b"payload", &sig, v1));
        assert!(!signer.verify(b"payload", &sig, v2));
    }
}
