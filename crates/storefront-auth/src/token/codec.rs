//! Compact token encoding.
//!
//! `base64url(header) . base64url(claims) . base64url(signature)`, unpadded.
//! The signature covers the first two segments exactly as transmitted.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::AuthResult;
use crate::credential::{KeyVersion, SigningAlgorithm};
use crate::error::AuthError;
use crate::signer::Signer;

/// Media type marker placed in every header.
pub const TOKEN_TYPE: &str = "JWT";

/// Upper bound on an encoded token, to cap work on hostile input.
pub const MAX_TOKEN_LENGTH: usize = 8 * 1024;

/// Token header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Signing algorithm name.
    pub alg: String,
    /// Always `JWT`.
    pub typ: String,
    /// Key version, `v<N>`.
    pub kid: String,
}

impl Header {
    /// Header for a token signed with `version` under `algorithm`.
    #[must_use]
    pub fn new(algorithm: SigningAlgorithm, version: KeyVersion) -> Self {
        Self {
            alg: algorithm.as_str().to_string(),
            typ: TOKEN_TYPE.to_string(),
            kid: version.to_string(),
        }
    }
}

/// Serializes and signs a token.
pub fn encode<C: Serialize>(
    header: &Header,
    claims: &C,
    version: KeyVersion,
    signer: &Signer,
) -> AuthResult<String> {
    let header_json = serde_json::to_vec(header)
        .map_err(|e| AuthError::internal(format!("header serialization: {e}")))?;
    let claims_json = serde_json::to_vec(claims)
        .map_err(|e| AuthError::internal(format!("claims serialization: {e}")))?;

    let mut token = String::with_capacity(256);
    token.push_str(&URL_SAFE_NO_PAD.encode(header_json));
    token.push('.');
    token.push_str(&URL_SAFE_NO_PAD.encode(claims_json));

    let signature = signer.sign(token.as_bytes(), version)?;
    token.push('.');
    token.push_str(&URL_SAFE_NO_PAD.encode(signature));
    Ok(token)
}

/// A token split into its parts. Nothing in it is trusted yet.
#[derive(Debug)]
pub struct UnverifiedToken<'a> {
    /// Decoded header.
    pub header: Header,
    signing_input: &'a str,
    claims: Vec<u8>,
    signature: Vec<u8>,
}

impl<'a> UnverifiedToken<'a> {
    /// Splits and decodes a compact token.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Malformed`] on any structural problem.
    pub fn parse(token: &'a str) -> AuthResult<Self> {
        if token.len() > MAX_TOKEN_LENGTH {
            return Err(AuthError::malformed("token too long"));
        }
        let Some((signing_input, signature)) = token.rsplit_once('.') else {
            return Err(AuthError::malformed("expected 3 segments"));
        };
        let Some((header, claims)) = signing_input.split_once('.') else {
            return Err(AuthError::malformed("expected 3 segments"));
        };
        if claims.contains('.') {
            return Err(AuthError::malformed("expected 3 segments"));
        }

        let header_bytes = URL_SAFE_NO_PAD
            .decode(header)
            .map_err(|_| AuthError::malformed("header is not base64url"))?;
        let header: Header = serde_json::from_slice(&header_bytes)
            .map_err(|e| AuthError::malformed(format!("header: {e}")))?;
        let claims = URL_SAFE_NO_PAD
            .decode(claims)
            .map_err(|_| AuthError::malformed("claims are not base64url"))?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| AuthError::malformed("signature is not base64url"))?;
        if signature.is_empty() {
            return Err(AuthError::malformed("empty signature"));
        }

        Ok(Self {
            header,
            signing_input,
            claims,
            signature,
        })
    }

    /// The bytes the signature covers.
    #[must_use]
    pub fn signing_input(&self) -> &[u8] {
        self.signing_input.as_bytes()
    }

    /// The raw signature.
    #[must_use]
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Deserializes the claims. Call only after the signature checked out.
    pub fn claims<C: DeserializeOwned>(&self) -> AuthResult<C> {
        serde_json::from_slice(&self.claims)
            .map_err(|e| AuthError::malformed(format!("claims: {e}")))
    }
}
