//! Token issuance and verification.
//!
//! - [`claims`] - typed claims and the validated extension map
//! - [`codec`] - compact `header.claims.signature` encoding
//! - [`issuer`] - access/refresh token minting and pair rotation
//! - [`verifier`] - ordered structural, signature, expiry and revocation checks

pub mod claims;
pub mod codec;
pub mod issuer;
pub mod verifier;

pub use claims::{Claims, ExtraClaims, RESERVED_CLAIMS, TokenType};
pub use codec::{Header, MAX_TOKEN_LENGTH, UnverifiedToken};
pub use issuer::{SessionContext, Token, TokenIssuer, TokenPair};
pub use verifier::TokenVerifier;
