//! Versioned signing key material.
//!
//! Every token header carries the version of the key that signed it (`kid`,
//! rendered as `v<N>`). The [`KeyRing`] holds the current version plus every
//! superseded version that may still have live tokens, so rotation never
//! invalidates outstanding tokens.
//!
//! ## Supported Algorithms
//!
//! - **HS256**: HMAC with SHA-256 over a shared secret
//! - **RS256**: RSA with SHA-256
//! - **RS384**: RSA with SHA-384
//! - **ES384**: ECDSA with P-384 curve

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use p384::SecretKey as EcSecretKey;
use p384::ecdsa::SigningKey as EcSigningKey;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use rand::rngs::OsRng;
use rsa::RsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::config::{MIN_HMAC_SECRET_BYTES, SigningConfig};
use crate::storage::StoredKey;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while creating or loading key material.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// Failed to generate a cryptographic key.
    #[error("Key generation error: {message}")]
    Generation {
        /// Description of the key generation error.
        message: String,
    },

    /// Invalid key format or data.
    #[error("Invalid key: {message}")]
    InvalidKey {
        /// Description of why the key is invalid.
        message: String,
    },

    /// The key file could not be read.
    #[error("Failed to read key file {path}: {source}")]
    Io {
        /// The path that was read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl KeyError {
    /// Creates a new `Generation` error.
    #[must_use]
    pub fn generation(message: impl Into<String>) -> Self {
        Self::Generation {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidKey` error.
    #[must_use]
    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::InvalidKey {
            message: message.into(),
        }
    }
}

impl From<KeyError> for crate::error::AuthError {
    fn from(err: KeyError) -> Self {
        Self::configuration(err.to_string())
    }
}

// ============================================================================
// Signing Algorithm
// ============================================================================

/// Supported signing algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SigningAlgorithm {
    /// HMAC with SHA-256.
    HS256,
    /// RSA with SHA-256.
    RS256,
    /// RSA with SHA-384.
    RS384,
    /// ECDSA with P-384 curve.
    ES384,
}

impl SigningAlgorithm {
    /// Converts to the `jsonwebtoken` Algorithm type.
    #[must_use]
    pub fn to_jwt_algorithm(self) -> Algorithm {
        match self {
            Self::HS256 => Algorithm::HS256,
            Self::RS256 => Algorithm::RS256,
            Self::RS384 => Algorithm::RS384,
            Self::ES384 => Algorithm::ES384,
        }
    }

    /// Returns the algorithm name as used in JWK/JWT headers.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HS256 => "HS256",
            Self::RS256 => "RS256",
            Self::RS384 => "RS384",
            Self::ES384 => "ES384",
        }
    }

    /// Returns `true` if this is a shared-secret algorithm.
    #[must_use]
    pub fn is_hmac(&self) -> bool {
        matches!(self, Self::HS256)
    }

    /// Returns `true` if this is an RSA-based algorithm.
    #[must_use]
    pub fn is_rsa(&self) -> bool {
        matches!(self, Self::RS256 | Self::RS384)
    }

    /// Returns `true` if this is an EC-based algorithm.
    #[must_use]
    pub fn is_ec(&self) -> bool {
        matches!(self, Self::ES384)
    }
}

impl fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SigningAlgorithm {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HS256" => Ok(Self::HS256),
            "RS256" => Ok(Self::RS256),
            "RS384" => Ok(Self::RS384),
            "ES384" => Ok(Self::ES384),
            other => Err(KeyError::invalid_key(format!(
                "unsupported algorithm '{other}'"
            ))),
        }
    }
}

// ============================================================================
// Key Version
// ============================================================================

/// Monotonic key version, rendered as `v<N>` in token headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyVersion(u32);

impl KeyVersion {
    /// The first version issued by a fresh key ring.
    pub const INITIAL: Self = Self(1);

    /// Creates a version from its number.
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    /// Returns the numeric version.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Returns the version that follows this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for KeyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl FromStr for KeyVersion {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix('v')
            .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|digits| digits.parse().ok())
            .map(Self)
            .ok_or_else(|| KeyError::invalid_key(format!("invalid key version '{s}'")))
    }
}

impl TryFrom<String> for KeyVersion {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KeyVersion> for String {
    fn from(value: KeyVersion) -> Self {
        value.to_string()
    }
}

// ============================================================================
// JWKS Types
// ============================================================================

/// JSON Web Key Set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Jwks {
    /// The keys in this set.
    pub keys: Vec<Jwk>,
}

/// JSON Web Key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type ("RSA" or "EC").
    pub kty: String,

    /// Key ID (the key version).
    pub kid: String,

    /// Key use ("sig" for signing).
    #[serde(rename = "use")]
    pub use_: String,

    /// Algorithm.
    pub alg: String,

    // RSA-specific fields
    /// RSA modulus (base64url encoded).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,

    /// RSA exponent (base64url encoded).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,

    // EC-specific fields
    /// EC curve name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,

    /// EC x coordinate (base64url encoded).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,

    /// EC y coordinate (base64url encoded).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

// ============================================================================
// Key Material
// ============================================================================

/// Public half of an asymmetric key, kept for JWKS export.
enum PublicKeyData {
    Rsa { n: Vec<u8>, e: Vec<u8> },
    Ec { x: Vec<u8>, y: Vec<u8> },
}

/// One immutable version of signing key material.
pub struct KeyMaterial {
    version: KeyVersion,
    algorithm: SigningAlgorithm,
    /// HMAC secret or PKCS#8 DER private key, as persisted.
    secret: Vec<u8>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    public_key: Option<PublicKeyData>,
    created_at: OffsetDateTime,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("version", &self.version)
            .field("algorithm", &self.algorithm)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl KeyMaterial {
    /// Generates fresh key material for `algorithm`.
    ///
    /// # Errors
    /// Returns an error if key generation fails.
    pub fn generate(
        version: KeyVersion,
        algorithm: SigningAlgorithm,
        created_at: OffsetDateTime,
    ) -> Result<Self, KeyError> {
        match algorithm {
            SigningAlgorithm::HS256 => {
                let mut secret = [0u8; MIN_HMAC_SECRET_BYTES];
                OsRng.fill_bytes(&mut secret);
                Self::from_secret(version, &secret, created_at)
            }
            SigningAlgorithm::RS256 | SigningAlgorithm::RS384 => {
                let private_key = RsaPrivateKey::new(&mut OsRng, 2048)
                    .map_err(|e| KeyError::generation(e.to_string()))?;
                Self::from_rsa(version, algorithm, &private_key, created_at)
            }
            SigningAlgorithm::ES384 => {
                let secret_key = EcSecretKey::random(&mut OsRng);
                Self::from_ec(version, &secret_key, created_at)
            }
        }
    }

    /// Builds HS256 material from a shared secret.
    ///
    /// # Errors
    /// Returns an error if the secret is shorter than 32 bytes.
    pub fn from_secret(
        version: KeyVersion,
        secret: &[u8],
        created_at: OffsetDateTime,
    ) -> Result<Self, KeyError> {
        if secret.len() < MIN_HMAC_SECRET_BYTES {
            return Err(KeyError::invalid_key(format!(
                "HMAC secret must be at least {MIN_HMAC_SECRET_BYTES} bytes"
            )));
        }
        Ok(Self {
            version,
            algorithm: SigningAlgorithm::HS256,
            secret: secret.to_vec(),
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            public_key: None,
            created_at,
        })
    }

    /// Loads asymmetric material from a PKCS#8 (or SEC1 for EC) private key PEM.
    ///
    /// # Errors
    /// Returns an error if the PEM data is invalid or does not match the
    /// algorithm family.
    pub fn from_private_pem(
        version: KeyVersion,
        algorithm: SigningAlgorithm,
        private_pem: &str,
        created_at: OffsetDateTime,
    ) -> Result<Self, KeyError> {
        if algorithm.is_rsa() {
            let private_key = RsaPrivateKey::from_pkcs8_pem(private_pem)
                .map_err(|e| KeyError::invalid_key(e.to_string()))?;
            Self::from_rsa(version, algorithm, &private_key, created_at)
        } else if algorithm.is_ec() {
            let secret_key = EcSecretKey::from_pkcs8_pem(private_pem)
                .or_else(|_| EcSecretKey::from_sec1_pem(private_pem))
                .map_err(|e| KeyError::invalid_key(e.to_string()))?;
            Self::from_ec(version, &secret_key, created_at)
        } else {
            Err(KeyError::invalid_key(format!(
                "Algorithm {algorithm} does not use a private key file"
            )))
        }
    }

    /// Rebuilds material from its persisted form.
    ///
    /// # Errors
    /// Returns an error if the stored secret does not decode for its
    /// algorithm.
    pub fn from_stored(stored: &StoredKey) -> Result<Self, KeyError> {
        let material = match stored.algorithm {
            SigningAlgorithm::HS256 => {
                Self::from_secret(stored.version, &stored.secret, stored.created_at)?
            }
            SigningAlgorithm::RS256 | SigningAlgorithm::RS384 => {
                let private_key = RsaPrivateKey::from_pkcs8_der(&stored.secret)
                    .map_err(|e| KeyError::invalid_key(format!("{}: {e}", stored.version)))?;
                Self::from_rsa(
                    stored.version,
                    stored.algorithm,
                    &private_key,
                    stored.created_at,
                )?
            }
            SigningAlgorithm::ES384 => {
                let secret_key = EcSecretKey::from_pkcs8_der(&stored.secret)
                    .map_err(|e| KeyError::invalid_key(format!("{}: {e}", stored.version)))?;
                Self::from_ec(stored.version, &secret_key, stored.created_at)?
            }
        };
        Ok(material)
    }

    /// The persisted form of this material.
    #[must_use]
    pub fn to_stored(&self, superseded_at: Option<OffsetDateTime>) -> StoredKey {
        StoredKey {
            version: self.version,
            algorithm: self.algorithm,
            secret: self.secret.clone(),
            created_at: self.created_at,
            superseded_at,
        }
    }

    fn from_rsa(
        version: KeyVersion,
        algorithm: SigningAlgorithm,
        private_key: &RsaPrivateKey,
        created_at: OffsetDateTime,
    ) -> Result<Self, KeyError> {
        let public_key = private_key.to_public_key();
        let n = public_key.n().to_bytes_be();
        let e = public_key.e().to_bytes_be();

        let private_der = private_key
            .to_pkcs8_der()
            .map_err(|e| KeyError::invalid_key(e.to_string()))?;
        let private_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| KeyError::invalid_key(e.to_string()))?;
        let encoding_key = EncodingKey::from_rsa_pem(private_pem.as_bytes())
            .map_err(|e| KeyError::invalid_key(e.to_string()))?;

        let public_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| KeyError::invalid_key(e.to_string()))?;
        let decoding_key = DecodingKey::from_rsa_pem(public_pem.as_bytes())
            .map_err(|e| KeyError::invalid_key(e.to_string()))?;

        Ok(Self {
            version,
            algorithm,
            secret: private_der.as_bytes().to_vec(),
            encoding_key,
            decoding_key,
            public_key: Some(PublicKeyData::Rsa { n, e }),
            created_at,
        })
    }

    fn from_ec(
        version: KeyVersion,
        secret_key: &EcSecretKey,
        created_at: OffsetDateTime,
    ) -> Result<Self, KeyError> {
        let signing_key = EcSigningKey::from(secret_key);
        let point = signing_key.verifying_key().to_encoded_point(false);
        let x = point
            .x()
            .ok_or_else(|| KeyError::invalid_key("Missing x coordinate"))?;
        let y = point
            .y()
            .ok_or_else(|| KeyError::invalid_key("Missing y coordinate"))?;

        let private_der = secret_key
            .to_pkcs8_der()
            .map_err(|e| KeyError::invalid_key(e.to_string()))?;
        // jsonwebtoken wants PKCS#8 for EC signing keys
        let private_pem = secret_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| KeyError::invalid_key(e.to_string()))?;
        let encoding_key = EncodingKey::from_ec_pem(private_pem.as_bytes())
            .map_err(|e| KeyError::invalid_key(e.to_string()))?;

        let x_b64 = URL_SAFE_NO_PAD.encode(x.as_slice());
        let y_b64 = URL_SAFE_NO_PAD.encode(y.as_slice());
        let decoding_key = DecodingKey::from_ec_components(&x_b64, &y_b64)
            .map_err(|e| KeyError::invalid_key(e.to_string()))?;

        Ok(Self {
            version,
            algorithm: SigningAlgorithm::ES384,
            secret: private_der.as_bytes().to_vec(),
            encoding_key,
            decoding_key,
            public_key: Some(PublicKeyData::Ec {
                x: x.to_vec(),
                y: y.to_vec(),
            }),
            created_at,
        })
    }

    /// The version this material was issued under.
    #[must_use]
    pub fn version(&self) -> KeyVersion {
        self.version
    }

    /// The algorithm bound to this version.
    #[must_use]
    pub fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }

    /// When the material was created.
    #[must_use]
    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub(crate) fn encoding_key(&self) -> &EncodingKey {
        &self.encoding_key
    }

    pub(crate) fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }

    /// Exports the public key as a JWK. Shared-secret material has no
    /// public half and yields `None`.
    #[must_use]
    pub fn to_jwk(&self) -> Option<Jwk> {
        let jwk = match self.public_key.as_ref()? {
            PublicKeyData::Rsa { n, e } => Jwk {
                kty: "RSA".to_string(),
                kid: self.version.to_string(),
                use_: "sig".to_string(),
                alg: self.algorithm.as_str().to_string(),
                n: Some(URL_SAFE_NO_PAD.encode(n)),
                e: Some(URL_SAFE_NO_PAD.encode(e)),
                crv: None,
                x: None,
                y: None,
            },
            PublicKeyData::Ec { x, y } => Jwk {
                kty: "EC".to_string(),
                kid: self.version.to_string(),
                use_: "sig".to_string(),
                alg: self.algorithm.as_str().to_string(),
                n: None,
                e: None,
                crv: Some("P-384".to_string()),
                x: Some(URL_SAFE_NO_PAD.encode(x)),
                y: Some(URL_SAFE_NO_PAD.encode(y)),
            },
        };
        Some(jwk)
    }
}

// ============================================================================
// Key Ring
// ============================================================================

struct RingEntry {
    material: Arc<KeyMaterial>,
    superseded_at: Option<OffsetDateTime>,
}

struct RingState {
    current: Arc<KeyMaterial>,
    entries: BTreeMap<KeyVersion, RingEntry>,
}

/// The set of key versions the process can sign and verify with.
///
/// Readers take a shared lock only long enough to clone an `Arc`. Rotation
/// generates the new key outside the state lock so verification is never
/// blocked behind RSA key generation.
pub struct KeyRing {
    algorithm: SigningAlgorithm,
    state: RwLock<RingState>,
    rotation: Mutex<()>,
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("KeyRing")
            .field("algorithm", &self.algorithm)
            .field("current", &state.current.version)
            .field("versions", &state.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl KeyRing {
    /// Creates a ring whose current version is `initial`.
    #[must_use]
    pub fn new(initial: KeyMaterial) -> Self {
        let algorithm = initial.algorithm;
        let current = Arc::new(initial);
        let mut entries = BTreeMap::new();
        entries.insert(
            current.version,
            RingEntry {
                material: Arc::clone(&current),
                superseded_at: None,
            },
        );
        Self {
            algorithm,
            state: RwLock::new(RingState { current, entries }),
            rotation: Mutex::new(()),
        }
    }

    /// Rebuilds a ring from persisted versions. The highest version becomes
    /// current; `algorithm` is the one future rotations generate.
    ///
    /// # Errors
    /// Returns an error if `stored` is empty or a version fails to decode.
    pub fn restore(algorithm: SigningAlgorithm, stored: &[StoredKey]) -> Result<Self, KeyError> {
        let mut ordered: Vec<&StoredKey> = stored.iter().collect();
        ordered.sort_by_key(|key| key.version);
        let mut entries = BTreeMap::new();
        for (i, key) in ordered.iter().enumerate() {
            // A version with a successor was superseded no later than the
            // successor's creation, even if that write never landed.
            let successor = ordered.get(i + 1).map(|next| next.created_at);
            entries.insert(
                key.version,
                RingEntry {
                    material: Arc::new(KeyMaterial::from_stored(key)?),
                    superseded_at: key.superseded_at.or(successor),
                },
            );
        }
        let current = entries
            .values()
            .next_back()
            .map(|entry| Arc::clone(&entry.material))
            .ok_or_else(|| KeyError::invalid_key("no stored key versions"))?;
        Ok(Self {
            algorithm,
            state: RwLock::new(RingState { current, entries }),
            rotation: Mutex::new(()),
        })
    }

    /// Creates a ring with freshly generated material.
    ///
    /// # Errors
    /// Returns an error if key generation fails.
    pub fn generate(algorithm: SigningAlgorithm, now: OffsetDateTime) -> Result<Self, KeyError> {
        KeyMaterial::generate(KeyVersion::INITIAL, algorithm, now).map(Self::new)
    }

    /// Builds the initial ring from configuration: a configured secret or
    /// PEM file when present, generated material otherwise.
    ///
    /// # Errors
    /// Returns an error if the configured key cannot be read or parsed.
    pub fn from_config(config: &SigningConfig, now: OffsetDateTime) -> Result<Self, KeyError> {
        let algorithm = config
            .algorithm()
            .map_err(|e| KeyError::invalid_key(e.to_string()))?;
        let secret = config
            .secret_bytes()
            .map_err(|e| KeyError::invalid_key(e.to_string()))?;

        let material = match (secret, &config.private_key_path) {
            (Some(secret), _) if algorithm.is_hmac() => {
                KeyMaterial::from_secret(KeyVersion::INITIAL, &secret, now)?
            }
            (_, Some(path)) if !algorithm.is_hmac() => {
                let pem = std::fs::read_to_string(path).map_err(|source| KeyError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                KeyMaterial::from_private_pem(KeyVersion::INITIAL, algorithm, &pem, now)?
            }
            _ => {
                tracing::warn!(
                    algorithm = %algorithm,
                    "No signing key configured; generated a new key"
                );
                KeyMaterial::generate(KeyVersion::INITIAL, algorithm, now)?
            }
        };
        Ok(Self::new(material))
    }

    /// The algorithm every version in this ring uses.
    #[must_use]
    pub fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }

    /// The version new tokens are signed with.
    #[must_use]
    pub fn current_version(&self) -> KeyVersion {
        self.state.read().current.version
    }

    /// The material new tokens are signed with.
    #[must_use]
    pub fn current(&self) -> Arc<KeyMaterial> {
        Arc::clone(&self.state.read().current)
    }

    /// Looks up any retained version.
    #[must_use]
    pub fn get(&self, version: KeyVersion) -> Option<Arc<KeyMaterial>> {
        self.state
            .read()
            .entries
            .get(&version)
            .map(|entry| Arc::clone(&entry.material))
    }

    /// All retained versions, oldest first.
    #[must_use]
    pub fn versions(&self) -> Vec<KeyVersion> {
        self.state.read().entries.keys().copied().collect()
    }

    /// The highest version the ring knows about.
    #[must_use]
    pub fn latest_version(&self) -> KeyVersion {
        let state = self.state.read();
        state
            .entries
            .keys()
            .next_back()
            .copied()
            .unwrap_or(state.current.version)
    }

    /// The persisted form of every retained version.
    #[must_use]
    pub fn to_stored(&self) -> Vec<StoredKey> {
        self.state
            .read()
            .entries
            .values()
            .map(|entry| entry.material.to_stored(entry.superseded_at))
            .collect()
    }

    /// Generates material for the version after [`latest_version`](Self::latest_version)
    /// without installing it.
    ///
    /// # Errors
    /// Returns an error if key generation fails.
    pub fn prepare_next(&self, now: OffsetDateTime) -> Result<KeyMaterial, KeyError> {
        KeyMaterial::generate(self.latest_version().next(), self.algorithm, now)
    }

    /// Makes `material` current and marks the previous current version
    /// superseded at `now`. Returns the superseded version.
    pub fn install(&self, material: KeyMaterial, now: OffsetDateTime) -> KeyVersion {
        let material = Arc::new(material);
        let next = material.version;
        let mut state = self.state.write();
        let previous = state.current.version;
        if let Some(entry) = state.entries.get_mut(&previous) {
            entry.superseded_at.get_or_insert(now);
        }
        state.entries.insert(
            next,
            RingEntry {
                material: Arc::clone(&material),
                superseded_at: None,
            },
        );
        state.current = material;
        tracing::info!(previous = %previous, current = %next, "Signing key rotated");
        previous
    }

    /// Generates a new version and makes it current. The previous version
    /// stays available for verification.
    ///
    /// # Errors
    /// Returns an error if key generation fails.
    pub fn rotate(&self, now: OffsetDateTime) -> Result<KeyVersion, KeyError> {
        let _rotating = self.rotation.lock();
        let material = self.prepare_next(now)?;
        let next = material.version;
        self.install(material, now);
        Ok(next)
    }

    /// Merges versions written by another process. Unknown versions are
    /// added, supersession times are copied, and the highest version becomes
    /// current. Returns how many versions were added.
    ///
    /// # Errors
    /// Returns an error if a new version fails to decode; nothing is merged
    /// in that case.
    pub fn absorb(&self, stored: &[StoredKey]) -> Result<usize, KeyError> {
        let known = self.versions();
        let mut fresh = Vec::new();
        for key in stored.iter().filter(|k| !known.contains(&k.version)) {
            fresh.push((Arc::new(KeyMaterial::from_stored(key)?), key.superseded_at));
        }

        let mut state = self.state.write();
        let added = fresh.len();
        for (material, superseded_at) in fresh {
            state.entries.insert(
                material.version,
                RingEntry {
                    material,
                    superseded_at,
                },
            );
        }
        for key in stored {
            let Some(at) = key.superseded_at else {
                continue;
            };
            if let Some(entry) = state.entries.get_mut(&key.version) {
                entry.superseded_at.get_or_insert(at);
            }
        }
        let latest = state
            .entries
            .values()
            .next_back()
            .map(|entry| Arc::clone(&entry.material));
        if let Some(latest) = latest
            && latest.version > state.current.version
        {
            let previous = state.current.version;
            if let Some(entry) = state.entries.get_mut(&previous) {
                entry.superseded_at.get_or_insert(latest.created_at);
            }
            tracing::info!(
                previous = %previous,
                current = %latest.version,
                "Adopted signing key from storage"
            );
            state.current = latest;
        }
        Ok(added)
    }

    /// Drops superseded versions whose tokens have all expired, i.e. those
    /// superseded at or before `now - retention`. Returns the dropped
    /// versions.
    pub fn retire_expired(&self, now: OffsetDateTime, retention: Duration) -> Vec<KeyVersion> {
        let cutoff = now - retention;
        let mut state = self.state.write();
        let current = state.current.version;
        let retired: Vec<KeyVersion> = state
            .entries
            .iter()
            .filter(|(version, entry)| {
                **version != current && entry.superseded_at.is_some_and(|at| at <= cutoff)
            })
            .map(|(version, _)| *version)
            .collect();
        for version in &retired {
            state.entries.remove(version);
        }
        if !retired.is_empty() {
            tracing::debug!(count = retired.len(), "Retired superseded signing keys");
        }
        retired
    }

    /// Public keys of all retained asymmetric versions.
    #[must_use]
    pub fn jwks(&self) -> Jwks {
        let state = self.state.read();
        Jwks {
            keys: state
                .entries
                .values()
                .filter_map(|entry| entry.material.to_jwk())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    #[test]
    fn test_key_version_display_and_parse() {
        assert_eq!(KeyVersion::new(3).to_string(), "v3");
        assert_eq!("v12".parse::<KeyVersion>().unwrap(), KeyVersion::new(12));
        assert!("12".parse::<KeyVersion>().is_err());
        assert!("v".parse::<KeyVersion>().is_err());
        assert!("v-1".parse::<KeyVersion>().is_err());
        assert!("v1x".parse::<KeyVersion>().is_err());
    }

    #[test]
    fn test_key_version_serde_as_string() {
        let json = serde_json::to_string(&KeyVersion::new(2)).unwrap();
        assert_eq!(json, "\"v2\"");
        let parsed: KeyVersion = serde_json::from_str("\"v5\"").unwrap();
        assert_eq!(parsed, KeyVersion::new(5));
        assert!(serde_json::from_str::<KeyVersion>("\"five\"").is_err());
    }

    #[test]
    fn test_algorithm_parse() {
        assert_eq!(
            "ES384".parse::<SigningAlgorithm>().unwrap(),
            SigningAlgorithm::ES384
        );
        assert!("none".parse::<SigningAlgorithm>().is_err());
        assert!("hs256".parse::<SigningAlgorithm>().is_err());
    }

    #[test]
    fn test_short_secret_rejected() {
        let err = KeyMaterial::from_secret(KeyVersion::INITIAL, b"short", now()).unwrap_err();
        assert!(matches!(err, KeyError::InvalidKey { .. }));
    }

    #[test]
    fn test_hmac_has_no_jwk() {
        let ring = KeyRing::generate(SigningAlgorithm::HS256, now()).unwrap();
        assert!(ring.current().to_jwk().is_none());
        assert!(ring.jwks().keys.is_empty());
    }

    #[test]
    fn test_ec_jwk_export() {
        let ring = KeyRing::generate(SigningAlgorithm::ES384, now()).unwrap();
        let jwk = ring.current().to_jwk().unwrap();
        assert_eq!(jwk.kty, "EC");
        assert_eq!(jwk.kid, "v1");
        assert_eq!(jwk.alg, "ES384");
        assert_eq!(jwk.crv.as_deref(), Some("P-384"));
        assert!(jwk.x.is_some() && jwk.y.is_some());
    }

    #[test]
    fn test_rsa_jwk_export() {
        let material =
            KeyMaterial::generate(KeyVersion::INITIAL, SigningAlgorithm::RS256, now()).unwrap();
        let jwk = material.to_jwk().unwrap();
        assert_eq!(jwk.kty, "RSA");
        assert_eq!(jwk.alg, "RS256");
        assert_eq!(jwk.e.as_deref(), Some("AQAB"));

        let json = serde_json::to_value(&jwk).unwrap();
        assert_eq!(json["use"], "sig");
        assert!(json.get("crv").is_none());
    }

    #[test]
    fn test_rotation_keeps_old_versions() {
        let ring = KeyRing::generate(SigningAlgorithm::HS256, now()).unwrap();
        assert_eq!(ring.current_version(), KeyVersion::new(1));

        let v2 = ring.rotate(now()).unwrap();
        assert_eq!(v2, KeyVersion::new(2));
        assert_eq!(ring.current_version(), v2);
        assert!(ring.get(KeyVersion::new(1)).is_some());
        assert_eq!(ring.versions(), vec![KeyVersion::new(1), KeyVersion::new(2)]);
    }

    #[test]
    fn test_retire_respects_retention() {
        let start = now();
        let ring = KeyRing::generate(SigningAlgorithm::HS256, start).unwrap();
        ring.rotate(start).unwrap();

        let retention = Duration::days(7);
        assert!(ring.retire_expired(start + Duration::days(6), retention).is_empty());
        assert!(ring.get(KeyVersion::new(1)).is_some());

        let retired = ring.retire_expired(start + Duration::days(7), retention);
        assert_eq!(retired, vec![KeyVersion::new(1)]);
        assert!(ring.get(KeyVersion::new(1)).is_none());
        assert!(ring.get(KeyVersion::new(2)).is_some());
    }

    #[test]
    fn test_current_version_never_retired() {
        let ring = KeyRing::generate(SigningAlgorithm::HS256, now()).unwrap();
        let retired = ring.retire_expired(now() + Duration::days(365), Duration::ZERO);
        assert!(retired.is_empty());
        assert_eq!(ring.versions(), vec![KeyVersion::INITIAL]);
    }

    #[test]
    fn test_from_config_with_secret() {
        let config = SigningConfig {
            secret: Some("0f".repeat(32)),
            ..SigningConfig::default()
        };
        let ring = KeyRing::from_config(&config, now()).unwrap();
        assert_eq!(ring.algorithm(), SigningAlgorithm::HS256);
    }

    #[test]
    fn test_from_config_with_pem_file() {
        let secret_key = EcSecretKey::random(&mut OsRng);
        let pem = secret_key.to_pkcs8_pem(LineEnding::LF).unwrap();
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), pem.as_bytes()).unwrap();

        let config = SigningConfig {
            algorithm: "ES384".to_string(),
            secret: None,
            private_key_path: Some(file.path().to_path_buf()),
        };
        let ring = KeyRing::from_config(&config, now()).unwrap();
        assert_eq!(ring.algorithm(), SigningAlgorithm::ES384);
        assert_eq!(ring.jwks().keys.len(), 1);
    }

    #[test]
    fn test_from_config_missing_file() {
        let config = SigningConfig {
            algorithm: "RS256".to_string(),
            secret: None,
            private_key_path: Some("/nonexistent/signing.pem".into()),
        };
        let err = KeyRing::from_config(&config, now()).unwrap_err();
        assert!(matches!(err, KeyError::Io { .. }));
    }

    #[test]
    fn test_restore_from_stored_versions() {
        let ring = KeyRing::generate(SigningAlgorithm::ES384, now()).unwrap();
        ring.rotate(now()).unwrap();
        let stored = ring.to_stored();
        assert_eq!(stored.len(), 2);
        assert!(stored[0].superseded_at.is_some());
        assert!(stored[1].superseded_at.is_none());

        let restored = KeyRing::restore(SigningAlgorithm::ES384, &stored).unwrap();
        assert_eq!(restored.current_version(), KeyVersion::new(2));
        assert_eq!(restored.versions(), ring.versions());
        let original = ring.get(KeyVersion::new(1)).unwrap().to_jwk().unwrap();
        let reloaded = restored.get(KeyVersion::new(1)).unwrap().to_jwk().unwrap();
        assert_eq!(original.x, reloaded.x);
        assert_eq!(original.y, reloaded.y);
    }

    #[test]
    fn test_rsa_material_survives_storage() {
        let material =
            KeyMaterial::generate(KeyVersion::new(4), SigningAlgorithm::RS384, now()).unwrap();
        let reloaded = KeyMaterial::from_stored(&material.to_stored(None)).unwrap();
        assert_eq!(reloaded.version(), KeyVersion::new(4));
        assert_eq!(reloaded.algorithm(), SigningAlgorithm::RS384);
        assert_eq!(reloaded.to_jwk().unwrap().n, material.to_jwk().unwrap().n);
    }

    #[test]
    fn test_restore_requires_a_version() {
        let err = KeyRing::restore(SigningAlgorithm::HS256, &[]).unwrap_err();
        assert!(matches!(err, KeyError::InvalidKey { .. }));
    }

    #[test]
    fn test_absorb_adopts_newer_versions() {
        let ring = KeyRing::generate(SigningAlgorithm::HS256, now()).unwrap();
        let peer = KeyRing::restore(SigningAlgorithm::HS256, &ring.to_stored()).unwrap();

        ring.rotate(now()).unwrap();
        assert_eq!(peer.absorb(&ring.to_stored()).unwrap(), 1);
        assert_eq!(peer.current_version(), KeyVersion::new(2));
        assert_eq!(peer.absorb(&ring.to_stored()).unwrap(), 0);

        let mut corrupt = ring.current().to_stored(None);
        corrupt.version = KeyVersion::new(3);
        corrupt.secret.truncate(4);
        assert!(peer.absorb(&[corrupt]).is_err());
        assert_eq!(peer.versions().len(), 2);
    }

    #[test]
    fn test_stored_key_debug_hides_secret() {
        let ring = KeyRing::generate(SigningAlgorithm::HS256, now()).unwrap();
        let debug = format!("{:?}", ring.current().to_stored(None));
        assert!(debug.contains("<redacted>"));
    }
}
