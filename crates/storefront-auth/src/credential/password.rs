//! Password hashing.
//!
//! Passwords are hashed with Argon2id (default parameters, random 16-byte
//! salt from `OsRng`) and stored in PHC string format alongside the salt.
//! Argon2 is deliberately slow, so the async wrappers move the work onto the
//! blocking thread pool.

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};

use crate::AuthResult;
use crate::error::AuthError;

/// Output of hashing a password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedPassword {
    /// PHC-formatted Argon2id hash.
    pub hash: String,
    /// Salt used for the hash, as embedded in the PHC string.
    pub salt: String,
}

/// Hash a password for storage.
///
/// # Errors
///
/// Returns `argon2::password_hash::Error` if hashing fails (rare).
pub fn hash_password(password: &str) -> Result<HashedPassword, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
    Ok(HashedPassword {
        hash: hash.to_string(),
        salt: salt.as_str().to_string(),
    })
}

/// Verify a password against a stored hash and salt.
///
/// The salt embedded in the PHC string must match the stored salt; a
/// mismatch means the record was tampered with or corrupted.
///
/// # Errors
///
/// Returns [`AuthError::Integrity`] if the stored hash cannot be parsed or
/// its salt differs from the stored salt.
pub fn verify_password(password: &str, hash: &str, salt: &str) -> AuthResult<bool> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| AuthError::integrity(format!("unreadable password hash: {e}")))?;
    if parsed.salt.map(|s| s.as_str()) != Some(salt) {
        return Err(AuthError::integrity("password hash salt mismatch"));
    }
    // verify_password compares digests in constant time
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Hashes on the blocking pool.
pub async fn hash_password_blocking(password: String) -> AuthResult<HashedPassword> {
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| AuthError::internal(format!("password hashing task failed: {e}")))?
        .map_err(|e| AuthError::internal(format!("password hashing failed: {e}")))
}

/// Verifies on the blocking pool.
pub async fn verify_password_blocking(
    password: String,
    hash: String,
    salt: String,
) -> AuthResult<bool> {
    tokio::task::spawn_blocking(move || verify_password(&password, &hash, &salt))
        .await
        .map_err(|e| AuthError::internal(format!("password verification task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hashed = hash_password("P@ss1234").unwrap();
        assert!(hashed.hash.starts_with("$argon2id$"));
        assert!(hashed.hash.contains(&hashed.salt));

        assert!(verify_password("P@ss1234", &hashed.hash, &hashed.salt).unwrap());
        assert!(!verify_password("P@ss1235", &hashed.hash, &hashed.salt).unwrap());
        assert!(!verify_password("", &hashed.hash, &hashed.salt).unwrap());
    }

    #[test]
    fn test_same_password_different_salts() {
        let a = hash_password("correct horse").unwrap();
        let b = hash_password("correct horse").unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn test_salt_mismatch_is_integrity_error() {
        let a = hash_password("P@ss1234").unwrap();
        let b = hash_password("P@ss1234").unwrap();
        let err = verify_password("P@ss1234", &a.hash, &b.salt).unwrap_err();
        assert!(matches!(err, AuthError::Integrity { .. }));
    }

    #[test]
    fn test_garbage_hash_is_integrity_error() {
        let err = verify_password("x", "not-a-phc-string", "salt").unwrap_err();
        assert!(matches!(err, AuthError::Integrity { .. }));
    }

    #[tokio::test]
    async fn test_blocking_wrappers() {
        let hashed = hash_password_blocking("P@ss1234".to_string()).await.unwrap();
        let ok = verify_password_blocking("P@ss1234".to_string(), hashed.hash, hashed.salt)
            .await
            .unwrap();
        assert!(ok);
    }
}
