use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};

use crate::error::CryptoError;

/// Hash a password using the Argon2id algorithm.
///
/// # Arguments
/// * `password` - The plain text password to hash
///
/// # Returns
/// * `Ok(String)` - The hashed password as a PHC string
/// * `Err(CryptoError)` - If hashing fails
pub fn hash_password(password: &str) -> Result<String, CryptoError> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| CryptoError::Weak)
}

/// Verify a password against a stored hash.
///
/// The comparison inside the argon2 crate is constant-time.
///
/// # Arguments
/// * `password` - The plain text password to verify
/// * `hash` - The stored password hash (PHC string format)
///
/// # Returns
/// * `Ok(true)` - If the password matches
/// * `Ok(false)` - If the password does not match
/// * `Err(CryptoError::Invalid)` - If the stored hash is malformed
pub fn verify_password(password: &str, hash: &str) -> Result<bool, CryptoError> {
    let parsed_hash = PasswordHash::new(hash).map_err(|_| CryptoError::Invalid)?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// Burn the same amount of work as a real verification.
///
/// Called when the username does not exist, so that a login probe cannot
/// distinguish "unknown user" from "wrong password" by timing.
pub fn dummy_verify(password: &str) {
    let _ = hash_password(password);
}
