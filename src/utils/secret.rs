//! Opaque token generation and storage hashing.
//!
//! Opaque artifacts (authorization codes, refresh tokens, session tokens)
//! carry 256 bits of entropy and no internal structure. The database never
//! sees the plaintext: the storage column is the base64url-encoded SHA-256
//! of the token, and the digest is the lookup key.
//!
//! Client secrets are different: they are low-entropy, long-lived
//! credentials and therefore go through bcrypt like a password.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::CryptoError;

/// Bcrypt cost factor for hashing client secrets.
pub const BCRYPT_COST: u32 = 12;

/// Entropy carried by a generated opaque token, in bytes.
pub const TOKEN_ENTROPY_BYTES: usize = 32;

/// Generate a cryptographically secure opaque token.
///
/// 256 bits from the OS RNG, rendered URL-safe (43 characters, no padding).
///
/// # Errors
/// `CryptoError::Weak` if the system RNG is unavailable.
pub fn generate_opaque_token() -> Result<String, CryptoError> {
    let mut bytes = [0u8; TOKEN_ENTROPY_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|_| CryptoError::Weak)?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Hash an opaque token for storage.
///
/// SHA-256 rather than bcrypt: the input is already high-entropy random
/// data, and lookups need to be indexable by the digest.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Hash a client secret with bcrypt.
pub fn hash_client_secret(secret: &str) -> Result<String, CryptoError> {
    bcrypt::hash(secret, BCRYPT_COST).map_err(|_| CryptoError::Invalid)
}

/// Verify a client secret against its bcrypt hash.
///
/// bcrypt performs the comparison internally in constant time.
pub fn verify_client_secret(secret: &str, hash: &str) -> Result<bool, CryptoError> {
    bcrypt::verify(secret, hash).map_err(|_| CryptoError::Invalid)
}

/// Constant-time string comparison; running time depends only on length.
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_43_url_safe_chars() {
        let token = generate_opaque_token().unwrap();
        assert_eq!(token.len(), 43);
        for c in token.chars() {
            assert!(
                c.is_ascii_alphanumeric() || c == '-' || c == '_',
                "token contains invalid character: {}",
                c
            );
        }
    }

    #[test]
    fn generated_tokens_are_unique() {
        assert_ne!(
            generate_opaque_token().unwrap(),
            generate_opaque_token().unwrap()
        );
    }

    #[test]
    fn token_hash_is_deterministic() {
        let token = "test_token_12345";
        assert_eq!(hash_token(token), hash_token(token));
    }

    #[test]
    fn token_hash_is_not_the_plaintext() {
        let token = generate_opaque_token().unwrap();
        assert_ne!(token, hash_token(&token));
    }

    #[test]
    fn token_hash_is_43_base64url_chars() {
        // SHA-256 digest is 32 bytes = 43 unpadded base64 characters.
        let hash = hash_token("anything");
        assert_eq!(hash.len(), 43);
    }

    #[test]
    fn client_secret_roundtrip() {
        let hash = bcrypt::hash("s3cret-value", 4).unwrap();

        assert!(verify_client_secret("s3cret-value", &hash).unwrap());
        assert!(!verify_client_secret("wrong-value", &hash).unwrap());
    }

    #[test]
    fn constant_time_compare_behaviour() {
        assert!(constant_time_compare("hello", "hello"));
        assert!(constant_time_compare("", ""));
        assert!(!constant_time_compare("hello", "world"));
        assert!(!constant_time_compare("hello", "hell"));
    }
}
