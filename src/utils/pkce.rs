//! PKCE (Proof Key for Code Exchange) verification, RFC 7636.
//!
//! Only the `S256` transform is supported. `plain` defeats the purpose of
//! the binding and is rejected outright.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use sha2::{Digest, Sha256};

use crate::utils::secret::constant_time_compare;

/// Minimum length for code_verifier as per RFC 7636.
pub const CODE_VERIFIER_MIN_LENGTH: usize = 43;

/// Maximum length for code_verifier as per RFC 7636.
pub const CODE_VERIFIER_MAX_LENGTH: usize = 128;

/// The only accepted code challenge method.
pub const PKCE_METHOD_S256: &str = "S256";

/// Verify a code_verifier against a stored S256 code_challenge.
///
/// Computes `BASE64URL(SHA256(verifier))` and compares it to the stored
/// challenge in constant time.
pub fn verify_s256(code_verifier: &str, code_challenge: &str) -> bool {
    let computed = compute_s256_challenge(code_verifier);
    constant_time_compare(&computed, code_challenge)
}

/// Compute the S256 challenge for a verifier: `BASE64URL(SHA256(verifier))`.
pub fn compute_s256_challenge(code_verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code_verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Validate code_verifier format according to RFC 7636.
///
/// 43-128 characters from the unreserved set:
/// `[A-Z] / [a-z] / [0-9] / "-" / "." / "_" / "~"`.
pub fn validate_code_verifier(verifier: &str) -> bool {
    let len = verifier.len();
    if !(CODE_VERIFIER_MIN_LENGTH..=CODE_VERIFIER_MAX_LENGTH).contains(&len) {
        return false;
    }

    verifier
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' || c == '~')
}

/// Validate code_challenge format.
///
/// An S256 challenge is the base64url encoding of a 32-byte digest:
/// exactly 43 base64url characters.
pub fn validate_code_challenge(challenge: &str) -> bool {
    challenge.len() == 43
        && challenge
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // Known test vector from RFC 7636 Appendix B.
    const RFC_VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
    const RFC_CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

    #[test]
    fn verify_s256_rfc_vector() {
        assert!(verify_s256(RFC_VERIFIER, RFC_CHALLENGE));
    }

    #[test]
    fn verify_s256_wrong_verifier() {
        let verifier = "wrong_verifier_that_is_long_enough_to_pass_length_check";
        assert!(!verify_s256(verifier, RFC_CHALLENGE));
    }

    #[test]
    fn compute_s256_challenge_rfc_vector() {
        assert_eq!(compute_s256_challenge(RFC_VERIFIER), RFC_CHALLENGE);
    }

    #[test]
    fn validate_code_verifier_length_bounds() {
        assert!(validate_code_verifier(&"a".repeat(43)));
        assert!(validate_code_verifier(&"a".repeat(128)));
        assert!(!validate_code_verifier(&"a".repeat(42)));
        assert!(!validate_code_verifier(&"a".repeat(129)));
    }

    #[test]
    fn validate_code_verifier_charset() {
        assert!(validate_code_verifier(
            "abcABC123-._~abcABC123-._~abcABC123-._~abcde"
        ));
        // Space, plus, slash and equals are outside the unreserved set.
        assert!(!validate_code_verifier(
            "abcdefghijklmnopqrstuvwxyz0123456789 abcdef"
        ));
        assert!(!validate_code_verifier(
            "abcdefghijklmnopqrstuvwxyz0123456789+abcdef"
        ));
        assert!(!validate_code_verifier(
            "abcdefghijklmnopqrstuvwxyz0123456789/abcdef"
        ));
        assert!(!validate_code_verifier(
            "abcdefghijklmnopqrstuvwxyz0123456789=abcdef"
        ));
    }

    #[test]
    fn validate_code_challenge_shape() {
        assert!(validate_code_challenge(RFC_CHALLENGE));
        assert!(!validate_code_challenge(&RFC_CHALLENGE[..42]));
        assert!(!validate_code_challenge(
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw+cM"
        ));
    }

    proptest! {
        // hash(verifier) == stored_challenge ⇔ verification succeeds.
        #[test]
        fn s256_roundtrip_law(verifier in "[A-Za-z0-9._~-]{43,128}") {
            let challenge = compute_s256_challenge(&verifier);
            prop_assert!(validate_code_verifier(&verifier));
            prop_assert!(validate_code_challenge(&challenge));
            prop_assert!(verify_s256(&verifier, &challenge));
        }

        #[test]
        fn s256_rejects_other_verifiers(
            verifier in "[A-Za-z0-9._~-]{43,128}",
            other in "[A-Za-z0-9._~-]{43,128}",
        ) {
            prop_assume!(verifier != other);
            let challenge = compute_s256_challenge(&verifier);
            prop_assert!(!verify_s256(&other, &challenge));
        }
    }
}
