//! Secondary integrity witness over pre-encryption bytes.
//!
//! The digest is not secret; it is compared in constant time anyway so that
//! the verification path has a single, uniform shape.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Size of a SHA-256 digest in bytes.
pub const DIGEST_SIZE: usize = 32;

/// SHA-256 of `bytes`.
pub fn digest(bytes: &[u8]) -> [u8; DIGEST_SIZE] {
    Sha256::digest(bytes).into()
}

/// Recompute the digest of `plaintext` and compare it with `expected`.
pub fn verify(plaintext: &[u8], expected: &[u8; DIGEST_SIZE]) -> bool {
    let actual = digest(plaintext);
    bool::from(actual.ct_eq(expected))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_matches_known_vector() {
        // SHA-256("abc")
        assert_eq!(
            hex::encode(digest(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_verify_accepts_matching_digest() {
        let expected = digest(b"bid document");
        assert!(verify(b"bid document", &expected));
    }

    #[test]
    fn test_verify_rejects_any_changed_byte() {
        let expected = digest(b"bid document");
        assert!(!verify(b"bid documenT", &expected));
        assert!(!verify(b"", &expected));

        let mut wrong = expected;
        wrong[31] ^= 0x01;
        assert!(!verify(b"bid document", &wrong));
    }
}
