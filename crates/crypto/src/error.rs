//! Error types for cryptographic operations.

use thiserror::Error;

/// Errors that can occur while sealing or unsealing a bid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// The AEAD tag did not verify: wrong key, wrong associated data or
    /// modified ciphertext.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// The tag verified but the recovered bytes do not match the stored digest.
    #[error("Integrity violation: plaintext digest mismatch")]
    IntegrityViolation,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Key derivation failed")]
    KeyDerivationFailed,
}

impl CryptoError {
    /// Whether the error indicates a tampered or undecryptable payload.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            CryptoError::AuthenticationFailed | CryptoError::IntegrityViolation
        )
    }
}
