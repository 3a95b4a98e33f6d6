//! AES-256-GCM sealing of bid documents.
//!
//! # Sealing
//!
//! 1. Encode the bid document to its canonical bytes (borsh)
//! 2. Compute digest = SHA-256(bytes)
//! 3. Sample a random 96-bit nonce
//! 4. Encrypt bytes with AES-256-GCM under the tender key, binding the
//!    submission's associated data
//! 5. Split the 128-bit tag from the ciphertext
//!
//! # Unsealing
//!
//! 1. Decrypt and verify the tag; any failure returns no plaintext
//! 2. Recompute SHA-256 over the recovered bytes and compare against the
//!    stored digest in constant time
//! 3. Decode the bid document

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::{CryptoRng, RngCore};
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

use tender_types::{Algorithm, BidPayload, EncryptedPayload, Timestamp};

use crate::error::CryptoError;
use crate::integrity;
use crate::key::TenderKey;

/// Size of the AES-GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Size of the AES-GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Seal a bid document under the tender key.
pub fn seal<R: RngCore + CryptoRng>(
    payload: &BidPayload,
    key: &TenderKey,
    aad: &[u8],
    sealed_at: Timestamp,
    rng: &mut R,
) -> Result<EncryptedPayload, CryptoError> {
    let bytes = Zeroizing::new(
        borsh::to_vec(payload).map_err(|e| CryptoError::Serialization(e.to_string()))?,
    );
    seal_bytes(&bytes, key, aad, sealed_at, rng)
}

/// Seal raw canonical bytes under the tender key.
pub fn seal_bytes<R: RngCore + CryptoRng>(
    plaintext: &[u8],
    key: &TenderKey,
    aad: &[u8],
    sealed_at: Timestamp,
    rng: &mut R,
) -> Result<EncryptedPayload, CryptoError> {
    let plaintext_digest = integrity::digest(plaintext);

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rng.fill_bytes(&mut nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|e| {
        CryptoError::EncryptionFailed(format!("Failed to create cipher: {}", e))
    })?;

    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext_with_tag = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(format!("AES-GCM encryption failed: {}", e)))?;

    // Split ciphertext and tag
    let tag_start = ciphertext_with_tag.len() - TAG_SIZE;
    let ciphertext = ciphertext_with_tag[..tag_start].to_vec();
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&ciphertext_with_tag[tag_start..]);

    debug!(
        ciphertext_len = ciphertext.len(),
        digest_prefix = hex::encode(&plaintext_digest[..4]),
        "Sealed payload"
    );

    Ok(EncryptedPayload {
        algorithm: Algorithm::Aes256Gcm,
        ciphertext,
        nonce: nonce_bytes,
        tag,
        plaintext_digest,
        sealed_at,
    })
}

/// Unseal and decode a bid document.
pub fn unseal(
    payload: &EncryptedPayload,
    key: &TenderKey,
    aad: &[u8],
) -> Result<BidPayload, CryptoError> {
    let bytes = Zeroizing::new(unseal_bytes(payload, key, aad)?);
    borsh::from_slice(&bytes).map_err(|e| CryptoError::Serialization(e.to_string()))
}

/// Unseal to the canonical bytes, enforcing both the tag and the digest.
pub fn unseal_bytes(
    payload: &EncryptedPayload,
    key: &TenderKey,
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| CryptoError::AuthenticationFailed)?;

    let nonce = Nonce::from_slice(&payload.nonce);

    // Reconstruct ciphertext with tag for decryption
    let mut ct_with_tag = Vec::with_capacity(payload.ciphertext.len() + TAG_SIZE);
    ct_with_tag.extend_from_slice(&payload.ciphertext);
    ct_with_tag.extend_from_slice(&payload.tag);

    let mut plaintext = cipher
        .decrypt(
            nonce,
            Payload {
                msg: &ct_with_tag,
                aad,
            },
        )
        .map_err(|_| CryptoError::AuthenticationFailed)?;

    if !integrity::verify(&plaintext, &payload.plaintext_digest) {
        plaintext.zeroize();
        return Err(CryptoError::IntegrityViolation);
    }

    Ok(plaintext)
}
