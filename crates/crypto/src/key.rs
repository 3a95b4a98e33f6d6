//! Per-tender symmetric key material.

use std::fmt;

use hkdf::Hkdf;
use rand::{CryptoRng, RngCore};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use tender_types::TenderId;

use crate::error::CryptoError;

/// Length of an AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;

/// 256-bit symmetric key sealing every bid of one tender.
///
/// Zeroized on drop, compared in constant time and never printed.
#[derive(Clone, ZeroizeOnDrop)]
pub struct TenderKey([u8; KEY_SIZE]);

impl TenderKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Draw a fresh key from a cryptographically secure generator.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Derive the key of a tender from a master secret with HKDF-SHA256.
    pub fn derive(master_secret: &[u8], tender_id: TenderId) -> Result<Self, CryptoError> {
        let hk = Hkdf::<Sha256>::new(Some(b"TENDER_KEY_V1"), master_secret);
        let mut info = Vec::with_capacity(16);
        info.extend_from_slice(b"tender:");
        info.extend_from_slice(&tender_id.0.to_le_bytes());

        let mut key = [0u8; KEY_SIZE];
        hk.expand(&info, &mut key)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;
        Ok(Self(key))
    }

    /// Hex form for key files. Never log the result.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let mut decoded = hex::decode(encoded.trim())
            .map_err(|e| CryptoError::Serialization(format!("invalid key encoding: {}", e)))?;
        if decoded.len() != KEY_SIZE {
            let len = decoded.len();
            decoded.zeroize();
            return Err(CryptoError::Serialization(format!(
                "invalid key length: expected {}, got {}",
                KEY_SIZE, len
            )));
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self(bytes))
    }
}

impl PartialEq for TenderKey {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl Eq for TenderKey {}

impl fmt::Debug for TenderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenderKey").field("value", &"***").finish()
    }
}
