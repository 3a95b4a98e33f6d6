//! Sealing primitives for tender bids.
//!
//! This crate implements the cryptographic core of sealed-bid opening:
//! AES-256-GCM encryption of bid documents and an independent SHA-256
//! integrity witness over the pre-encryption bytes.
//!
//! # Overview
//!
//! 1. **Sealing**: the bid document is borsh-encoded into its canonical byte
//!    form, a random 96-bit nonce is drawn and the bytes are encrypted under
//!    the tender key. The SHA-256 digest of the same bytes is stored next to
//!    the ciphertext.
//!
//! 2. **Unsealing**: the GCM tag is checked first and fails closed. On
//!    success the digest of the recovered bytes is compared in constant time
//!    against the stored one. Both checks always run.
//!
//! 3. **Keys**: one 256-bit key per tender, supplied by the caller. Keys are
//!    never stored inside an [`EncryptedPayload`](tender_types::EncryptedPayload).

pub mod error;
pub mod integrity;
pub mod key;
pub mod seal;

pub use error::CryptoError;
pub use integrity::{digest, verify};
pub use key::TenderKey;
pub use seal::{seal, seal_bytes, unseal, unseal_bytes};
