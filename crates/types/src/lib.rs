//! Core type definitions for sealed-bid tender opening.
//!
//! This crate provides the shared data structures used across the opening
//! system: identifiers and timestamps, the encrypted payload envelope, the
//! plaintext bid document, lifecycle statuses, committee rosters and audit
//! records.

use std::fmt;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};

pub mod report;

pub use report::{OpeningReport, RankedBid, ReportSummary};

// =========================
// TIME AND IDENTIFIERS
// =========================

/// Milliseconds since the Unix epoch.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub const fn as_millis(self) -> u64 {
        self.0
    }

    pub const fn plus_millis(self, millis: u64) -> Self {
        Self(self.0.saturating_add(millis))
    }

    pub const fn minus_millis(self, millis: u64) -> Self {
        Self(self.0.saturating_sub(millis))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

numeric_id!(
    /// Identifier of a sealed bid.
    BidId,
    "bid"
);
numeric_id!(
    /// Identifier of a tender (procurement call).
    TenderId,
    "tender"
);
numeric_id!(
    /// Identifier of a bid-opening session.
    SessionId,
    "session"
);

/// Identifier of a supplier submitting bids.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SupplierId(pub String);

/// Identifier of an officer or committee member.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for SupplierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =========================
// ENCRYPTED PAYLOAD
// =========================

/// AEAD algorithm used to seal a payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    /// AES-256-GCM with a 96-bit nonce and 128-bit tag
    Aes256Gcm,
}

/// Sealed bid contents.
///
/// Byte fields are stored as base64 strings at rest. The key used to seal the
/// payload is never part of this structure.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub algorithm: Algorithm,

    /// AES-GCM ciphertext without the tag
    #[serde_as(as = "Base64")]
    pub ciphertext: Vec<u8>,

    /// 96-bit nonce
    #[serde_as(as = "Base64")]
    pub nonce: [u8; 12],

    /// 128-bit authentication tag
    #[serde_as(as = "Base64")]
    pub tag: [u8; 16],

    /// SHA-256 of the pre-encryption bytes
    #[serde_as(as = "Base64")]
    pub plaintext_digest: [u8; 32],

    pub sealed_at: Timestamp,
}

/// Associated data binding a ciphertext to its tender and supplier.
pub fn submission_aad(tender_id: TenderId, supplier_id: &SupplierId) -> Vec<u8> {
    let mut aad = Vec::with_capacity(32 + supplier_id.0.len());
    aad.extend_from_slice(b"SEALED_BID_V1:");
    aad.extend_from_slice(&tender_id.0.to_le_bytes());
    aad.extend_from_slice(&(supplier_id.0.len() as u64).to_le_bytes());
    aad.extend_from_slice(supplier_id.0.as_bytes());
    aad
}

// =========================
// BID DOCUMENT
// =========================

/// Plaintext bid document as submitted by a supplier.
///
/// The borsh encoding of this struct is its canonical byte form.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct BidPayload {
    /// Declared total price in minor currency units
    pub total_price: u64,
    /// ISO 4217 currency code
    pub currency: String,
    pub delivery_days: u32,
    pub line_items: Vec<LineItem>,
    pub notes: String,
}

/// One priced line of a bid.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct LineItem {
    pub description: String,
    pub quantity: u32,
    /// Unit price in minor currency units
    pub unit_price: u64,
}

/// An accepted bid submission handed over by the submission collaborator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BidSubmission {
    pub tender_id: TenderId,
    pub supplier_id: SupplierId,
    pub payload: BidPayload,
    pub opening_deadline: Timestamp,
}

// =========================
// LIFECYCLE STATUSES
// =========================

/// Sealed bid lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BidStatus {
    /// Encrypted, awaiting opening
    Sealed,
    /// Decrypted during an opening session
    Opened,
    /// Withdrawn by the supplier before the deadline
    Withdrawn,
    /// Excluded by an administrative decision
    Disqualified,
}

impl fmt::Display for BidStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BidStatus::Sealed => "SEALED",
            BidStatus::Opened => "OPENED",
            BidStatus::Withdrawn => "WITHDRAWN",
            BidStatus::Disqualified => "DISQUALIFIED",
        };
        f.write_str(name)
    }
}

/// Opening session lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    InProgress,
    Completed,
    Aborted,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Pending => "PENDING",
            SessionStatus::InProgress => "IN_PROGRESS",
            SessionStatus::Completed => "COMPLETED",
            SessionStatus::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

// =========================
// COMMITTEE
// =========================

/// Member of a bid-opening committee.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteeMember {
    pub user_id: UserId,
    pub name: String,
    pub role: String,
    pub attended: bool,
}

/// Number of members marked as attending.
pub fn attendance(committee: &[CommitteeMember]) -> usize {
    committee.iter().filter(|m| m.attended).count()
}

// =========================
// AUDIT
// =========================

/// Kind of state transition recorded in the audit trail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    BidSealed,
    BidOpened,
    BidWithdrawn,
    BidDisqualified,
    BidFlagged,
    SessionStarted,
    SessionCompleted,
    SessionAborted,
}

/// Entity an audit entry refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSubject {
    Bid {
        bid_id: BidId,
        session_id: Option<SessionId>,
    },
    Session {
        session_id: SessionId,
        tender_id: TenderId,
    },
}

/// Result of an audited transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    /// Transition recorded but the subject needs manual follow-up
    Flagged { reason: String },
    /// Transition to a terminal failure state
    Failed { reason: String },
}

/// Immutable record of one state transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: AuditAction,
    pub subject: AuditSubject,
    pub actor: UserId,
    pub at: Timestamp,
    pub outcome: AuditOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_aad_is_unique_per_submission() {
        let a = submission_aad(TenderId(1), &SupplierId("acme".into()));
        let b = submission_aad(TenderId(2), &SupplierId("acme".into()));
        let c = submission_aad(TenderId(1), &SupplierId("acme-2".into()));

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, submission_aad(TenderId(1), &SupplierId("acme".into())));
    }

    #[test]
    fn test_encrypted_payload_stores_bytes_as_base64() {
        let payload = EncryptedPayload {
            algorithm: Algorithm::Aes256Gcm,
            ciphertext: vec![0xde, 0xad, 0xbe, 0xef],
            nonce: [1u8; 12],
            tag: [2u8; 16],
            plaintext_digest: [3u8; 32],
            sealed_at: Timestamp(42),
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["ciphertext"], "3q2+7w==");
        assert_eq!(json["algorithm"], "aes256-gcm");
        assert_eq!(json["sealed_at"], 42);

        let decoded: EncryptedPayload = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_unknown_algorithm_is_rejected_on_load() {
        let payload = EncryptedPayload {
            algorithm: Algorithm::Aes256Gcm,
            ciphertext: vec![1],
            nonce: [0u8; 12],
            tag: [0u8; 16],
            plaintext_digest: [0u8; 32],
            sealed_at: Timestamp(1),
        };
        let mut json = serde_json::to_value(&payload).unwrap();
        json["algorithm"] = "chacha20-poly1305".into();

        assert!(serde_json::from_value::<EncryptedPayload>(json).is_err());
    }

    #[test]
    fn test_timestamp_arithmetic_saturates() {
        assert_eq!(Timestamp(5).minus_millis(10), Timestamp(0));
        assert_eq!(Timestamp(u64::MAX).plus_millis(1), Timestamp(u64::MAX));
        assert!(Timestamp(999) < Timestamp(1000));
    }

    #[test]
    fn test_attendance_counts_only_attending_members() {
        let committee = vec![
            CommitteeMember {
                user_id: UserId::new("u1"),
                name: "Ada".into(),
                role: "chair".into(),
                attended: true,
            },
            CommitteeMember {
                user_id: UserId::new("u2"),
                name: "Grace".into(),
                role: "member".into(),
                attended: false,
            },
        ];
        assert_eq!(attendance(&committee), 1);
    }
}
