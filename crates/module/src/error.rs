//! Sealed bid error types.
//!
//! Every variant carries the bid or tender it concerns and the time of the
//! rejected call so that log lines and audit records can be correlated.

use std::fmt;

use thiserror::Error;

use tender_crypto::CryptoError;
use tender_types::{BidId, BidStatus, SessionId, TenderId, Timestamp};

use crate::keys::KeyError;

/// Guarded operation on a sealed bid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BidAction {
    Open,
    Withdraw,
    Disqualify,
    Flag,
}

impl fmt::Display for BidAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BidAction::Open => "open",
            BidAction::Withdraw => "withdraw",
            BidAction::Disqualify => "disqualify",
            BidAction::Flag => "flag",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while operating on sealed bids.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BidError {
    #[error("Timing violation: cannot {action} {bid_id} at {now}, opening deadline is {deadline}")]
    TimingViolation {
        bid_id: BidId,
        action: BidAction,
        now: Timestamp,
        deadline: Timestamp,
    },

    #[error("Invalid state for {action} on {bid_id} at {at}. Expected: {expected}, Got: {got}")]
    InvalidState {
        bid_id: BidId,
        action: BidAction,
        expected: BidStatus,
        got: BidStatus,
        at: Timestamp,
    },

    #[error("Stale write for {action} on {bid_id} at {at}: prepared from version {expected}, ledger holds version {got}")]
    StaleWrite {
        bid_id: BidId,
        action: BidAction,
        expected: u64,
        got: u64,
        at: Timestamp,
    },

    #[error("Cannot open {bid_id} at {at}: {session_id} does not hold the bid set of {tender_id}")]
    NoActiveSession {
        bid_id: BidId,
        tender_id: TenderId,
        session_id: SessionId,
        at: Timestamp,
    },

    #[error("Quorum not met for {bid_id} in {session_id} at {at}: {attended} attending, {required} required")]
    QuorumNotMet {
        bid_id: BidId,
        session_id: SessionId,
        attended: usize,
        required: usize,
        at: Timestamp,
    },

    #[error("Integrity violation on {bid_id} at {at}: {source}")]
    IntegrityViolation {
        bid_id: BidId,
        at: Timestamp,
        source: CryptoError,
    },

    #[error("Bid not found: {bid_id} (at {at})")]
    BidNotFound { bid_id: BidId, at: Timestamp },

    #[error("Bid set of {tender_id} is locked by an opening session (at {at})")]
    TenderLocked { tender_id: TenderId, at: Timestamp },

    #[error("Opening deadline {deadline} is not after submission time {at}")]
    InvalidDeadline { deadline: Timestamp, at: Timestamp },

    #[error("Key unavailable for {tender_id} at {at}: {source}")]
    KeyUnavailable {
        tender_id: TenderId,
        at: Timestamp,
        source: KeyError,
    },

    #[error("Sealing failed for {tender_id} at {at}: {source}")]
    SealingFailed {
        tender_id: TenderId,
        at: Timestamp,
        source: CryptoError,
    },
}

impl BidError {
    /// Whether the failure is a per-bid integrity problem that should be
    /// flagged for investigation rather than abort the caller.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, BidError::IntegrityViolation { .. })
    }
}
