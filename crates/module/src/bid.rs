//! Sealed bid entity and its lifecycle state machine.
//!
//! ```text
//!            open (now >= deadline, quorum met)
//!   SEALED ─────────────────────────────────────▶ OPENED
//!     │  │
//!     │  └── withdraw (now < deadline) ─────────▶ WITHDRAWN
//!     └───── disqualify (any time) ─────────────▶ DISQUALIFIED
//! ```
//!
//! Every transition leaves `Sealed`; none re-enters it. The decrypted document
//! only exists inside [`BidState::Opened`].

use serde::{Deserialize, Serialize};

use tender_types::{
    BidId, BidPayload, BidStatus, EncryptedPayload, SessionId, SupplierId, TenderId, Timestamp,
    UserId,
};

use crate::error::{BidAction, BidError};

/// Lifecycle state of a sealed bid.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BidState {
    Sealed,
    Opened {
        opened_at: Timestamp,
        opened_by: UserId,
        session_id: SessionId,
        decrypted: BidPayload,
    },
    Withdrawn {
        at: Timestamp,
        by: UserId,
    },
    Disqualified {
        at: Timestamp,
        by: UserId,
        reason: String,
    },
}

impl BidState {
    pub fn status(&self) -> BidStatus {
        match self {
            BidState::Sealed => BidStatus::Sealed,
            BidState::Opened { .. } => BidStatus::Opened,
            BidState::Withdrawn { .. } => BidStatus::Withdrawn,
            BidState::Disqualified { .. } => BidStatus::Disqualified,
        }
    }
}

/// Marker left on a bid whose integrity check failed during opening.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Investigation {
    pub flagged_at: Timestamp,
    pub session_id: SessionId,
    pub reason: String,
}

/// Evidence that a started session holds a tender's bid set with its quorum
/// present.
///
/// Only [`BidLedger::lock_tender`](crate::state::BidLedger::lock_tender) and
/// [`BidLedger::attestation_for`](crate::state::BidLedger::attestation_for)
/// hand these out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuorumAttestation {
    tender_id: TenderId,
    session_id: SessionId,
    attended: usize,
    required: usize,
}

impl QuorumAttestation {
    pub(crate) fn new(
        tender_id: TenderId,
        session_id: SessionId,
        attended: usize,
        required: usize,
    ) -> Self {
        Self {
            tender_id,
            session_id,
            attended,
            required,
        }
    }

    pub fn tender_id(&self) -> TenderId {
        self.tender_id
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn attended(&self) -> usize {
        self.attended
    }

    pub fn required(&self) -> usize {
        self.required
    }

    pub fn is_met(&self) -> bool {
        self.required > 0 && self.attended >= self.required
    }
}

/// Input to the bid state machine.
#[derive(Clone, Debug)]
pub enum BidEvent {
    Open {
        by: UserId,
        quorum: QuorumAttestation,
        decrypted: BidPayload,
    },
    Withdraw {
        by: UserId,
    },
    Disqualify {
        by: UserId,
        reason: String,
    },
}

impl BidEvent {
    pub fn action(&self) -> BidAction {
        match self {
            BidEvent::Open { .. } => BidAction::Open,
            BidEvent::Withdraw { .. } => BidAction::Withdraw,
            BidEvent::Disqualify { .. } => BidAction::Disqualify,
        }
    }
}

/// One submission's encrypted payload and lifecycle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBid {
    pub id: BidId,
    pub tender_id: TenderId,
    pub supplier_id: SupplierId,
    pub payload: EncryptedPayload,
    pub submitted_at: Timestamp,
    pub opening_deadline: Timestamp,
    pub state: BidState,
    pub investigation: Option<Investigation>,
    /// Commits applied to this record. A write prepared from an older
    /// version is refused by the ledger.
    #[serde(default)]
    pub version: u64,
}

impl SealedBid {
    pub fn status(&self) -> BidStatus {
        self.state.status()
    }

    /// Decrypted document, present only once the bid is opened.
    pub fn decrypted_payload(&self) -> Option<&BidPayload> {
        match &self.state {
            BidState::Opened { decrypted, .. } => Some(decrypted),
            _ => None,
        }
    }

    pub fn is_flagged(&self) -> bool {
        self.investigation.is_some()
    }

    /// Check the open guard without decrypting anything.
    pub fn guard_open(&self, now: Timestamp, quorum: &QuorumAttestation) -> Result<(), BidError> {
        self.require_sealed(BidAction::Open, now)?;
        if now < self.opening_deadline {
            return Err(BidError::TimingViolation {
                bid_id: self.id,
                action: BidAction::Open,
                now,
                deadline: self.opening_deadline,
            });
        }
        if !quorum.is_met() {
            return Err(BidError::QuorumNotMet {
                bid_id: self.id,
                session_id: quorum.session_id(),
                attended: quorum.attended(),
                required: quorum.required(),
                at: now,
            });
        }
        Ok(())
    }

    pub fn guard_withdraw(&self, now: Timestamp) -> Result<(), BidError> {
        self.require_sealed(BidAction::Withdraw, now)?;
        if now >= self.opening_deadline {
            return Err(BidError::TimingViolation {
                bid_id: self.id,
                action: BidAction::Withdraw,
                now,
                deadline: self.opening_deadline,
            });
        }
        Ok(())
    }

    pub fn guard_disqualify(&self, now: Timestamp) -> Result<(), BidError> {
        self.require_sealed(BidAction::Disqualify, now)
    }

    /// Apply an event, returning the bid in its next state.
    ///
    /// The receiver is left untouched; callers commit the result with a
    /// compare-and-swap on the ledger.
    pub fn apply(&self, now: Timestamp, event: BidEvent) -> Result<SealedBid, BidError> {
        let next_state = match (&self.state, event) {
            (
                BidState::Sealed,
                BidEvent::Open {
                    by,
                    quorum,
                    decrypted,
                },
            ) => {
                self.guard_open(now, &quorum)?;
                BidState::Opened {
                    opened_at: now,
                    opened_by: by,
                    session_id: quorum.session_id(),
                    decrypted,
                }
            }
            (BidState::Sealed, BidEvent::Withdraw { by }) => {
                self.guard_withdraw(now)?;
                BidState::Withdrawn { at: now, by }
            }
            (BidState::Sealed, BidEvent::Disqualify { by, reason }) => {
                self.guard_disqualify(now)?;
                BidState::Disqualified { at: now, by, reason }
            }
            (
                BidState::Opened { .. } | BidState::Withdrawn { .. } | BidState::Disqualified { .. },
                event,
            ) => {
                return Err(self.wrong_state(event.action(), now));
            }
        };

        Ok(SealedBid {
            state: next_state,
            ..self.clone()
        })
    }

    /// Mark a still-sealed bid for manual investigation.
    pub fn flag(
        &self,
        now: Timestamp,
        session_id: SessionId,
        reason: String,
    ) -> Result<SealedBid, BidError> {
        self.require_sealed(BidAction::Flag, now)?;
        Ok(SealedBid {
            investigation: Some(Investigation {
                flagged_at: now,
                session_id,
                reason,
            }),
            ..self.clone()
        })
    }

    fn require_sealed(&self, action: BidAction, now: Timestamp) -> Result<(), BidError> {
        match self.state {
            BidState::Sealed => Ok(()),
            _ => Err(self.wrong_state(action, now)),
        }
    }

    fn wrong_state(&self, action: BidAction, now: Timestamp) -> BidError {
        BidError::InvalidState {
            bid_id: self.id,
            action,
            expected: BidStatus::Sealed,
            got: self.status(),
            at: now,
        }
    }
}
