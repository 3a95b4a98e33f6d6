//! Bid ledger: the store of every sealed bid.
//!
//! Bids are never deleted. Changes are committed with
//! [`BidLedger::compare_and_swap`], which rejects a writer whose view of the
//! bid is stale instead of making it wait.
//!
//! The ledger also records which session holds each tender's bid set. Taking
//! that hold is the only way to obtain a [`QuorumAttestation`].

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use tender_types::{
    BidId, BidStatus, EncryptedPayload, SessionId, SupplierId, TenderId, Timestamp,
};

use crate::bid::{BidState, QuorumAttestation, SealedBid};
use crate::error::{BidAction, BidError};

/// A started session's hold on the bid set of a tender.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenderLock {
    pub tender_id: TenderId,
    pub session_id: SessionId,
    pub attended: usize,
    pub required: usize,
}

impl TenderLock {
    fn attestation(&self) -> QuorumAttestation {
        QuorumAttestation::new(self.tender_id, self.session_id, self.attended, self.required)
    }
}

#[derive(Debug, Default)]
struct LedgerInner {
    /// Next bid ID to assign
    next_bid_id: u64,

    /// Next opening session ID to assign
    next_session_id: u64,

    /// All bids by ID
    bids: HashMap<BidId, SealedBid>,

    /// Bids per tender, in insertion order
    tender_bids: HashMap<TenderId, Vec<BidId>>,

    /// Tenders whose bid set is held by a started session
    locked_tenders: HashMap<TenderId, TenderLock>,
}

/// Serializable image of the ledger.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub next_bid_id: u64,
    #[serde(default)]
    pub next_session_id: u64,
    pub bids: Vec<SealedBid>,
    pub locked_tenders: Vec<TenderLock>,
}

/// Store of sealed bids shared by handlers and coordinators.
#[derive(Debug)]
pub struct BidLedger {
    inner: RwLock<LedgerInner>,
}

impl Default for BidLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl BidLedger {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(LedgerInner {
                next_bid_id: 1,
                next_session_id: 1,
                ..Default::default()
            }),
        }
    }

    /// Store a freshly sealed bid, unless its tender is locked.
    pub fn insert_sealed(
        &self,
        tender_id: TenderId,
        supplier_id: SupplierId,
        payload: EncryptedPayload,
        submitted_at: Timestamp,
        opening_deadline: Timestamp,
    ) -> Result<BidId, BidError> {
        let mut inner = self.inner.write();
        if inner.locked_tenders.contains_key(&tender_id) {
            return Err(BidError::TenderLocked {
                tender_id,
                at: submitted_at,
            });
        }

        let id = BidId(inner.next_bid_id);
        inner.next_bid_id += 1;

        inner.bids.insert(
            id,
            SealedBid {
                id,
                tender_id,
                supplier_id,
                payload,
                submitted_at,
                opening_deadline,
                state: BidState::Sealed,
                investigation: None,
                version: 0,
            },
        );
        inner.tender_bids.entry(tender_id).or_default().push(id);
        Ok(id)
    }

    /// Get a copy of a bid.
    pub fn get(&self, bid_id: BidId) -> Option<SealedBid> {
        self.inner.read().bids.get(&bid_id).cloned()
    }

    /// Replace a bid if, and only if, its stored status is still `expected`
    /// and nothing was committed since `next` was prepared from it.
    pub fn compare_and_swap(
        &self,
        expected: BidStatus,
        next: SealedBid,
        action: BidAction,
        at: Timestamp,
    ) -> Result<(), BidError> {
        let mut inner = self.inner.write();
        let current = inner.bids.get_mut(&next.id).ok_or(BidError::BidNotFound {
            bid_id: next.id,
            at,
        })?;

        let got = current.status();
        if got != expected {
            debug!(bid_id = next.id.0, %expected, %got, "Lost status race");
            return Err(BidError::InvalidState {
                bid_id: next.id,
                action,
                expected,
                got,
                at,
            });
        }
        if current.version != next.version {
            debug!(
                bid_id = next.id.0,
                prepared = next.version,
                stored = current.version,
                "Lost version race"
            );
            return Err(BidError::StaleWrite {
                bid_id: next.id,
                action,
                expected: next.version,
                got: current.version,
                at,
            });
        }

        *current = SealedBid {
            version: next.version + 1,
            ..next
        };
        Ok(())
    }

    /// All bids of a tender, ordered by submission time then id.
    pub fn bids_for_tender(&self, tender_id: TenderId) -> Vec<SealedBid> {
        let inner = self.inner.read();
        let mut bids: Vec<SealedBid> = inner
            .tender_bids
            .get(&tender_id)
            .map(|ids| ids.iter().filter_map(|id| inner.bids.get(id)).cloned().collect())
            .unwrap_or_default();
        bids.sort_by_key(|b| (b.submitted_at, b.id));
        bids
    }

    /// Bids of a tender held back for manual investigation.
    pub fn flagged_for_tender(&self, tender_id: TenderId) -> Vec<SealedBid> {
        self.bids_for_tender(tender_id)
            .into_iter()
            .filter(|b| b.is_flagged())
            .collect()
    }

    /// Hand out the next opening session ID.
    pub fn allocate_session_id(&self) -> SessionId {
        let mut inner = self.inner.write();
        let id = SessionId(inner.next_session_id);
        inner.next_session_id += 1;
        id
    }

    /// Hold a tender's bid set for a session with the given attendance.
    ///
    /// Returns `None` if another session already holds it.
    pub fn lock_tender(
        &self,
        tender_id: TenderId,
        session_id: SessionId,
        attended: usize,
        required: usize,
    ) -> Option<QuorumAttestation> {
        let mut inner = self.inner.write();
        if inner.locked_tenders.contains_key(&tender_id) {
            return None;
        }
        let lock = TenderLock {
            tender_id,
            session_id,
            attended,
            required,
        };
        inner.locked_tenders.insert(tender_id, lock);
        Some(lock.attestation())
    }

    /// Re-issue the attestation of the session holding a tender.
    pub fn attestation_for(
        &self,
        tender_id: TenderId,
        session_id: SessionId,
    ) -> Option<QuorumAttestation> {
        self.inner
            .read()
            .locked_tenders
            .get(&tender_id)
            .filter(|lock| lock.session_id == session_id)
            .map(TenderLock::attestation)
    }

    /// Whether the attestation still matches the hold recorded for its tender.
    pub fn holds(&self, quorum: &QuorumAttestation) -> bool {
        self.inner
            .read()
            .locked_tenders
            .get(&quorum.tender_id())
            .is_some_and(|lock| lock.attestation() == *quorum)
    }

    /// Release a tender held by `session_id`. Returns false if that session
    /// did not hold it.
    pub fn unlock_tender(&self, tender_id: TenderId, session_id: SessionId) -> bool {
        let mut inner = self.inner.write();
        match inner.locked_tenders.get(&tender_id) {
            Some(lock) if lock.session_id == session_id => {
                inner.locked_tenders.remove(&tender_id);
                true
            }
            _ => false,
        }
    }

    pub fn is_locked(&self, tender_id: TenderId) -> bool {
        self.inner.read().locked_tenders.contains_key(&tender_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().bids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().bids.is_empty()
    }

    /// Capture the full ledger for persistence.
    pub fn snapshot(&self) -> LedgerSnapshot {
        let inner = self.inner.read();
        let mut bids: Vec<SealedBid> = inner.bids.values().cloned().collect();
        bids.sort_by_key(|b| b.id);
        let mut locked_tenders: Vec<TenderLock> = inner.locked_tenders.values().copied().collect();
        locked_tenders.sort_by_key(|lock| lock.tender_id);
        LedgerSnapshot {
            next_bid_id: inner.next_bid_id,
            next_session_id: inner.next_session_id,
            bids,
            locked_tenders,
        }
    }

    /// Rebuild a ledger from a snapshot.
    ///
    /// Both ID counters are moved past every ID the snapshot mentions.
    pub fn restore(snapshot: LedgerSnapshot) -> Self {
        let mut inner = LedgerInner {
            next_bid_id: snapshot.next_bid_id.max(1),
            next_session_id: snapshot.next_session_id.max(1),
            ..Default::default()
        };
        for lock in snapshot.locked_tenders {
            inner.next_session_id = inner.next_session_id.max(lock.session_id.0 + 1);
            inner.locked_tenders.insert(lock.tender_id, lock);
        }
        for bid in snapshot.bids {
            inner.next_bid_id = inner.next_bid_id.max(bid.id.0 + 1);
            let sessions = [
                match &bid.state {
                    BidState::Opened { session_id, .. } => Some(*session_id),
                    _ => None,
                },
                bid.investigation.as_ref().map(|i| i.session_id),
            ];
            for session_id in sessions.into_iter().flatten() {
                inner.next_session_id = inner.next_session_id.max(session_id.0 + 1);
            }
            inner.tender_bids.entry(bid.tender_id).or_default().push(bid.id);
            inner.bids.insert(bid.id, bid);
        }
        Self {
            inner: RwLock::new(inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bid::tests::sealed_bid;
    use crate::bid::BidEvent;
    use tender_types::UserId;

    fn insert(ledger: &BidLedger, tender: u64, submitted_at: u64, deadline: u64) -> BidId {
        let template = sealed_bid(0, deadline);
        ledger
            .insert_sealed(
                TenderId(tender),
                SupplierId(format!("s-{}", submitted_at)),
                template.payload,
                Timestamp(submitted_at),
                Timestamp(deadline),
            )
            .unwrap()
    }

    #[test]
    fn test_allocate_bid_ids() {
        let ledger = BidLedger::new();
        assert_eq!(insert(&ledger, 1, 10, 100), BidId(1));
        assert_eq!(insert(&ledger, 1, 11, 100), BidId(2));
        assert_eq!(insert(&ledger, 2, 12, 100), BidId(3));
        assert_eq!(ledger.len(), 3);
    }

    #[test]
    fn test_bids_for_tender_ordered_by_submission_then_id() {
        let ledger = BidLedger::new();
        let late = insert(&ledger, 1, 30, 100);
        let early_a = insert(&ledger, 1, 10, 100);
        let early_b = insert(&ledger, 1, 10, 100);
        insert(&ledger, 2, 5, 100);

        let ids: Vec<BidId> = ledger.bids_for_tender(TenderId(1)).iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![early_a, early_b, late]);
    }

    #[test]
    fn test_locked_tender_rejects_submissions() {
        let ledger = BidLedger::new();
        insert(&ledger, 1, 10, 100);
        assert!(ledger.lock_tender(TenderId(1), SessionId(1), 3, 3).is_some());
        assert!(ledger.lock_tender(TenderId(1), SessionId(2), 3, 3).is_none());

        let result = ledger.insert_sealed(
            TenderId(1),
            SupplierId("late".into()),
            sealed_bid(0, 100).payload,
            Timestamp(20),
            Timestamp(100),
        );
        assert!(matches!(result, Err(BidError::TenderLocked { .. })));

        // Other tenders are unaffected.
        insert(&ledger, 2, 20, 100);
    }

    #[test]
    fn test_compare_and_swap_rejects_stale_writer() {
        let ledger = BidLedger::new();
        let id = insert(&ledger, 1, 10, 100);
        let snapshot = ledger.get(id).unwrap();

        let withdrawn = snapshot
            .apply(
                Timestamp(50),
                BidEvent::Withdraw {
                    by: UserId::new("s"),
                },
            )
            .unwrap();
        let disqualified = snapshot
            .apply(
                Timestamp(50),
                BidEvent::Disqualify {
                    by: UserId::new("a"),
                    reason: "r".into(),
                },
            )
            .unwrap();

        ledger
            .compare_and_swap(BidStatus::Sealed, withdrawn, BidAction::Withdraw, Timestamp(50))
            .unwrap();
        let lost = ledger.compare_and_swap(
            BidStatus::Sealed,
            disqualified,
            BidAction::Disqualify,
            Timestamp(50),
        );

        assert!(matches!(
            lost,
            Err(BidError::InvalidState {
                got: BidStatus::Withdrawn,
                ..
            })
        ));
        assert_eq!(ledger.get(id).unwrap().status(), BidStatus::Withdrawn);
    }

    #[test]
    fn test_stale_disqualify_keeps_investigation() {
        let ledger = BidLedger::new();
        let id = insert(&ledger, 1, 10, 100);
        let before = ledger.get(id).unwrap();

        // An administrator prepares a disqualification from this copy...
        let disqualified = before
            .apply(
                Timestamp(50),
                BidEvent::Disqualify {
                    by: UserId::new("admin"),
                    reason: "late certificate".into(),
                },
            )
            .unwrap();

        // ...while a session flags the same bid and commits first.
        let flagged = before
            .flag(Timestamp(120), SessionId(2), "digest mismatch".into())
            .unwrap();
        ledger
            .compare_and_swap(BidStatus::Sealed, flagged, BidAction::Flag, Timestamp(120))
            .unwrap();

        let lost = ledger.compare_and_swap(
            BidStatus::Sealed,
            disqualified,
            BidAction::Disqualify,
            Timestamp(121),
        );
        assert!(matches!(
            lost,
            Err(BidError::StaleWrite {
                expected: 0,
                got: 1,
                ..
            })
        ));

        let stored = ledger.get(id).unwrap();
        assert_eq!(stored.status(), BidStatus::Sealed);
        assert_eq!(stored.version, 1);
        assert_eq!(stored.investigation.unwrap().session_id, SessionId(2));

        // A writer working from the current copy still goes through.
        let current = ledger.get(id).unwrap();
        let disqualified = current
            .apply(
                Timestamp(130),
                BidEvent::Disqualify {
                    by: UserId::new("admin"),
                    reason: "late certificate".into(),
                },
            )
            .unwrap();
        ledger
            .compare_and_swap(
                BidStatus::Sealed,
                disqualified,
                BidAction::Disqualify,
                Timestamp(130),
            )
            .unwrap();
        let stored = ledger.get(id).unwrap();
        assert_eq!(stored.status(), BidStatus::Disqualified);
        assert!(stored.is_flagged());
    }

    #[test]
    fn test_lock_is_held_by_one_session() {
        let ledger = BidLedger::new();
        let quorum = ledger.lock_tender(TenderId(1), SessionId(5), 3, 2).unwrap();
        assert_eq!(quorum.tender_id(), TenderId(1));
        assert_eq!(quorum.session_id(), SessionId(5));
        assert!(quorum.is_met());
        assert!(ledger.holds(&quorum));
        assert_eq!(ledger.attestation_for(TenderId(1), SessionId(5)), Some(quorum));
        assert_eq!(ledger.attestation_for(TenderId(1), SessionId(6)), None);

        // Only the holder can release it.
        assert!(!ledger.unlock_tender(TenderId(1), SessionId(6)));
        assert!(ledger.is_locked(TenderId(1)));
        assert!(ledger.unlock_tender(TenderId(1), SessionId(5)));
        assert!(!ledger.holds(&quorum));

        // A later session's hold does not revive the old attestation.
        let later = ledger.lock_tender(TenderId(1), SessionId(6), 3, 2).unwrap();
        assert!(ledger.holds(&later));
        assert!(!ledger.holds(&quorum));
    }

    #[test]
    fn test_snapshot_restore() {
        let ledger = BidLedger::new();
        insert(&ledger, 1, 10, 100);
        insert(&ledger, 1, 11, 100);
        assert_eq!(ledger.allocate_session_id(), SessionId(1));
        assert_eq!(ledger.allocate_session_id(), SessionId(2));
        ledger.lock_tender(TenderId(1), SessionId(2), 3, 3).unwrap();

        let json = serde_json::to_string(&ledger.snapshot()).unwrap();
        let restored = BidLedger::restore(serde_json::from_str(&json).unwrap());

        assert_eq!(restored.len(), 2);
        assert!(restored.is_locked(TenderId(1)));
        assert!(restored.attestation_for(TenderId(1), SessionId(2)).is_some());
        assert_eq!(insert_unlocked(&restored), BidId(3));
        assert_eq!(restored.allocate_session_id(), SessionId(3));
    }

    #[test]
    fn test_restore_moves_session_counter_past_recorded_sessions() {
        let ledger = BidLedger::new();
        let id = insert(&ledger, 1, 10, 100);
        let mut snapshot = ledger.snapshot();
        snapshot.next_session_id = 0;
        snapshot.bids[0].investigation = Some(crate::bid::Investigation {
            flagged_at: Timestamp(100),
            session_id: SessionId(4),
            reason: "digest mismatch".into(),
        });
        assert_eq!(snapshot.bids[0].id, id);

        let restored = BidLedger::restore(snapshot);
        assert_eq!(restored.allocate_session_id(), SessionId(5));
    }

    fn insert_unlocked(ledger: &BidLedger) -> BidId {
        insert(ledger, 9, 1, 100)
    }
}
