//! Query handlers for the bid ledger.
//!
//! These functions provide read-only access to bids. Views never expose the
//! plaintext of a bid that has not been opened.

use serde::{Deserialize, Serialize};

use tender_types::{BidId, BidPayload, BidStatus, SupplierId, TenderId, Timestamp};

use crate::bid::SealedBid;
use crate::state::BidLedger;

/// Query request types.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum BidQuery {
    /// Get one bid by ID.
    GetBid { bid_id: BidId },

    /// Get all bids of a tender in opening order.
    TenderBids { tender_id: TenderId },

    /// Get bids held back for manual investigation.
    FlaggedBids { tender_id: TenderId },

    /// Check whether a tender's bid set is locked.
    IsTenderLocked { tender_id: TenderId },
}

/// Query response types.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum BidQueryResponse {
    Bid(Option<BidView>),
    Bids(Vec<BidView>),
    Locked(bool),
}

/// Redacted view of a bid.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidView {
    pub bid_id: BidId,
    pub tender_id: TenderId,
    pub supplier_id: SupplierId,
    pub status: BidStatus,
    pub submitted_at: Timestamp,
    pub opening_deadline: Timestamp,
    /// Hex SHA-256 of the sealed document, for cross-checking receipts
    pub plaintext_digest: String,
    pub flagged: Option<String>,
    /// Present only for opened bids
    pub payload: Option<BidPayload>,
}

impl BidView {
    pub fn from_bid(bid: &SealedBid) -> Self {
        Self {
            bid_id: bid.id,
            tender_id: bid.tender_id,
            supplier_id: bid.supplier_id.clone(),
            status: bid.status(),
            submitted_at: bid.submitted_at,
            opening_deadline: bid.opening_deadline,
            plaintext_digest: hex::encode(bid.payload.plaintext_digest),
            flagged: bid.investigation.as_ref().map(|i| i.reason.clone()),
            payload: bid.decrypted_payload().cloned(),
        }
    }
}

/// Handle a query.
pub fn handle_query(ledger: &BidLedger, query: BidQuery) -> BidQueryResponse {
    match query {
        BidQuery::GetBid { bid_id } => {
            BidQueryResponse::Bid(ledger.get(bid_id).as_ref().map(BidView::from_bid))
        }

        BidQuery::TenderBids { tender_id } => BidQueryResponse::Bids(
            ledger
                .bids_for_tender(tender_id)
                .iter()
                .map(BidView::from_bid)
                .collect(),
        ),

        BidQuery::FlaggedBids { tender_id } => BidQueryResponse::Bids(
            ledger
                .flagged_for_tender(tender_id)
                .iter()
                .map(BidView::from_bid)
                .collect(),
        ),

        BidQuery::IsTenderLocked { tender_id } => {
            BidQueryResponse::Locked(ledger.is_locked(tender_id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bid::tests::sealed_bid;

    #[test]
    fn test_view_hides_unopened_payload() {
        let ledger = BidLedger::new();
        let template = sealed_bid(0, 100);
        let id = ledger
            .insert_sealed(
                TenderId(1),
                SupplierId("acme".into()),
                template.payload,
                Timestamp(1),
                Timestamp(100),
            )
            .unwrap();

        match handle_query(&ledger, BidQuery::GetBid { bid_id: id }) {
            BidQueryResponse::Bid(Some(view)) => {
                assert_eq!(view.status, BidStatus::Sealed);
                assert!(view.payload.is_none());
                assert_eq!(view.plaintext_digest.len(), 64);
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_missing_bid_and_lock_queries() {
        let ledger = BidLedger::new();
        assert!(matches!(
            handle_query(&ledger, BidQuery::GetBid { bid_id: BidId(42) }),
            BidQueryResponse::Bid(None)
        ));

        ledger
            .lock_tender(TenderId(3), tender_types::SessionId(1), 3, 3)
            .unwrap();
        assert!(matches!(
            handle_query(&ledger, BidQuery::IsTenderLocked { tender_id: TenderId(3) }),
            BidQueryResponse::Locked(true)
        ));
    }
}
