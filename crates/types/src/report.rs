//! Bid opening report handed to the reporting collaborator.

use serde::{Deserialize, Serialize};

use crate::{BidId, BidStatus, CommitteeMember, SessionId, SessionStatus, SupplierId, TenderId, Timestamp};

/// Structured record of one opening session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpeningReport {
    pub session_id: SessionId,
    pub tender_id: TenderId,
    pub status: SessionStatus,
    pub scheduled_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub committee: Vec<CommitteeMember>,
    /// Opened bids first (ranked), then unopened bids (unranked)
    pub bids: Vec<RankedBid>,
    pub summary: ReportSummary,
}

/// One row of the report's bid list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedBid {
    /// 1-based rank by declared price; `None` for bids that were not opened
    pub rank: Option<u32>,
    pub bid_id: BidId,
    pub supplier_id: SupplierId,
    pub status: BidStatus,
    pub submitted_at: Timestamp,
    pub total_price: Option<u64>,
    pub currency: Option<String>,
    /// Set when the bid was held back for manual investigation
    pub flagged: Option<String>,
}

/// Aggregate figures for the report footer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total_bids: usize,
    pub opened: usize,
    pub flagged: usize,
    pub withdrawn: usize,
    pub disqualified: usize,
    pub committee_size: usize,
    pub attended: usize,
    pub lowest_price: Option<u64>,
    pub highest_price: Option<u64>,
    pub mean_price: Option<f64>,
}
