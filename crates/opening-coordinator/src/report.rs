//! Opening report assembly.

use tender_module::SealedBid;
use tender_types::{BidStatus, OpeningReport, RankedBid, ReportSummary};

use crate::session::BidOpeningSession;

/// Build the report of a session from the current state of its bids.
///
/// Opened bids come first, ranked by declared total price (ties keep
/// submission order). Everything else follows unranked in opening order.
pub fn build_report(session: &BidOpeningSession, bids: &[SealedBid]) -> OpeningReport {
    let mut ordered: Vec<&SealedBid> = bids.iter().collect();
    ordered.sort_by_key(|b| (b.submitted_at, b.id));

    let (mut opened, unopened): (Vec<&SealedBid>, Vec<&SealedBid>) = ordered
        .into_iter()
        .partition(|b| b.decrypted_payload().is_some());
    opened.sort_by_key(|b| (price_of(b).unwrap_or(u64::MAX), b.submitted_at, b.id));

    let mut rows: Vec<RankedBid> = opened
        .iter()
        .enumerate()
        .map(|(i, b)| row(b, Some(i as u32 + 1)))
        .collect();
    rows.extend(unopened.iter().map(|b| row(b, None)));

    let prices: Vec<u64> = opened.iter().filter_map(|b| price_of(b)).collect();
    let count = |status: BidStatus| bids.iter().filter(|b| b.status() == status).count();

    let summary = ReportSummary {
        total_bids: bids.len(),
        opened: prices.len(),
        flagged: bids.iter().filter(|b| b.is_flagged()).count(),
        withdrawn: count(BidStatus::Withdrawn),
        disqualified: count(BidStatus::Disqualified),
        committee_size: session.committee().len(),
        attended: session.attendance(),
        lowest_price: prices.iter().copied().min(),
        highest_price: prices.iter().copied().max(),
        mean_price: if prices.is_empty() {
            None
        } else {
            Some(prices.iter().map(|p| *p as f64).sum::<f64>() / prices.len() as f64)
        },
    };

    OpeningReport {
        session_id: session.id(),
        tender_id: session.tender_id(),
        status: session.status(),
        scheduled_at: session.scheduled_at(),
        started_at: session.started_at(),
        completed_at: session.completed_at(),
        committee: session.committee().to_vec(),
        bids: rows,
        summary,
    }
}

fn price_of(bid: &SealedBid) -> Option<u64> {
    bid.decrypted_payload().map(|p| p.total_price)
}

fn row(bid: &SealedBid, rank: Option<u32>) -> RankedBid {
    let payload = bid.decrypted_payload();
    RankedBid {
        rank,
        bid_id: bid.id,
        supplier_id: bid.supplier_id.clone(),
        status: bid.status(),
        submitted_at: bid.submitted_at,
        total_price: payload.map(|p| p.total_price),
        currency: payload.map(|p| p.currency.clone()),
        flagged: bid.investigation.as_ref().map(|i| i.reason.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use rand::rngs::OsRng;
    use tender_module::handlers::{handle_flag_bid, handle_submit_bid};
    use tender_module::{
        BidLedger, CallContext, InMemoryAuditLog, InMemoryKeyProvider, ManualClock, OpeningConfig,
    };
    use tender_types::{
        BidId, BidPayload, BidSubmission, CommitteeMember, SessionStatus, SupplierId, TenderId,
        Timestamp, UserId,
    };

    use crate::OpeningCoordinator;

    fn submission(supplier: &str, price: u64) -> BidSubmission {
        BidSubmission {
            tender_id: TenderId(1),
            supplier_id: SupplierId(supplier.into()),
            payload: BidPayload {
                total_price: price,
                currency: "EUR".into(),
                delivery_days: 10,
                line_items: vec![],
                notes: String::new(),
            },
            opening_deadline: Timestamp(500),
        }
    }

    #[test]
    fn test_report_ranks_by_price_and_lists_flagged_last() {
        let ledger = Arc::new(BidLedger::new());
        let keys = Arc::new(InMemoryKeyProvider::new());
        let audit = Arc::new(InMemoryAuditLog::new());
        let clock = Arc::new(ManualClock::new(Timestamp(100)));

        let mut ids: Vec<BidId> = Vec::new();
        for (supplier, price) in [("acme", 300), ("globex", 100), ("initech", 300), ("umbrella", 50)] {
            let ctx = CallContext::from_clock(UserId::new("portal"), clock.as_ref());
            ids.push(
                handle_submit_bid(
                    ledger.as_ref(),
                    keys.as_ref(),
                    audit.as_ref(),
                    &ctx,
                    submission(supplier, price),
                    &mut OsRng,
                )
                .unwrap(),
            );
            clock.advance(1);
        }

        let ctx = CallContext::from_clock(UserId::new("chair"), clock.as_ref());
        handle_flag_bid(
            ledger.as_ref(),
            audit.as_ref(),
            &ctx,
            ids[3],
            tender_types::SessionId(0),
            "digest mismatch".into(),
        )
        .unwrap();

        let coordinator = OpeningCoordinator::new(
            ledger.clone(),
            keys,
            audit,
            clock.clone(),
            OpeningConfig {
                quorum: 1,
                ..Default::default()
            },
        );
        let committee = vec![CommitteeMember {
            user_id: UserId::new("chair"),
            name: "Chair".into(),
            role: "chair".into(),
            attended: true,
        }];
        let mut session = coordinator.schedule(TenderId(1), Timestamp(500), committee);
        clock.set(Timestamp(500));
        coordinator.run(&mut session, &UserId::new("chair")).unwrap();

        // The flagged bid was never in scope.
        assert_eq!(session.bids(), &ids[..3]);

        let all: Vec<SealedBid> = ids.iter().filter_map(|id| ledger.get(*id)).collect();
        let report = build_report(&session, &all);

        assert_eq!(report.status, SessionStatus::Completed);
        let order: Vec<(Option<u32>, BidId)> =
            report.bids.iter().map(|r| (r.rank, r.bid_id)).collect();
        assert_eq!(
            order,
            vec![
                (Some(1), ids[1]),
                (Some(2), ids[0]),
                (Some(3), ids[2]),
                (None, ids[3]),
            ]
        );
        assert_eq!(report.bids[3].flagged.as_deref(), Some("digest mismatch"));
        assert_eq!(report.bids[3].total_price, None);

        assert_eq!(report.summary.total_bids, 4);
        assert_eq!(report.summary.opened, 3);
        assert_eq!(report.summary.flagged, 1);
        assert_eq!(report.summary.lowest_price, Some(100));
        assert_eq!(report.summary.highest_price, Some(300));
        assert_eq!(report.summary.attended, 1);
        let mean = report.summary.mean_price.unwrap();
        assert!((mean - 700.0 / 3.0).abs() < 1e-9);
    }
}
