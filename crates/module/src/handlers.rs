//! Call handlers for sealed bids.
//!
//! These functions implement the guarded operations on a bid. Each one reads
//! the bid, checks its guard, and commits the new state with a
//! compare-and-swap; the audit entry is emitted only after the commit.

use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use tender_crypto::TenderKey;
use tender_types::{
    submission_aad, AuditAction, AuditEntry, AuditOutcome, AuditSubject, BidId, BidPayload,
    BidStatus, BidSubmission, SessionId, SupplierId, TenderId, Timestamp, UserId,
};

use crate::audit::AuditSink;
use crate::bid::{BidEvent, QuorumAttestation, SealedBid};
use crate::clock::Clock;
use crate::error::{BidAction, BidError};
use crate::keys::KeyProvider;
use crate::state::BidLedger;

/// Context for each call: who is acting and when.
#[derive(Clone, Debug)]
pub struct CallContext {
    pub actor: UserId,
    pub now: Timestamp,
}

impl CallContext {
    /// Build a context reading the current time from the clock.
    pub fn from_clock<C: Clock + ?Sized>(actor: UserId, clock: &C) -> Self {
        Self {
            actor,
            now: clock.now(),
        }
    }
}

/// Result type for handlers.
pub type HandlerResult<T> = Result<T, BidError>;

/// Plaintext released by a successful opening.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenedBid {
    pub bid_id: BidId,
    pub tender_id: TenderId,
    pub supplier_id: SupplierId,
    pub submitted_at: Timestamp,
    pub opened_at: Timestamp,
    pub payload: BidPayload,
}

/// Handle an accepted submission: seal it and store it as `Sealed`.
pub fn handle_submit_bid<K, A, R>(
    ledger: &BidLedger,
    keys: &K,
    audit: &A,
    ctx: &CallContext,
    submission: BidSubmission,
    rng: &mut R,
) -> HandlerResult<BidId>
where
    K: KeyProvider + ?Sized,
    A: AuditSink + ?Sized,
    R: RngCore + CryptoRng,
{
    let BidSubmission {
        tender_id,
        supplier_id,
        payload,
        opening_deadline,
    } = submission;

    if opening_deadline <= ctx.now {
        return Err(BidError::InvalidDeadline {
            deadline: opening_deadline,
            at: ctx.now,
        });
    }
    if ledger.is_locked(tender_id) {
        return Err(BidError::TenderLocked {
            tender_id,
            at: ctx.now,
        });
    }

    let key = keys
        .provision(tender_id)
        .map_err(|source| BidError::KeyUnavailable {
            tender_id,
            at: ctx.now,
            source,
        })?;

    let aad = submission_aad(tender_id, &supplier_id);
    let encrypted = tender_crypto::seal(&payload, &key, &aad, ctx.now, rng).map_err(|source| {
        BidError::SealingFailed {
            tender_id,
            at: ctx.now,
            source,
        }
    })?;

    let bid_id = ledger.insert_sealed(
        tender_id,
        supplier_id,
        encrypted,
        ctx.now,
        opening_deadline,
    )?;

    info!(
        bid_id = bid_id.0,
        tender_id = tender_id.0,
        deadline = opening_deadline.as_millis(),
        "Sealed bid"
    );

    audit.record(AuditEntry {
        action: AuditAction::BidSealed,
        subject: AuditSubject::Bid {
            bid_id,
            session_id: None,
        },
        actor: ctx.actor.clone(),
        at: ctx.now,
        outcome: AuditOutcome::Success,
    });

    Ok(bid_id)
}

/// Handle a supplier withdrawal before the opening deadline.
pub fn handle_withdraw_bid<A: AuditSink + ?Sized>(
    ledger: &BidLedger,
    audit: &A,
    ctx: &CallContext,
    bid_id: BidId,
) -> HandlerResult<()> {
    let bid = load(ledger, bid_id, ctx.now)?;
    let next = bid
        .apply(
            ctx.now,
            BidEvent::Withdraw {
                by: ctx.actor.clone(),
            },
        )
        .map_err(|e| rejected(e, ctx))?;
    commit(ledger, next, BidAction::Withdraw, ctx)?;

    info!(bid_id = bid_id.0, actor = %ctx.actor, "Withdrew bid");
    audit.record(bid_entry(AuditAction::BidWithdrawn, bid_id, None, ctx, AuditOutcome::Success));
    Ok(())
}

/// Handle an administrative disqualification of a sealed bid.
pub fn handle_disqualify_bid<A: AuditSink + ?Sized>(
    ledger: &BidLedger,
    audit: &A,
    ctx: &CallContext,
    bid_id: BidId,
    reason: String,
) -> HandlerResult<()> {
    let bid = load(ledger, bid_id, ctx.now)?;
    let next = bid
        .apply(
            ctx.now,
            BidEvent::Disqualify {
                by: ctx.actor.clone(),
                reason: reason.clone(),
            },
        )
        .map_err(|e| rejected(e, ctx))?;
    commit(ledger, next, BidAction::Disqualify, ctx)?;

    info!(bid_id = bid_id.0, actor = %ctx.actor, "Disqualified bid");
    audit.record(bid_entry(
        AuditAction::BidDisqualified,
        bid_id,
        None,
        ctx,
        AuditOutcome::Failed { reason },
    ));
    Ok(())
}

/// Handle the opening of one bid within a quorate session.
///
/// The attestation must still match the session holding the bid's tender.
/// Decryption happens only after the guard passes and outside the ledger
/// lock; the plaintext is released only after the `Opened` state is
/// committed.
pub fn handle_open_bid<A: AuditSink + ?Sized>(
    ledger: &BidLedger,
    audit: &A,
    ctx: &CallContext,
    bid_id: BidId,
    key: &TenderKey,
    quorum: &QuorumAttestation,
) -> HandlerResult<OpenedBid> {
    let bid = load(ledger, bid_id, ctx.now)?;
    bid.guard_open(ctx.now, quorum)
        .map_err(|e| rejected(e, ctx))?;
    if quorum.tender_id() != bid.tender_id || !ledger.holds(quorum) {
        return Err(rejected(
            BidError::NoActiveSession {
                bid_id,
                tender_id: bid.tender_id,
                session_id: quorum.session_id(),
                at: ctx.now,
            },
            ctx,
        ));
    }

    let aad = submission_aad(bid.tender_id, &bid.supplier_id);
    let decrypted = tender_crypto::unseal(&bid.payload, key, &aad).map_err(|source| {
        warn!(
            bid_id = bid_id.0,
            session_id = quorum.session_id().0,
            error = %source,
            "Bid failed integrity verification"
        );
        BidError::IntegrityViolation {
            bid_id,
            at: ctx.now,
            source,
        }
    })?;

    let next = bid
        .apply(
            ctx.now,
            BidEvent::Open {
                by: ctx.actor.clone(),
                quorum: *quorum,
                decrypted: decrypted.clone(),
            },
        )
        .map_err(|e| rejected(e, ctx))?;
    commit(ledger, next, BidAction::Open, ctx)?;

    info!(
        bid_id = bid_id.0,
        tender_id = bid.tender_id.0,
        session_id = quorum.session_id().0,
        "Opened bid"
    );
    audit.record(bid_entry(
        AuditAction::BidOpened,
        bid_id,
        Some(quorum.session_id()),
        ctx,
        AuditOutcome::Success,
    ));

    Ok(OpenedBid {
        bid_id,
        tender_id: bid.tender_id,
        supplier_id: bid.supplier_id,
        submitted_at: bid.submitted_at,
        opened_at: ctx.now,
        payload: decrypted,
    })
}

/// Hold a bid back for manual investigation. The bid stays `Sealed`.
pub fn handle_flag_bid<A: AuditSink + ?Sized>(
    ledger: &BidLedger,
    audit: &A,
    ctx: &CallContext,
    bid_id: BidId,
    session_id: SessionId,
    reason: String,
) -> HandlerResult<()> {
    let bid = load(ledger, bid_id, ctx.now)?;
    let next = bid
        .flag(ctx.now, session_id, reason.clone())
        .map_err(|e| rejected(e, ctx))?;
    commit(ledger, next, BidAction::Flag, ctx)?;

    warn!(
        bid_id = bid_id.0,
        session_id = session_id.0,
        reason = %reason,
        "Flagged bid for manual investigation"
    );
    audit.record(bid_entry(
        AuditAction::BidFlagged,
        bid_id,
        Some(session_id),
        ctx,
        AuditOutcome::Flagged { reason },
    ));
    Ok(())
}

fn load(ledger: &BidLedger, bid_id: BidId, at: Timestamp) -> HandlerResult<SealedBid> {
    ledger
        .get(bid_id)
        .ok_or(BidError::BidNotFound { bid_id, at })
}

fn commit(
    ledger: &BidLedger,
    next: SealedBid,
    action: BidAction,
    ctx: &CallContext,
) -> HandlerResult<()> {
    ledger
        .compare_and_swap(BidStatus::Sealed, next, action, ctx.now)
        .map_err(|e| rejected(e, ctx))
}

fn rejected(error: BidError, ctx: &CallContext) -> BidError {
    warn!(actor = %ctx.actor, error = %error, "Rejected bid operation");
    error
}

fn bid_entry(
    action: AuditAction,
    bid_id: BidId,
    session_id: Option<SessionId>,
    ctx: &CallContext,
    outcome: AuditOutcome,
) -> AuditEntry {
    AuditEntry {
        action,
        subject: AuditSubject::Bid { bid_id, session_id },
        actor: ctx.actor.clone(),
        at: ctx.now,
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditLog;
    use crate::keys::InMemoryKeyProvider;
    use rand::rngs::OsRng;
    use tender_types::LineItem;

    struct Fixture {
        ledger: BidLedger,
        keys: InMemoryKeyProvider,
        audit: InMemoryAuditLog,
    }

    fn fixture() -> Fixture {
        Fixture {
            ledger: BidLedger::new(),
            keys: InMemoryKeyProvider::new(),
            audit: InMemoryAuditLog::new(),
        }
    }

    fn ctx(actor: &str, now: u64) -> CallContext {
        CallContext {
            actor: UserId::new(actor),
            now: Timestamp(now),
        }
    }

    fn submission(supplier: &str, price: u64, deadline: u64) -> BidSubmission {
        BidSubmission {
            tender_id: TenderId(1),
            supplier_id: SupplierId(supplier.into()),
            payload: BidPayload {
                total_price: price,
                currency: "EUR".into(),
                delivery_days: 14,
                line_items: vec![LineItem {
                    description: "Laptops".into(),
                    quantity: 10,
                    unit_price: price / 10,
                }],
                notes: String::new(),
            },
            opening_deadline: Timestamp(deadline),
        }
    }

    fn start_session(ledger: &BidLedger) -> QuorumAttestation {
        ledger.lock_tender(TenderId(1), SessionId(1), 3, 3).unwrap()
    }

    #[test]
    fn test_submit_seals_and_audits() {
        let f = fixture();
        let id = handle_submit_bid(
            &f.ledger,
            &f.keys,
            &f.audit,
            &ctx("portal", 100),
            submission("acme", 5_000, 1_000),
            &mut OsRng,
        )
        .unwrap();

        let bid = f.ledger.get(id).unwrap();
        assert_eq!(bid.status(), BidStatus::Sealed);
        assert_eq!(bid.submitted_at, Timestamp(100));
        assert!(bid.decrypted_payload().is_none());
        assert_eq!(f.audit.entries()[0].action, AuditAction::BidSealed);
    }

    #[test]
    fn test_submit_rejects_past_deadline() {
        let f = fixture();
        let result = handle_submit_bid(
            &f.ledger,
            &f.keys,
            &f.audit,
            &ctx("portal", 1_000),
            submission("acme", 5_000, 1_000),
            &mut OsRng,
        );
        assert!(matches!(result, Err(BidError::InvalidDeadline { .. })));
        assert!(f.ledger.is_empty());
        assert!(f.audit.is_empty());
    }

    #[test]
    fn test_open_then_second_open_is_rejected() {
        let f = fixture();
        let id = handle_submit_bid(
            &f.ledger,
            &f.keys,
            &f.audit,
            &ctx("portal", 100),
            submission("acme", 5_000, 1_000),
            &mut OsRng,
        )
        .unwrap();
        let key = f.keys.key_for(TenderId(1), None).unwrap();
        let quorum = start_session(&f.ledger);

        let opened =
            handle_open_bid(&f.ledger, &f.audit, &ctx("chair", 1_000), id, &key, &quorum).unwrap();
        assert_eq!(opened.payload.total_price, 5_000);

        let again = handle_open_bid(&f.ledger, &f.audit, &ctx("chair", 2_000), id, &key, &quorum);
        assert!(matches!(
            again,
            Err(BidError::InvalidState {
                got: BidStatus::Opened,
                ..
            })
        ));

        let stored = f.ledger.get(id).unwrap();
        assert_eq!(stored.decrypted_payload(), Some(&opened.payload));
    }

    #[test]
    fn test_open_with_wrong_key_leaves_bid_sealed() {
        let f = fixture();
        let id = handle_submit_bid(
            &f.ledger,
            &f.keys,
            &f.audit,
            &ctx("portal", 100),
            submission("acme", 5_000, 1_000),
            &mut OsRng,
        )
        .unwrap();
        let wrong = TenderKey::generate(&mut OsRng);
        let quorum = start_session(&f.ledger);

        let result = handle_open_bid(&f.ledger, &f.audit, &ctx("chair", 1_000), id, &wrong, &quorum);
        assert!(matches!(
            result,
            Err(BidError::IntegrityViolation {
                source: tender_crypto::CryptoError::AuthenticationFailed,
                ..
            })
        ));
        assert_eq!(f.ledger.get(id).unwrap().status(), BidStatus::Sealed);
    }

    #[test]
    fn test_open_requires_session_holding_the_tender() {
        let f = fixture();
        let id = handle_submit_bid(
            &f.ledger,
            &f.keys,
            &f.audit,
            &ctx("portal", 100),
            submission("acme", 5_000, 1_000),
            &mut OsRng,
        )
        .unwrap();
        let key = f.keys.key_for(TenderId(1), None).unwrap();

        // Released before opening: the attestation no longer counts.
        let released = start_session(&f.ledger);
        assert!(f.ledger.unlock_tender(TenderId(1), SessionId(1)));
        let result = handle_open_bid(&f.ledger, &f.audit, &ctx("chair", 1_000), id, &key, &released);
        assert!(matches!(
            result,
            Err(BidError::NoActiveSession {
                session_id: SessionId(1),
                ..
            })
        ));

        // Held for another tender: no use for this bid.
        let elsewhere = f.ledger.lock_tender(TenderId(2), SessionId(2), 3, 3).unwrap();
        let result = handle_open_bid(&f.ledger, &f.audit, &ctx("chair", 1_000), id, &key, &elsewhere);
        assert!(matches!(result, Err(BidError::NoActiveSession { .. })));

        assert_eq!(f.ledger.get(id).unwrap().status(), BidStatus::Sealed);
        assert_eq!(f.audit.len(), 1);

        let held = f.ledger.lock_tender(TenderId(1), SessionId(3), 3, 3).unwrap();
        handle_open_bid(&f.ledger, &f.audit, &ctx("chair", 1_000), id, &key, &held).unwrap();
    }

    #[test]
    fn test_withdraw_and_disqualify_are_audited() {
        let f = fixture();
        let a = handle_submit_bid(
            &f.ledger,
            &f.keys,
            &f.audit,
            &ctx("portal", 100),
            submission("acme", 5_000, 1_000),
            &mut OsRng,
        )
        .unwrap();
        let b = handle_submit_bid(
            &f.ledger,
            &f.keys,
            &f.audit,
            &ctx("portal", 101),
            submission("globex", 6_000, 1_000),
            &mut OsRng,
        )
        .unwrap();

        handle_withdraw_bid(&f.ledger, &f.audit, &ctx("acme", 999), a).unwrap();
        handle_disqualify_bid(&f.ledger, &f.audit, &ctx("admin", 5_000), b, "forged certificate".into())
            .unwrap();

        assert_eq!(f.ledger.get(a).unwrap().status(), BidStatus::Withdrawn);
        assert_eq!(f.ledger.get(b).unwrap().status(), BidStatus::Disqualified);

        let actions: Vec<AuditAction> = f.audit.entries().iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![
                AuditAction::BidSealed,
                AuditAction::BidSealed,
                AuditAction::BidWithdrawn,
                AuditAction::BidDisqualified
            ]
        );
    }

    #[test]
    fn test_flag_records_investigation() {
        let f = fixture();
        let id = handle_submit_bid(
            &f.ledger,
            &f.keys,
            &f.audit,
            &ctx("portal", 100),
            submission("acme", 5_000, 1_000),
            &mut OsRng,
        )
        .unwrap();

        handle_flag_bid(
            &f.ledger,
            &f.audit,
            &ctx("chair", 1_000),
            id,
            SessionId(3),
            "authentication failed".into(),
        )
        .unwrap();

        let bid = f.ledger.get(id).unwrap();
        assert_eq!(bid.status(), BidStatus::Sealed);
        assert_eq!(bid.investigation.as_ref().unwrap().session_id, SessionId(3));
        assert_eq!(f.ledger.flagged_for_tender(TenderId(1)).len(), 1);
    }
}
