//! End-to-end integration tests for sealed-bid tender opening.
//!
//! These tests exercise the full bid lifecycle:
//! 1. Sealing accepted submissions under the tender key
//! 2. Deadline-gated withdrawal and opening
//! 3. Tamper detection on stored payloads
//! 4. Committee-witnessed opening sessions and their audit trail
//! 5. Concurrent transitions on the same bid

use std::sync::{Arc, Barrier};
use std::thread;

use rand::rngs::{OsRng, StdRng};
use rand::SeedableRng;

use tender_crypto::{CryptoError, TenderKey};
use tender_module::handlers::{
    handle_disqualify_bid, handle_open_bid, handle_submit_bid, handle_withdraw_bid,
};
use tender_module::{
    BidError, BidLedger, CallContext, InMemoryAuditLog, InMemoryKeyProvider, KeyError,
    KeyProvider, KeyRetryConfig, ManualClock, OpeningConfig, QuorumAttestation,
    RetryingKeyProvider,
};
use tender_opening_coordinator::{AttemptOutcome, CoordinatorError, OpeningCoordinator};
use tender_types::{
    submission_aad, AuditAction, BidId, BidPayload, BidStatus, BidSubmission, CommitteeMember,
    LineItem, SessionId, SessionStatus, SupplierId, TenderId, Timestamp, UserId,
};

const TENDER: TenderId = TenderId(42);
const DEADLINE: Timestamp = Timestamp(1_700_000_000_000);

/// Shared collaborators for one test.
struct Harness<K = InMemoryKeyProvider> {
    ledger: Arc<BidLedger>,
    keys: Arc<K>,
    audit: Arc<InMemoryAuditLog>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new() -> Self {
        Self::with_keys(InMemoryKeyProvider::new())
    }
}

impl<K: KeyProvider> Harness<K> {
    fn with_keys(keys: K) -> Self {
        Self {
            ledger: Arc::new(BidLedger::new()),
            keys: Arc::new(keys),
            audit: Arc::new(InMemoryAuditLog::new()),
            clock: Arc::new(ManualClock::new(DEADLINE.minus_millis(60_000))),
        }
    }

    fn ctx(&self, actor: &str) -> CallContext {
        CallContext::from_clock(UserId::new(actor), self.clock.as_ref())
    }

    fn submit(&self, supplier: &str, price: u64) -> BidId {
        let ctx = self.ctx("submission-portal");
        self.clock.advance(1);
        handle_submit_bid(
            self.ledger.as_ref(),
            self.keys.as_ref(),
            self.audit.as_ref(),
            &ctx,
            submission(supplier, price),
            &mut OsRng,
        )
        .unwrap()
    }

    /// Hold the tender's bid set for a quorate session, as `start` does.
    fn hold_tender(&self, session_id: SessionId) -> QuorumAttestation {
        self.ledger.lock_tender(TENDER, session_id, 3, 3).unwrap()
    }

    fn coordinator(&self) -> OpeningCoordinator<K, InMemoryAuditLog, ManualClock> {
        OpeningCoordinator::new(
            self.ledger.clone(),
            self.keys.clone(),
            self.audit.clone(),
            self.clock.clone(),
            OpeningConfig::default(),
        )
    }
}

fn submission(supplier: &str, price: u64) -> BidSubmission {
    BidSubmission {
        tender_id: TENDER,
        supplier_id: SupplierId(supplier.into()),
        payload: payload(price),
        opening_deadline: DEADLINE,
    }
}

fn payload(price: u64) -> BidPayload {
    BidPayload {
        total_price: price,
        currency: "EUR".into(),
        delivery_days: 45,
        line_items: vec![
            LineItem {
                description: "Ward beds".into(),
                quantity: 40,
                unit_price: price / 80,
            },
            LineItem {
                description: "Installation".into(),
                quantity: 1,
                unit_price: price / 2,
            },
        ],
        notes: "Prices include VAT".into(),
    }
}

fn committee() -> Vec<CommitteeMember> {
    ["chair", "legal", "finance"]
        .iter()
        .map(|role| CommitteeMember {
            user_id: UserId::new(format!("{role}-officer")),
            name: format!("{role} officer"),
            role: role.to_string(),
            attended: true,
        })
        .collect()
}

/// Sealing then unsealing with the same key returns the submitted payload.
#[test]
fn test_seal_unseal_roundtrip() {
    let mut rng = StdRng::seed_from_u64(7);
    let key = TenderKey::generate(&mut rng);
    let aad = submission_aad(TENDER, &SupplierId("acme".into()));

    for price in [0, 1, 999_999, u64::MAX] {
        let original = payload(price);
        let sealed = tender_crypto::seal(&original, &key, &aad, Timestamp(1), &mut rng).unwrap();
        let opened = tender_crypto::unseal(&sealed, &key, &aad).unwrap();
        assert_eq!(opened, original);
    }
}

/// A payload sealed under one tender key cannot be opened with another.
#[test]
fn test_wrong_key_fails_authentication() {
    let aad = submission_aad(TENDER, &SupplierId("acme".into()));
    let key1 = TenderKey::generate(&mut OsRng);
    let key2 = TenderKey::generate(&mut OsRng);
    assert_ne!(key1, key2);

    let sealed = tender_crypto::seal(&payload(10_000), &key1, &aad, Timestamp(1), &mut OsRng).unwrap();
    let result = tender_crypto::unseal(&sealed, &key2, &aad);
    assert!(result.unwrap_err().is_integrity_failure());
}

/// Opening is rejected one millisecond before the deadline and accepted at it.
#[test]
fn test_open_deadline_boundary_is_inclusive() {
    let h = Harness::new();
    let bid = h.submit("acme", 10_000);
    let key = h.keys.key_for(TENDER, None).unwrap();
    let quorum = h.hold_tender(SessionId(1));

    h.clock.set(DEADLINE.minus_millis(1));
    let early = handle_open_bid(h.ledger.as_ref(), h.audit.as_ref(), &h.ctx("chair"), bid, &key, &quorum);
    assert!(matches!(early, Err(BidError::TimingViolation { .. })));
    assert_eq!(h.ledger.get(bid).unwrap().status(), BidStatus::Sealed);

    h.clock.set(DEADLINE);
    let opened =
        handle_open_bid(h.ledger.as_ref(), h.audit.as_ref(), &h.ctx("chair"), bid, &key, &quorum)
            .unwrap();
    assert_eq!(opened.payload, payload(10_000));
    assert_eq!(opened.opened_at, DEADLINE);
}

/// A second open is rejected and leaves the recorded plaintext unchanged.
#[test]
fn test_no_double_open() {
    let h = Harness::new();
    let bid = h.submit("acme", 10_000);
    let key = h.keys.key_for(TENDER, None).unwrap();
    let quorum = h.hold_tender(SessionId(1));
    h.clock.set(DEADLINE);

    handle_open_bid(h.ledger.as_ref(), h.audit.as_ref(), &h.ctx("chair"), bid, &key, &quorum).unwrap();
    let before = h.ledger.get(bid).unwrap();

    h.clock.advance(5_000);
    let again = handle_open_bid(h.ledger.as_ref(), h.audit.as_ref(), &h.ctx("chair"), bid, &key, &quorum);
    assert!(matches!(
        again,
        Err(BidError::InvalidState {
            got: BidStatus::Opened,
            ..
        })
    ));
    assert_eq!(h.ledger.get(bid).unwrap(), before);
    assert_eq!(h.audit.entries_for_bid(bid).len(), 2);
}

/// An attestation only opens bids while its session still holds the tender.
#[test]
fn test_open_outside_session_is_rejected() {
    let h = Harness::new();
    let bid = h.submit("acme", 10_000);
    let key = h.keys.key_for(TENDER, None).unwrap();
    h.clock.set(DEADLINE);

    // A session that was aborted before opening anything.
    let coordinator = h.coordinator();
    let mut aborted = coordinator.schedule(TENDER, DEADLINE, committee());
    coordinator.start(&mut aborted, &UserId::new("chair-officer")).unwrap();
    let stale = h.ledger.attestation_for(TENDER, aborted.id()).unwrap();
    coordinator
        .abort(&mut aborted, &UserId::new("chair-officer"), "venue closed".into())
        .unwrap();

    let result = handle_open_bid(h.ledger.as_ref(), h.audit.as_ref(), &h.ctx("chair"), bid, &key, &stale);
    assert!(matches!(
        result,
        Err(BidError::NoActiveSession { session_id, .. }) if session_id == aborted.id()
    ));

    // Still refused once a different session holds the tender.
    let mut current = coordinator.schedule(TENDER, DEADLINE, committee());
    coordinator.start(&mut current, &UserId::new("chair-officer")).unwrap();
    let result = handle_open_bid(h.ledger.as_ref(), h.audit.as_ref(), &h.ctx("chair"), bid, &key, &stale);
    assert!(matches!(result, Err(BidError::NoActiveSession { .. })));
    assert_eq!(h.ledger.get(bid).unwrap().status(), BidStatus::Sealed);
    assert!(h
        .audit
        .entries_for_bid(bid)
        .iter()
        .all(|e| e.action != AuditAction::BidOpened));

    let outcome = coordinator.process(&mut current, &UserId::new("chair-officer")).unwrap();
    assert_eq!(outcome.opened[0].bid_id, bid);
}

/// Flipping any bit of a sealed payload is detected on unseal.
#[test]
fn test_every_bit_flip_is_detected() {
    let key = TenderKey::generate(&mut OsRng);
    let aad = submission_aad(TENDER, &SupplierId("acme".into()));
    let short = BidPayload {
        total_price: 1,
        currency: "EUR".into(),
        ..Default::default()
    };
    let sealed = tender_crypto::seal(&short, &key, &aad, Timestamp(1), &mut OsRng).unwrap();

    // ========================================
    // Ciphertext and tag: caught by the AEAD tag
    // ========================================

    for byte in 0..sealed.ciphertext.len() {
        for bit in 0..8 {
            let mut tampered = sealed.clone();
            tampered.ciphertext[byte] ^= 1 << bit;
            assert_eq!(
                tender_crypto::unseal(&tampered, &key, &aad),
                Err(CryptoError::AuthenticationFailed),
                "ciphertext byte {byte} bit {bit}"
            );
        }
    }
    for byte in 0..sealed.tag.len() {
        let mut tampered = sealed.clone();
        tampered.tag[byte] ^= 0x80;
        assert!(tender_crypto::unseal(&tampered, &key, &aad).is_err());
    }

    // ========================================
    // Stored digest: caught by the secondary hash
    // ========================================

    for byte in 0..sealed.plaintext_digest.len() {
        let mut tampered = sealed.clone();
        tampered.plaintext_digest[byte] ^= 0x01;
        assert_eq!(
            tender_crypto::unseal(&tampered, &key, &aad),
            Err(CryptoError::IntegrityViolation)
        );
    }
}

/// Three bids are opened in submission order with exactly five session entries.
#[test]
fn test_session_opens_in_submission_order() {
    let h = Harness::new();
    let b1 = h.submit("acme", 30_000);
    let b2 = h.submit("globex", 10_000);
    let b3 = h.submit("initech", 20_000);

    let coordinator = h.coordinator();
    let mut session = coordinator.schedule(TENDER, DEADLINE, committee());
    assert_eq!(session.bids(), &[b1, b2, b3]);

    h.clock.set(DEADLINE);
    let outcome = coordinator.run(&mut session, &UserId::new("chair-officer")).unwrap();

    let order: Vec<BidId> = outcome.opened.iter().map(|o| o.bid_id).collect();
    assert_eq!(order, vec![b1, b2, b3]);
    assert_eq!(session.status(), SessionStatus::Completed);

    let actions: Vec<AuditAction> = h
        .audit
        .entries_for_session(session.id())
        .iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(
        actions,
        vec![
            AuditAction::SessionStarted,
            AuditAction::BidOpened,
            AuditAction::BidOpened,
            AuditAction::BidOpened,
            AuditAction::SessionCompleted,
        ]
    );

    let report = coordinator.report(&session);
    let ranked: Vec<BidId> = report.bids.iter().map(|r| r.bid_id).collect();
    assert_eq!(ranked, vec![b2, b3, b1]);
    assert_eq!(report.summary.lowest_price, Some(10_000));
}

/// An integrity failure on one bid does not stop the others from opening.
#[test]
fn test_integrity_failure_is_isolated() {
    let h = Harness::new();
    let b1 = h.submit("acme", 30_000);
    let b2 = h.submit("globex", 10_000);
    let b3 = h.submit("initech", 20_000);

    // Tamper with the stored ciphertext of B2.
    let mut snapshot = h.ledger.snapshot();
    let stored = snapshot.bids.iter_mut().find(|b| b.id == b2).unwrap();
    stored.payload.ciphertext[0] ^= 0x01;
    let ledger = Arc::new(BidLedger::restore(snapshot));

    let coordinator = OpeningCoordinator::new(
        ledger.clone(),
        h.keys.clone(),
        h.audit.clone(),
        h.clock.clone(),
        OpeningConfig::default(),
    );
    let mut session = coordinator.schedule(TENDER, DEADLINE, committee());
    h.clock.set(DEADLINE);
    let outcome = coordinator.run(&mut session, &UserId::new("chair-officer")).unwrap();

    assert_eq!(session.status(), SessionStatus::Completed);
    assert_eq!(outcome.flagged, vec![b2]);
    assert_eq!(ledger.get(b1).unwrap().status(), BidStatus::Opened);
    assert_eq!(ledger.get(b3).unwrap().status(), BidStatus::Opened);

    let flagged = ledger.get(b2).unwrap();
    assert_eq!(flagged.status(), BidStatus::Sealed);
    assert!(flagged.decrypted_payload().is_none());
    assert_eq!(flagged.investigation.unwrap().session_id, session.id());
    assert!(matches!(
        session.attempts()[1].outcome,
        AttemptOutcome::Flagged { .. }
    ));

    let report = coordinator.report(&session);
    assert_eq!(report.summary.opened, 2);
    assert_eq!(report.summary.flagged, 1);
    assert_eq!(report.bids.last().unwrap().bid_id, b2);
    assert_eq!(report.bids.last().unwrap().rank, None);
}

/// Withdrawal succeeds one millisecond before the deadline and fails at it.
#[test]
fn test_withdraw_deadline_boundary() {
    let h = Harness::new();
    let early = h.submit("acme", 10_000);
    let late = h.submit("globex", 12_000);

    h.clock.set(DEADLINE.minus_millis(1));
    handle_withdraw_bid(h.ledger.as_ref(), h.audit.as_ref(), &h.ctx("acme"), early).unwrap();
    assert_eq!(h.ledger.get(early).unwrap().status(), BidStatus::Withdrawn);

    h.clock.set(DEADLINE);
    let result = handle_withdraw_bid(h.ledger.as_ref(), h.audit.as_ref(), &h.ctx("globex"), late);
    assert!(matches!(result, Err(BidError::TimingViolation { .. })));

    h.clock.advance(86_400_000);
    let result = handle_withdraw_bid(h.ledger.as_ref(), h.audit.as_ref(), &h.ctx("globex"), late);
    assert!(matches!(result, Err(BidError::TimingViolation { .. })));
    assert_eq!(h.ledger.get(late).unwrap().status(), BidStatus::Sealed);

    // The withdrawn bid is left out of the session scope.
    let coordinator = h.coordinator();
    let session = coordinator.schedule(TENDER, DEADLINE, committee());
    assert_eq!(session.bids(), &[late]);
}

/// Racing open and disqualify on one bid: exactly one wins, the other is rejected.
#[test]
fn test_concurrent_transitions_have_one_winner() {
    for _ in 0..32 {
        let h = Harness::new();
        let bid = h.submit("acme", 10_000);
        let key = h.keys.key_for(TENDER, None).unwrap();
        let quorum = h.hold_tender(SessionId(1));
        h.clock.set(DEADLINE);
        let barrier = Barrier::new(3);

        let (opened, disqualified, reopened) = thread::scope(|s| {
            let open = s.spawn(|| {
                barrier.wait();
                handle_open_bid(h.ledger.as_ref(), h.audit.as_ref(), &h.ctx("chair"), bid, &key, &quorum)
            });
            let disqualify = s.spawn(|| {
                barrier.wait();
                handle_disqualify_bid(
                    h.ledger.as_ref(),
                    h.audit.as_ref(),
                    &h.ctx("admin"),
                    bid,
                    "conflict of interest".into(),
                )
            });
            let second_open = s.spawn(|| {
                barrier.wait();
                handle_open_bid(h.ledger.as_ref(), h.audit.as_ref(), &h.ctx("legal"), bid, &key, &quorum)
            });
            (
                open.join().unwrap(),
                disqualify.join().unwrap(),
                second_open.join().unwrap(),
            )
        });

        let winners = [opened.is_ok(), disqualified.is_ok(), reopened.is_ok()]
            .iter()
            .filter(|ok| **ok)
            .count();
        assert_eq!(winners, 1);

        for loser in [opened.err(), disqualified.err(), reopened.err()].into_iter().flatten() {
            assert!(matches!(loser, BidError::InvalidState { .. }), "{loser}");
        }

        let final_status = h.ledger.get(bid).unwrap().status();
        assert!(matches!(final_status, BidStatus::Opened | BidStatus::Disqualified));
        // One sealed entry plus one transition entry.
        assert_eq!(h.audit.entries_for_bid(bid).len(), 2);
    }
}

/// Sessions for different tenders can run in parallel over one ledger.
#[test]
fn test_parallel_sessions_for_different_tenders() {
    let h = Harness::new();
    let ctx = h.ctx("submission-portal");
    for tender in 1..=4u64 {
        for supplier in ["acme", "globex"] {
            let mut sub = submission(supplier, 1_000 * tender);
            sub.tender_id = TenderId(tender);
            handle_submit_bid(
                h.ledger.as_ref(),
                h.keys.as_ref(),
                h.audit.as_ref(),
                &ctx,
                sub,
                &mut OsRng,
            )
            .unwrap();
        }
    }
    h.clock.set(DEADLINE);
    let coordinator = h.coordinator();

    let sessions: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (1..=4u64)
            .map(|tender| {
                let coordinator = &coordinator;
                s.spawn(move || {
                    let mut session = coordinator.schedule(TenderId(tender), DEADLINE, committee());
                    let outcome = coordinator
                        .run(&mut session, &UserId::new("chair-officer"))
                        .unwrap();
                    (session, outcome)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut ids: Vec<SessionId> = sessions.iter().map(|(s, _)| s.id()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);
    for (session, outcome) in &sessions {
        assert_eq!(session.status(), SessionStatus::Completed);
        assert_eq!(outcome.opened.len(), 2);
        assert!(outcome
            .opened
            .iter()
            .all(|o| o.tender_id == session.tender_id()));
    }
}

/// Key provider whose backend is down.
struct UnreachableKeys {
    inner: InMemoryKeyProvider,
}

impl KeyProvider for UnreachableKeys {
    fn provision(&self, tender_id: TenderId) -> Result<TenderKey, KeyError> {
        self.inner.provision(tender_id)
    }

    fn key_for(&self, tender_id: TenderId, _: Option<SessionId>) -> Result<TenderKey, KeyError> {
        Err(KeyError::Backend {
            tender_id,
            reason: "connection refused".into(),
        })
    }
}

/// An unresolvable key lookup halts the session before any bid is opened,
/// and `run` aborts it so the tender can be opened again later.
#[test]
fn test_key_unavailable_halts_session() {
    let keys = RetryingKeyProvider::new(
        UnreachableKeys {
            inner: InMemoryKeyProvider::new(),
        },
        KeyRetryConfig {
            max_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
        },
    );
    let h = Harness::with_keys(keys);
    let bid = h.submit("acme", 10_000);

    let coordinator = h.coordinator();
    let mut session = coordinator.schedule(TENDER, DEADLINE, committee());
    h.clock.set(DEADLINE);
    let chair = UserId::new("chair-officer");

    let result = coordinator.run(&mut session, &chair);
    assert!(matches!(
        result,
        Err(CoordinatorError::KeyUnavailable {
            source: KeyError::Unavailable { attempts: 2, .. },
            ..
        })
    ));
    assert_eq!(session.status(), SessionStatus::Aborted);
    assert_eq!(h.ledger.get(bid).unwrap().status(), BidStatus::Sealed);
    assert!(session.attempts().is_empty());
    assert!(!h.ledger.is_locked(TENDER));

    let actions: Vec<AuditAction> = h
        .audit
        .entries_for_session(session.id())
        .iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(
        actions,
        vec![AuditAction::SessionStarted, AuditAction::SessionAborted]
    );

    // Driven step by step, the halted session stays in progress instead.
    let mut stepped = coordinator.schedule(TENDER, DEADLINE, committee());
    coordinator.start(&mut stepped, &chair).unwrap();
    assert!(coordinator.process(&mut stepped, &chair).is_err());
    assert_eq!(stepped.status(), SessionStatus::InProgress);
    assert!(h.ledger.is_locked(TENDER));
    coordinator
        .abort(&mut stepped, &chair, "key custody offline".into())
        .unwrap();
    assert!(!h.ledger.is_locked(TENDER));
}
