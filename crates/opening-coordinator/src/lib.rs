//! Bid Opening Session Coordinator
//!
//! This module drives the witnessed opening of a tender's sealed bids by:
//! 1. Scheduling a session over the tender's sealed bids
//! 2. Starting it once the committee quorum is present and every opening
//!    deadline has passed
//! 3. Opening the bids one by one in submission order, isolating integrity
//!    failures per bid
//! 4. Completing (or aborting) the session and producing the opening report

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use tender_module::handlers::{handle_flag_bid, handle_open_bid};
use tender_module::{
    AuditSink, BidError, BidLedger, CallContext, Clock, KeyError, KeyProvider, OpenedBid,
    OpeningConfig, SealedBid,
};
use tender_types::{
    AuditAction, AuditEntry, AuditOutcome, AuditSubject, BidId, BidStatus, CommitteeMember,
    OpeningReport, SessionId, SessionStatus, TenderId, Timestamp, UserId,
};

pub mod report;
pub mod session;

pub use report::build_report;
pub use session::{AttemptOutcome, BidAttempt, BidOpeningSession, SessionEvent, SessionState};

/// Errors that can occur during session coordination.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("Invalid state for {session_id} at {at}. Expected: {expected}, Got: {got}")]
    InvalidSessionState {
        session_id: SessionId,
        expected: SessionStatus,
        got: SessionStatus,
        at: Timestamp,
    },

    #[error("Quorum not met for {session_id} at {at}: {attended} attending, {required} required")]
    QuorumNotMet {
        session_id: SessionId,
        attended: usize,
        required: usize,
        at: Timestamp,
    },

    #[error("Cannot start {session_id} at {now}: {bid_id} opens at {deadline}")]
    TimingViolation {
        session_id: SessionId,
        bid_id: BidId,
        now: Timestamp,
        deadline: Timestamp,
    },

    #[error("{tender_id} is already being opened, cannot start {session_id} (at {at})")]
    TenderBusy {
        session_id: SessionId,
        tender_id: TenderId,
        at: Timestamp,
    },

    #[error("{session_id} no longer holds the bid set of {tender_id} (at {at})")]
    LockLost {
        session_id: SessionId,
        tender_id: TenderId,
        at: Timestamp,
    },

    #[error("Key unavailable for {session_id} at {at}: {source}")]
    KeyUnavailable {
        session_id: SessionId,
        at: Timestamp,
        source: KeyError,
    },

    #[error("Cannot complete {session_id} at {at}: {remaining} bids not yet attempted")]
    Incomplete {
        session_id: SessionId,
        remaining: usize,
        at: Timestamp,
    },

    #[error("Cannot abort {session_id} at {at}: {opened} bids already opened")]
    AbortAfterOpen {
        session_id: SessionId,
        opened: usize,
        at: Timestamp,
    },

    #[error(transparent)]
    Bid(#[from] BidError),
}

/// Result of processing a session's bids.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOutcome {
    /// Plaintext of every bid opened in this pass, in opening order
    pub opened: Vec<OpenedBid>,
    pub flagged: Vec<BidId>,
    pub skipped: Vec<BidId>,
    pub rejected: Vec<BidId>,
}

impl SessionOutcome {
    pub fn attempted(&self) -> usize {
        self.opened.len() + self.flagged.len() + self.skipped.len() + self.rejected.len()
    }
}

/// Coordinator for bid opening sessions.
///
/// Holds no per-session state: sessions are owned by the caller, so
/// sessions for different tenders can be driven from different threads.
pub struct OpeningCoordinator<K, A, C> {
    ledger: Arc<BidLedger>,
    keys: Arc<K>,
    audit: Arc<A>,
    clock: Arc<C>,
    config: OpeningConfig,
}

impl<K, A, C> OpeningCoordinator<K, A, C>
where
    K: KeyProvider,
    A: AuditSink,
    C: Clock,
{
    /// Create a new coordinator.
    pub fn new(
        ledger: Arc<BidLedger>,
        keys: Arc<K>,
        audit: Arc<A>,
        clock: Arc<C>,
        config: OpeningConfig,
    ) -> Self {
        Self {
            ledger,
            keys,
            audit,
            clock,
            config,
        }
    }

    pub fn ledger(&self) -> &Arc<BidLedger> {
        &self.ledger
    }

    pub fn config(&self) -> &OpeningConfig {
        &self.config
    }

    /// Schedule a session over the tender's currently sealed bids.
    ///
    /// Session IDs come from the ledger, so they stay unique across restarts.
    pub fn schedule(
        &self,
        tender_id: TenderId,
        scheduled_at: Timestamp,
        committee: Vec<CommitteeMember>,
    ) -> BidOpeningSession {
        let session_id = self.ledger.allocate_session_id();
        let bids = self.openable_bids(tender_id);

        info!(
            session_id = session_id.0,
            tender_id = tender_id.0,
            bids = bids.len(),
            committee = committee.len(),
            "Scheduled opening session"
        );

        BidOpeningSession::new(
            session_id,
            tender_id,
            scheduled_at,
            committee,
            bids.iter().map(|b| b.id).collect(),
        )
    }

    /// Start a pending session.
    ///
    /// Locks the tender's bid set, so the scope is fixed here: bids sealed
    /// after scheduling are included, bids withdrawn since are dropped.
    pub fn start(
        &self,
        session: &mut BidOpeningSession,
        actor: &UserId,
    ) -> Result<(), CoordinatorError> {
        let now = self.clock.now();
        session.require_status(SessionStatus::Pending, now)?;

        let attended = session.attendance();
        if attended < self.config.quorum {
            warn!(
                session_id = session.id().0,
                attended,
                required = self.config.quorum,
                "Quorum not met"
            );
            return Err(CoordinatorError::QuorumNotMet {
                session_id: session.id(),
                attended,
                required: self.config.quorum,
                at: now,
            });
        }

        let tender_id = session.tender_id();
        if self
            .ledger
            .lock_tender(tender_id, session.id(), attended, self.config.quorum)
            .is_none()
        {
            return Err(CoordinatorError::TenderBusy {
                session_id: session.id(),
                tender_id,
                at: now,
            });
        }

        let bids = self.openable_bids(tender_id);
        if let Some(early) = bids.iter().find(|b| now < b.opening_deadline) {
            self.ledger.unlock_tender(tender_id, session.id());
            warn!(
                session_id = session.id().0,
                bid_id = early.id.0,
                now = now.as_millis(),
                deadline = early.opening_deadline.as_millis(),
                "Opening deadline not reached"
            );
            return Err(CoordinatorError::TimingViolation {
                session_id: session.id(),
                bid_id: early.id,
                now,
                deadline: early.opening_deadline,
            });
        }

        session.set_bids(bids.iter().map(|b| b.id).collect());
        session.transition(now, SessionEvent::Start)?;

        info!(
            session_id = session.id().0,
            tender_id = tender_id.0,
            bids = session.bids().len(),
            attended,
            "Started opening session"
        );
        self.audit.record(session_entry(
            AuditAction::SessionStarted,
            session,
            actor,
            now,
            AuditOutcome::Success,
        ));
        Ok(())
    }

    /// Open every not yet attempted bid of an in-progress session.
    ///
    /// An integrity failure flags the bid and moves on. A missing tender key
    /// stops the whole session before any bid is touched; the session stays
    /// in progress so it can be retried or aborted.
    /// [`run`](Self::run) aborts it instead.
    pub fn process(
        &self,
        session: &mut BidOpeningSession,
        actor: &UserId,
    ) -> Result<SessionOutcome, CoordinatorError> {
        let now = self.clock.now();
        session.require_status(SessionStatus::InProgress, now)?;

        let quorum = self
            .ledger
            .attestation_for(session.tender_id(), session.id())
            .ok_or(CoordinatorError::LockLost {
                session_id: session.id(),
                tender_id: session.tender_id(),
                at: now,
            })?;

        let key = self
            .keys
            .key_for(session.tender_id(), Some(session.id()))
            .map_err(|source| {
                warn!(
                    session_id = session.id().0,
                    tender_id = session.tender_id().0,
                    error = %source,
                    "Tender key unavailable, session halted"
                );
                CoordinatorError::KeyUnavailable {
                    session_id: session.id(),
                    at: now,
                    source,
                }
            })?;

        let mut outcome = SessionOutcome::default();

        for bid_id in session.remaining() {
            let ctx = CallContext::from_clock(actor.clone(), self.clock.as_ref());
            let attempt = match handle_open_bid(
                self.ledger.as_ref(),
                self.audit.as_ref(),
                &ctx,
                bid_id,
                &key,
                &quorum,
            ) {
                Ok(opened) => {
                    outcome.opened.push(opened);
                    AttemptOutcome::Opened
                }
                Err(error) if error.is_integrity_violation() => {
                    let reason = error.to_string();
                    match handle_flag_bid(
                        self.ledger.as_ref(),
                        self.audit.as_ref(),
                        &ctx,
                        bid_id,
                        session.id(),
                        reason.clone(),
                    ) {
                        Ok(()) => {
                            outcome.flagged.push(bid_id);
                            AttemptOutcome::Flagged { reason }
                        }
                        Err(flag_error) => {
                            outcome.rejected.push(bid_id);
                            AttemptOutcome::Rejected {
                                reason: flag_error.to_string(),
                            }
                        }
                    }
                }
                Err(BidError::InvalidState { got, .. })
                    if matches!(got, BidStatus::Withdrawn | BidStatus::Disqualified) =>
                {
                    debug!(bid_id = bid_id.0, status = %got, "Skipping bid no longer sealed");
                    outcome.skipped.push(bid_id);
                    AttemptOutcome::Skipped { status: got }
                }
                Err(error) => {
                    outcome.rejected.push(bid_id);
                    AttemptOutcome::Rejected {
                        reason: error.to_string(),
                    }
                }
            };

            session.record_attempt(BidAttempt {
                bid_id,
                at: ctx.now,
                outcome: attempt,
            });
        }

        info!(
            session_id = session.id().0,
            opened = outcome.opened.len(),
            flagged = outcome.flagged.len(),
            skipped = outcome.skipped.len(),
            rejected = outcome.rejected.len(),
            "Processed opening session"
        );
        Ok(outcome)
    }

    /// Complete an in-progress session once every bid has been attempted.
    pub fn complete(
        &self,
        session: &mut BidOpeningSession,
        actor: &UserId,
    ) -> Result<(), CoordinatorError> {
        let now = self.clock.now();
        session.require_status(SessionStatus::InProgress, now)?;

        let remaining = session.remaining().len();
        if remaining > 0 {
            return Err(CoordinatorError::Incomplete {
                session_id: session.id(),
                remaining,
                at: now,
            });
        }

        session.transition(now, SessionEvent::Complete)?;

        info!(
            session_id = session.id().0,
            tender_id = session.tender_id().0,
            opened = session.opened_count(),
            "Completed opening session"
        );
        self.audit.record(session_entry(
            AuditAction::SessionCompleted,
            session,
            actor,
            now,
            AuditOutcome::Success,
        ));
        Ok(())
    }

    /// Abort a session that has not opened any bid yet.
    pub fn abort(
        &self,
        session: &mut BidOpeningSession,
        actor: &UserId,
        reason: String,
    ) -> Result<(), CoordinatorError> {
        let now = self.clock.now();
        let was_started = session.status() == SessionStatus::InProgress;

        let opened = session.opened_count();
        if was_started && opened > 0 {
            return Err(CoordinatorError::AbortAfterOpen {
                session_id: session.id(),
                opened,
                at: now,
            });
        }

        session.transition(
            now,
            SessionEvent::Abort {
                reason: reason.clone(),
            },
        )?;
        if was_started {
            self.ledger.unlock_tender(session.tender_id(), session.id());
        }

        warn!(session_id = session.id().0, reason = %reason, "Aborted opening session");
        self.audit.record(session_entry(
            AuditAction::SessionAborted,
            session,
            actor,
            now,
            AuditOutcome::Failed { reason },
        ));
        Ok(())
    }

    /// Start, process and complete a session in one go.
    ///
    /// If processing halts before any bid was opened, the session is aborted
    /// so the tender is not left locked.
    pub fn run(
        &self,
        session: &mut BidOpeningSession,
        actor: &UserId,
    ) -> Result<SessionOutcome, CoordinatorError> {
        self.start(session, actor)?;
        let outcome = match self.process(session, actor) {
            Ok(outcome) => outcome,
            Err(error) if session.opened_count() == 0 => {
                if let Err(abort_error) = self.abort(session, actor, error.to_string()) {
                    warn!(
                        session_id = session.id().0,
                        error = %abort_error,
                        "Could not abort halted session"
                    );
                }
                return Err(error);
            }
            Err(error) => return Err(error),
        };
        self.complete(session, actor)?;
        Ok(outcome)
    }

    /// Build the opening report from the current ledger state.
    pub fn report(&self, session: &BidOpeningSession) -> OpeningReport {
        let bids: Vec<SealedBid> = session
            .bids()
            .iter()
            .filter_map(|id| self.ledger.get(*id))
            .collect();
        build_report(session, &bids)
    }

    fn openable_bids(&self, tender_id: TenderId) -> Vec<SealedBid> {
        self.ledger
            .bids_for_tender(tender_id)
            .into_iter()
            .filter(|b| b.status() == BidStatus::Sealed && !b.is_flagged())
            .collect()
    }
}

fn session_entry(
    action: AuditAction,
    session: &BidOpeningSession,
    actor: &UserId,
    at: Timestamp,
    outcome: AuditOutcome,
) -> AuditEntry {
    AuditEntry {
        action,
        subject: AuditSubject::Session {
            session_id: session.id(),
            tender_id: session.tender_id(),
        },
        actor: actor.clone(),
        at,
        outcome,
    }
}
