//! Opening session entity and its state machine.
//!
//! ```text
//!   PENDING ──start──▶ IN_PROGRESS ──complete──▶ COMPLETED
//!      │                    │
//!      └──abort──┐   ┌──abort (nothing opened yet)
//!                ▼   ▼
//!               ABORTED
//! ```

use serde::{Deserialize, Serialize};

use tender_types::{
    attendance, BidId, BidStatus, CommitteeMember, SessionId, SessionStatus, TenderId, Timestamp,
    UserId,
};

use crate::CoordinatorError;

/// Lifecycle state of an opening session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    InProgress {
        started_at: Timestamp,
    },
    Completed {
        started_at: Timestamp,
        completed_at: Timestamp,
    },
    Aborted {
        started_at: Option<Timestamp>,
        at: Timestamp,
        reason: String,
    },
}

/// Input to the session state machine.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    Start,
    Complete,
    Abort { reason: String },
}

impl SessionState {
    pub fn status(&self) -> SessionStatus {
        match self {
            SessionState::Pending => SessionStatus::Pending,
            SessionState::InProgress { .. } => SessionStatus::InProgress,
            SessionState::Completed { .. } => SessionStatus::Completed,
            SessionState::Aborted { .. } => SessionStatus::Aborted,
        }
    }

    /// Next state for `event`, or the rejection if the event is illegal here.
    pub fn apply(
        &self,
        session_id: SessionId,
        now: Timestamp,
        event: SessionEvent,
    ) -> Result<SessionState, CoordinatorError> {
        match (self, event) {
            (SessionState::Pending, SessionEvent::Start) => {
                Ok(SessionState::InProgress { started_at: now })
            }
            (SessionState::Pending, SessionEvent::Abort { reason }) => Ok(SessionState::Aborted {
                started_at: None,
                at: now,
                reason,
            }),
            (SessionState::InProgress { started_at }, SessionEvent::Complete) => {
                Ok(SessionState::Completed {
                    started_at: *started_at,
                    completed_at: now,
                })
            }
            (SessionState::InProgress { started_at }, SessionEvent::Abort { reason }) => {
                Ok(SessionState::Aborted {
                    started_at: Some(*started_at),
                    at: now,
                    reason,
                })
            }
            (SessionState::Pending, SessionEvent::Complete) => Err(CoordinatorError::InvalidSessionState {
                session_id,
                expected: SessionStatus::InProgress,
                got: SessionStatus::Pending,
                at: now,
            }),
            (SessionState::InProgress { .. }, SessionEvent::Start) => {
                Err(CoordinatorError::InvalidSessionState {
                    session_id,
                    expected: SessionStatus::Pending,
                    got: SessionStatus::InProgress,
                    at: now,
                })
            }
            (SessionState::Completed { .. } | SessionState::Aborted { .. }, event) => {
                let expected = match event {
                    SessionEvent::Start => SessionStatus::Pending,
                    SessionEvent::Complete | SessionEvent::Abort { .. } => SessionStatus::InProgress,
                };
                Err(CoordinatorError::InvalidSessionState {
                    session_id,
                    expected,
                    got: self.status(),
                    at: now,
                })
            }
        }
    }
}

/// What happened to one bid during processing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Opened,
    /// Integrity check failed; held back for manual investigation
    Flagged { reason: String },
    /// Bid left `Sealed` before its turn (withdrawn or disqualified)
    Skipped { status: BidStatus },
    /// Guard rejected the bid for another reason
    Rejected { reason: String },
}

/// Record of one processed bid.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidAttempt {
    pub bid_id: BidId,
    pub at: Timestamp,
    pub outcome: AttemptOutcome,
}

/// A scheduled, witnessed opening of all sealed bids of one tender.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidOpeningSession {
    id: SessionId,
    tender_id: TenderId,
    scheduled_at: Timestamp,
    state: SessionState,
    committee: Vec<CommitteeMember>,
    /// Bids in opening order: ascending submission time, ties by id
    bids: Vec<BidId>,
    attempts: Vec<BidAttempt>,
}

impl BidOpeningSession {
    pub(crate) fn new(
        id: SessionId,
        tender_id: TenderId,
        scheduled_at: Timestamp,
        committee: Vec<CommitteeMember>,
        bids: Vec<BidId>,
    ) -> Self {
        Self {
            id,
            tender_id,
            scheduled_at,
            state: SessionState::Pending,
            committee,
            bids,
            attempts: Vec::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn tender_id(&self) -> TenderId {
        self.tender_id
    }

    pub fn scheduled_at(&self) -> Timestamp {
        self.scheduled_at
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn status(&self) -> SessionStatus {
        self.state.status()
    }

    pub fn started_at(&self) -> Option<Timestamp> {
        match &self.state {
            SessionState::Pending => None,
            SessionState::InProgress { started_at } | SessionState::Completed { started_at, .. } => {
                Some(*started_at)
            }
            SessionState::Aborted { started_at, .. } => *started_at,
        }
    }

    pub fn completed_at(&self) -> Option<Timestamp> {
        match &self.state {
            SessionState::Completed { completed_at, .. } => Some(*completed_at),
            _ => None,
        }
    }

    pub fn committee(&self) -> &[CommitteeMember] {
        &self.committee
    }

    pub fn attendance(&self) -> usize {
        attendance(&self.committee)
    }

    pub fn bids(&self) -> &[BidId] {
        &self.bids
    }

    pub fn attempts(&self) -> &[BidAttempt] {
        &self.attempts
    }

    pub fn opened_count(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.outcome == AttemptOutcome::Opened)
            .count()
    }

    pub fn is_attempted(&self, bid_id: BidId) -> bool {
        self.attempts.iter().any(|a| a.bid_id == bid_id)
    }

    /// Bids in scope that have not been processed yet.
    pub fn remaining(&self) -> Vec<BidId> {
        self.bids
            .iter()
            .copied()
            .filter(|id| !self.is_attempted(*id))
            .collect()
    }

    /// Update a member's attendance while the session is still pending.
    pub fn mark_attendance(
        &mut self,
        user_id: &UserId,
        attended: bool,
        now: Timestamp,
    ) -> Result<bool, CoordinatorError> {
        self.require_status(SessionStatus::Pending, now)?;
        match self.committee.iter_mut().find(|m| &m.user_id == user_id) {
            Some(member) => {
                member.attended = attended;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub(crate) fn transition(
        &mut self,
        now: Timestamp,
        event: SessionEvent,
    ) -> Result<(), CoordinatorError> {
        self.state = self.state.apply(self.id, now, event)?;
        Ok(())
    }

    pub(crate) fn set_bids(&mut self, bids: Vec<BidId>) {
        self.bids = bids;
    }

    pub(crate) fn record_attempt(&mut self, attempt: BidAttempt) {
        self.attempts.push(attempt);
    }

    pub(crate) fn require_status(
        &self,
        expected: SessionStatus,
        now: Timestamp,
    ) -> Result<(), CoordinatorError> {
        let got = self.status();
        if got != expected {
            return Err(CoordinatorError::InvalidSessionState {
                session_id: self.id,
                expected,
                got,
                at: now,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> BidOpeningSession {
        BidOpeningSession::new(
            SessionId(1),
            TenderId(1),
            Timestamp(0),
            vec![CommitteeMember {
                user_id: UserId::new("u1"),
                name: "Ada".into(),
                role: "chair".into(),
                attended: false,
            }],
            vec![BidId(1), BidId(2)],
        )
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut s = session();
        s.transition(Timestamp(10), SessionEvent::Start).unwrap();
        assert_eq!(s.started_at(), Some(Timestamp(10)));

        s.transition(Timestamp(20), SessionEvent::Complete).unwrap();
        assert_eq!(s.status(), SessionStatus::Completed);
        assert_eq!(s.completed_at(), Some(Timestamp(20)));
    }

    #[test]
    fn test_completed_session_is_immutable() {
        let mut s = session();
        s.transition(Timestamp(10), SessionEvent::Start).unwrap();
        s.transition(Timestamp(20), SessionEvent::Complete).unwrap();

        for event in [
            SessionEvent::Start,
            SessionEvent::Complete,
            SessionEvent::Abort {
                reason: "late".into(),
            },
        ] {
            assert!(matches!(
                s.transition(Timestamp(30), event),
                Err(CoordinatorError::InvalidSessionState {
                    got: SessionStatus::Completed,
                    ..
                })
            ));
        }
        assert!(s
            .mark_attendance(&UserId::new("u1"), true, Timestamp(30))
            .is_err());
        assert_eq!(s.completed_at(), Some(Timestamp(20)));
    }

    #[test]
    fn test_complete_requires_start() {
        let mut s = session();
        assert!(matches!(
            s.transition(Timestamp(1), SessionEvent::Complete),
            Err(CoordinatorError::InvalidSessionState {
                expected: SessionStatus::InProgress,
                got: SessionStatus::Pending,
                ..
            })
        ));
    }

    #[test]
    fn test_mark_attendance_while_pending() {
        let mut s = session();
        assert_eq!(s.attendance(), 0);
        assert!(s.mark_attendance(&UserId::new("u1"), true, Timestamp(0)).unwrap());
        assert!(!s.mark_attendance(&UserId::new("nobody"), true, Timestamp(0)).unwrap());
        assert_eq!(s.attendance(), 1);
    }

    #[test]
    fn test_remaining_tracks_attempts() {
        let mut s = session();
        s.record_attempt(BidAttempt {
            bid_id: BidId(1),
            at: Timestamp(5),
            outcome: AttemptOutcome::Opened,
        });
        assert_eq!(s.remaining(), vec![BidId(2)]);
        assert_eq!(s.opened_count(), 1);
    }
}
