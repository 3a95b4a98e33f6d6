//! Append-only audit trail of bid and session transitions.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use tender_types::{AuditEntry, AuditSubject, BidId, SessionId};

/// Receiver of audit entries. Must be safe for concurrent use.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

impl<S: AuditSink + ?Sized> AuditSink for Arc<S> {
    fn record(&self, entry: AuditEntry) {
        (**self).record(entry)
    }
}

/// Audit log kept in memory, in arrival order.
#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all entries recorded so far.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Entries about one bid, whichever session they happened in.
    pub fn entries_for_bid(&self, bid_id: BidId) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| matches!(e.subject, AuditSubject::Bid { bid_id: id, .. } if id == bid_id))
            .cloned()
            .collect()
    }

    /// Entries produced by one session: its own transitions and those of its bids.
    pub fn entries_for_session(&self, session_id: SessionId) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| match e.subject {
                AuditSubject::Session { session_id: id, .. } => id == session_id,
                AuditSubject::Bid {
                    session_id: Some(id),
                    ..
                } => id == session_id,
                AuditSubject::Bid { session_id: None, .. } => false,
            })
            .cloned()
            .collect()
    }
}

impl AuditSink for InMemoryAuditLog {
    fn record(&self, entry: AuditEntry) {
        self.entries.lock().push(entry);
    }
}

/// Audit sink emitting every entry as a structured tracing event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: AuditEntry) {
        info!(
            target: "tender_audit",
            action = ?entry.action,
            subject = ?entry.subject,
            actor = %entry.actor,
            at = entry.at.as_millis(),
            outcome = ?entry.outcome,
            "audit"
        );
    }
}
