//! Sealed bid lifecycle for tender opening.
//!
//! This module implements the per-bid side of sealed-bid opening:
//!
//! - Sealing accepted submissions under the tender key
//! - The bid state machine (sealed, opened, withdrawn, disqualified)
//! - Guarded, compare-and-swap transitions on a shared ledger
//! - The collaborator seams: clock, key provider and audit sink
//!
//! # Architecture
//!
//! - `bid`: Sealed bid entity and transition function
//! - `state`: Ledger of all bids
//! - `handlers`: Guarded operations (submit, withdraw, disqualify, open, flag)
//! - `queries`: Read-only, redacted access
//! - `clock`, `keys`, `audit`: Injected collaborators
//! - `config`: Opening configuration
//! - `error`: Error types
//!
//! # Example
//!
//! ```ignore
//! use tender_module::{handlers, BidLedger, CallContext};
//!
//! let ledger = BidLedger::new();
//! let ctx = CallContext::from_clock(actor, &clock);
//!
//! // Seal a submission
//! let bid_id = handlers::handle_submit_bid(&ledger, &keys, &audit, &ctx, submission, &mut OsRng)?;
//!
//! // Later, within a quorate session
//! let opened = handlers::handle_open_bid(&ledger, &audit, &ctx, bid_id, &key, &quorum)?;
//! ```

pub mod audit;
pub mod bid;
pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod keys;
pub mod queries;
pub mod state;

pub use audit::{AuditSink, InMemoryAuditLog, TracingAuditSink};
pub use bid::{BidEvent, BidState, Investigation, QuorumAttestation, SealedBid};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigValidationError, KeyRetryConfig, OpeningConfig};
pub use error::{BidAction, BidError};
pub use handlers::{CallContext, HandlerResult, OpenedBid};
pub use keys::{
    DerivedKeyProvider, InMemoryKeyProvider, KeyError, KeyFileEntry, KeyProvider,
    RetryingKeyProvider,
};
pub use queries::{BidQuery, BidQueryResponse, BidView};
pub use state::{BidLedger, LedgerSnapshot, TenderLock};
