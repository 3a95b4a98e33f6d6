//! Operator CLI for sealed-bid tender opening.
//!
//! This binary works on JSON files:
//! - Sealing accepted submissions into a bid ledger
//! - Running a committee-witnessed opening session for one tender
//! - Listing the bids of a tender without revealing unopened contents

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::OsRng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use tender_module::handlers::handle_submit_bid;
use tender_module::queries::handle_query;
use tender_module::{
    BidLedger, BidQuery, BidQueryResponse, CallContext, Clock, InMemoryKeyProvider,
    KeyFileEntry, LedgerSnapshot, ManualClock, OpeningConfig, RetryingKeyProvider, SystemClock,
    TracingAuditSink,
};
use tender_opening_coordinator::OpeningCoordinator;
use tender_types::{BidSubmission, CommitteeMember, TenderId, Timestamp, UserId};

#[derive(Parser)]
#[command(name = "tender-opener")]
#[command(about = "Seal tender bids and run opening sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seal accepted submissions into the ledger
    Seal {
        /// JSON array of submissions
        #[arg(long)]
        submissions: PathBuf,

        /// Ledger file (created if missing)
        #[arg(long)]
        ledger: PathBuf,

        /// Tender key file (created if missing)
        #[arg(long)]
        keys: PathBuf,

        /// Override the current time (ms since epoch)
        #[arg(long)]
        now: Option<u64>,

        #[arg(long, default_value = "submission-portal")]
        actor: String,
    },

    /// Run an opening session for one tender and print its report
    Open {
        #[arg(long)]
        ledger: PathBuf,

        #[arg(long)]
        keys: PathBuf,

        /// Tender ID
        #[arg(long)]
        tender: u64,

        /// JSON array of committee members with their attendance
        #[arg(long)]
        roster: PathBuf,

        /// Opening configuration (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the configured quorum
        #[arg(long)]
        quorum: Option<usize>,

        /// Override the current time (ms since epoch)
        #[arg(long)]
        now: Option<u64>,

        #[arg(long, default_value = "committee-chair")]
        actor: String,

        /// Also write the report to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// List the bids of a tender
    Show {
        #[arg(long)]
        ledger: PathBuf,

        /// Tender ID
        #[arg(long)]
        tender: u64,
    },
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("Failed to parse {}", path.display()))
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_string_pretty(value)?;
    std::fs::write(path, data).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

fn load_ledger(path: &Path) -> Result<BidLedger> {
    if path.exists() {
        Ok(BidLedger::restore(load_json::<LedgerSnapshot>(path)?))
    } else {
        Ok(BidLedger::new())
    }
}

fn load_keys(path: &Path) -> Result<InMemoryKeyProvider> {
    if !path.exists() {
        return Ok(InMemoryKeyProvider::new());
    }
    let entries: Vec<KeyFileEntry> = load_json(path)?;
    Ok(InMemoryKeyProvider::from_entries(&entries)?)
}

fn clock(now: Option<u64>) -> Arc<dyn Clock> {
    match now {
        Some(millis) => Arc::new(ManualClock::new(Timestamp(millis))),
        None => Arc::new(SystemClock::new()),
    }
}

fn seal(
    submissions: &Path,
    ledger_path: &Path,
    keys_path: &Path,
    now: Option<u64>,
    actor: String,
) -> Result<()> {
    let ledger = load_ledger(ledger_path)?;
    let keys = load_keys(keys_path)?;
    let audit = TracingAuditSink;
    let clock = clock(now);
    let submissions: Vec<BidSubmission> = load_json(submissions)?;

    let actor = UserId::new(actor);
    let mut sealed = 0usize;
    for submission in submissions {
        let supplier = submission.supplier_id.clone();
        let ctx = CallContext::from_clock(actor.clone(), clock.as_ref());
        match handle_submit_bid(&ledger, &keys, &audit, &ctx, submission, &mut OsRng) {
            Ok(bid_id) => {
                sealed += 1;
                println!("{bid_id}\t{supplier}");
            }
            Err(e) => warn!(supplier = %supplier, error = %e, "Submission not sealed"),
        }
    }

    save_json(ledger_path, &ledger.snapshot())?;
    save_json(keys_path, &keys.export())?;
    info!(sealed, ledger = %ledger_path.display(), "Ledger saved");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn open(
    ledger_path: &Path,
    keys_path: &Path,
    tender_id: TenderId,
    roster: &Path,
    config: Option<&Path>,
    quorum: Option<usize>,
    now: Option<u64>,
    actor: String,
    report_path: Option<&Path>,
) -> Result<()> {
    let mut config: OpeningConfig = match config {
        Some(path) => load_json(path)?,
        None => OpeningConfig::default(),
    };
    if let Some(quorum) = quorum {
        config.quorum = quorum;
    }
    config.validate()?;

    let ledger = Arc::new(BidLedger::restore(load_json::<LedgerSnapshot>(ledger_path)?));
    let keys = Arc::new(RetryingKeyProvider::new(
        load_keys(keys_path)?,
        config.key_retry.clone(),
    ));
    let clock = Arc::new(clock(now));
    let committee: Vec<CommitteeMember> = load_json(roster)?;

    let coordinator = OpeningCoordinator::new(
        ledger.clone(),
        keys,
        Arc::new(TracingAuditSink),
        clock.clone(),
        config,
    );

    let actor = UserId::new(actor);
    let mut session = coordinator.schedule(tender_id, clock.now(), committee);
    let result = coordinator.run(&mut session, &actor);

    // Persist whatever was committed, even if the session stopped part way.
    // A session that halted before opening anything has released its lock.
    save_json(ledger_path, &ledger.snapshot())?;

    let outcome = result.map_err(|e| anyhow!("Opening session {} failed: {e}", session.id()))?;
    info!(
        session_id = session.id().0,
        opened = outcome.opened.len(),
        flagged = outcome.flagged.len(),
        "Opening session completed"
    );

    let report = coordinator.report(&session);
    println!("{}", serde_json::to_string_pretty(&report)?);
    if let Some(path) = report_path {
        save_json(path, &report)?;
    }
    Ok(())
}

fn show(ledger_path: &Path, tender_id: TenderId) -> Result<()> {
    let ledger = load_ledger(ledger_path)?;
    let response = handle_query(&ledger, BidQuery::TenderBids { tender_id });
    let locked = matches!(
        handle_query(&ledger, BidQuery::IsTenderLocked { tender_id }),
        BidQueryResponse::Locked(true)
    );

    if let BidQueryResponse::Bids(bids) = response {
        info!(tender_id = tender_id.0, bids = bids.len(), locked, "Tender bids");
        println!("{}", serde_json::to_string_pretty(&bids)?);
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tender_opener=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Seal {
            submissions,
            ledger,
            keys,
            now,
            actor,
        } => seal(&submissions, &ledger, &keys, now, actor),

        Commands::Open {
            ledger,
            keys,
            tender,
            roster,
            config,
            quorum,
            now,
            actor,
            report,
        } => open(
            &ledger,
            &keys,
            TenderId(tender),
            &roster,
            config.as_deref(),
            quorum,
            now,
            actor,
            report.as_deref(),
        ),

        Commands::Show { ledger, tender } => show(&ledger, TenderId(tender)),
    }
}
