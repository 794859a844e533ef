//! Long-running background task that polls the ledger for inbound transfers
//! and settles each one exactly once: pay the project owner, or refund the
//! sender when the transfer cannot be attributed.
//!
//! ## Tick
//!
//! 1. Fetch events observed since `max(now - lookback, cursor time)`, oldest
//!    first. The ledger only answers time-bounded queries, so an event that
//!    ages out of the lookback window before a tick sees it is never settled.
//! 2. Resume strictly after the cursor event when it is in the list,
//!    otherwise from the start of the list.
//! 3. Skip non-positive amounts, empty memos, our own outputs, and events
//!    already in the `snapshots` table.
//! 4. Settle the event, record its outcome, advance the cursor.
//!
//! Every outbound transfer is keyed by the event id, so an event replayed
//! after a crash mid-settlement lands on the same ledger requests.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::engine::Engine;
use crate::errors::{Result, SettlementError};
use crate::ids;
use crate::ledger::Order;
use crate::models::{DonationRecord, InboundEvent, Outcome, Project, TransferRequest, User};

pub const REFUND_TAG: &str = "refund";
pub const DONATION_TAG: &str = "donate";
pub const PAYOUT_TAG: &str = "donate-transfer";

pub const REFUND_MEMO: &str = "Donate failed";
pub const PAYOUT_MEMO: &str = "Donate for you";

#[derive(Debug, Clone)]
pub struct Settings {
    pub poll_interval: Duration,
    pub lookback: Duration,
    pub events_per_page: u32,
    pub tick_deadline: Duration,
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            lookback: Duration::from_secs(config.lookback_secs),
            events_per_page: config.events_per_page,
            tick_deadline: Duration::from_secs(config.tick_deadline_secs),
        }
    }
}

pub struct ReconcilerState {
    pub pool: SqlitePool,
    pub engine: Arc<Engine>,
    pub settings: Settings,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub fetched: usize,
    pub skipped: usize,
    pub donated: usize,
    pub refunded: usize,
    pub failed: usize,
}

impl TickReport {
    fn record(&mut self, outcome: Option<Outcome>) {
        match outcome {
            None => self.skipped += 1,
            Some(Outcome::Donated) => self.donated += 1,
            Some(Outcome::Refunded) => self.refunded += 1,
            Some(Outcome::Failed) => self.failed += 1,
        }
    }

    pub fn settled(&self) -> usize {
        self.donated + self.refunded + self.failed
    }
}

/// Run the reconciliation loop until `cancel` fires. Tick errors are logged
/// and the next tick starts after the poll interval.
pub async fn run(state: Arc<ReconcilerState>, cancel: CancellationToken) {
    info!(
        "Reconciler starting for {} (every {:?}, lookback {:?})",
        state.engine.identity(),
        state.settings.poll_interval,
        state.settings.lookback
    );

    loop {
        match tick_with_deadline(&state).await {
            Ok(report) if report.settled() > 0 => info!(
                "Tick settled {} events ({} donated, {} refunded, {} failed, {} skipped)",
                report.settled(),
                report.donated,
                report.refunded,
                report.failed,
                report.skipped
            ),
            Ok(report) => debug!("Tick fetched {} events, nothing to settle", report.fetched),
            Err(e) => error!("Reconciliation tick failed: {e}"),
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Reconciler cancelled");
                return;
            }
            _ = tokio::time::sleep(state.settings.poll_interval) => {}
        }
    }
}

/// One tick, abandoned if it outlives the configured deadline.
pub async fn tick_with_deadline(state: &ReconcilerState) -> Result<TickReport> {
    let deadline = state.settings.tick_deadline;
    tokio::time::timeout(deadline, tick(state))
        .await
        .map_err(|_| SettlementError::DeadlineExceeded(deadline))?
}

pub async fn tick(state: &ReconcilerState) -> Result<TickReport> {
    let cursor = db::get_cursor(&state.pool).await?;

    let lookback = chrono::Duration::seconds(state.settings.lookback.as_secs() as i64);
    let window_start = Utc::now() - lookback;
    let since = Utc
        .timestamp_opt(cursor.last_observed_at, 0)
        .single()
        .filter(|at| *at > window_start)
        .unwrap_or(window_start);

    let mut events = state
        .engine
        .ledger()
        .list_inbound_events(None, since, Order::Asc, state.settings.events_per_page)
        .await?;
    // Stable: events sharing a timestamp keep ledger order.
    events.sort_by_key(|e| e.created_at);

    let start = cursor
        .last_snapshot_id
        .as_deref()
        .and_then(|id| events.iter().position(|e| e.snapshot_id == id))
        .map_or(0, |i| i + 1);

    let mut report = TickReport {
        fetched: events.len(),
        ..TickReport::default()
    };

    for event in &events[start..] {
        let span = info_span!("snapshot", id = %event.snapshot_id);
        let outcome = handle_event(state, event).instrument(span).await?;
        report.record(outcome);

        db::save_cursor(&state.pool, &event.snapshot_id, event.created_at.timestamp()).await?;
    }

    Ok(report)
}

/// Settle one event unless it is filtered or already recorded. Only
/// persistence failures before settlement are returned as errors; once value
/// may have moved, the event counts as handled and the cursor moves past it.
async fn handle_event(state: &ReconcilerState, event: &InboundEvent) -> Result<Option<Outcome>> {
    if !is_actionable(event, state.engine.identity()) {
        debug!("Skipping {} ({} {})", event.snapshot_id, event.amount, event.asset_id);
        return Ok(None);
    }
    if db::snapshot_exists(&state.pool, &event.snapshot_id).await? {
        debug!("Snapshot {} already settled", event.snapshot_id);
        return Ok(None);
    }

    let outcome = settle(state, event).await?;
    if let Err(e) = db::insert_snapshot(&state.pool, event, outcome).await {
        error!(
            "Recording snapshot {} as {} failed: {e}",
            event.snapshot_id,
            outcome.as_str()
        );
    }
    info!(
        opponent = %event.opponent_id,
        asset = %event.asset_id,
        amount = %event.amount,
        outcome = outcome.as_str(),
        "Snapshot settled"
    );
    Ok(Some(outcome))
}

fn is_actionable(event: &InboundEvent, identity: &str) -> bool {
    event.amount > Decimal::ZERO
        && !event.memo.is_empty()
        && event.opponent_id != identity
}

/// Memo is the hex encoding of a project id's textual form.
pub fn decode_memo(memo: &str) -> Result<Uuid> {
    let bytes = hex::decode(memo)
        .map_err(|_| SettlementError::InvalidMemo(format!("{memo:?} is not hex")))?;
    let text = String::from_utf8(bytes)
        .map_err(|_| SettlementError::InvalidMemo(format!("{memo:?} is not utf-8")))?;
    match Uuid::parse_str(text.trim()) {
        Ok(pid) if !pid.is_nil() => Ok(pid),
        _ => Err(SettlementError::InvalidMemo(format!("{text:?} is not a project id"))),
    }
}

async fn resolve_project(pool: &SqlitePool, memo: &str) -> Result<Project> {
    let pid = decode_memo(memo)?.to_string();
    db::get_project(pool, &pid)
        .await?
        .ok_or(SettlementError::ProjectNotFound(pid))
}

async fn settle(state: &ReconcilerState, event: &InboundEvent) -> Result<Outcome> {
    let engine = &state.engine;

    let project = match resolve_project(&state.pool, &event.memo).await {
        Ok(project) => project,
        Err(e @ (SettlementError::InvalidMemo(_) | SettlementError::ProjectNotFound(_))) => {
            warn!("Cannot attribute donation: {e}");
            return Ok(refund(engine, event).await);
        }
        Err(e) => return Err(e),
    };

    let donor = match engine.ledger().read_profile(&event.opponent_id).await {
        Ok(profile) => profile,
        Err(e) => {
            warn!("Reading donor {} failed: {e}", event.opponent_id);
            return Ok(refund(engine, event).await);
        }
    };

    // Bookkeeping: each step stands alone and only logs on failure.
    if let Err(e) = db::upsert_user(&state.pool, &User::from(&donor)).await {
        error!("Saving donor {} failed: {e}", donor.identity_number);
    }

    let donation = DonationRecord {
        id: ids::derive_key(&[&event.snapshot_id, DONATION_TAG]),
        pid: project.pid.clone(),
        identity_number: donor.identity_number.clone(),
        asset_id: event.asset_id.clone(),
        amount: event.amount.to_string(),
        created_at: event.created_at.timestamp(),
    };
    match db::insert_donation(&state.pool, &donation).await {
        Ok(true) => {
            if let Err(e) = db::incr_project_donate_cnt(&state.pool, &project.pid).await {
                error!("Counting donation for {} failed: {e}", project.pid);
            }
        }
        Ok(false) => debug!("Donation {} already recorded", donation.id),
        Err(e) => error!("Recording donation {} failed: {e}", donation.id),
    }

    let payout_id = ids::derive_key(&[&event.snapshot_id, PAYOUT_TAG]);
    // A payout already on the ledger means an earlier pass got past the
    // notification.
    if let Ok(Some(_)) = engine.prior_submission(&payout_id).await {
        debug!("Payout {payout_id} already submitted, owner already notified");
    } else {
        let text = format!(
            "User {} has donated to you for project {}.",
            donor.identity_number, project.pid
        );
        if let Err(e) = engine.notify(&project.owner_id, &text).await {
            warn!("Notifying owner {} failed: {e}", project.owner_id);
        }
    }

    let payout = TransferRequest::one(
        payout_id,
        event.asset_id.clone(),
        project.owner_id.clone(),
        event.amount,
        PAYOUT_MEMO,
    );
    match engine.transfer_one(&payout).await {
        Ok(receipt) => {
            debug!("Payout {} → {:?}", receipt.request_id, receipt.confirmation);
            Ok(Outcome::Donated)
        }
        Err(e) if e.is_insufficient_funds() => {
            warn!("Payout {} not covered: {e}", payout.request_id);
            // Never refund value the ledger may already have paid out.
            match engine.prior_submission(&payout.request_id).await {
                Ok(Some(_)) => Ok(Outcome::Donated),
                Ok(None) => Ok(refund(engine, event).await),
                Err(e) => {
                    error!("Payout {} status unknown: {e}", payout.request_id);
                    Ok(Outcome::Failed)
                }
            }
        }
        Err(e) => {
            error!("Payout {} failed: {e}", payout.request_id);
            Ok(Outcome::Failed)
        }
    }
}

/// Send the full amount back to the sender.
async fn refund(engine: &Engine, event: &InboundEvent) -> Outcome {
    let request = TransferRequest::one(
        ids::derive_key(&[&event.snapshot_id, REFUND_TAG]),
        event.asset_id.clone(),
        event.opponent_id.clone(),
        event.amount,
        REFUND_MEMO,
    );
    match engine.transfer_one(&request).await {
        Ok(_) => {
            info!("Refunded {} {} to {}", event.amount, event.asset_id, event.opponent_id);
            Outcome::Refunded
        }
        Err(e) => {
            error!("Refund {} failed: {e}", request.request_id);
            Outcome::Failed
        }
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
