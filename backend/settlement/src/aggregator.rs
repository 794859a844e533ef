//! Keeps the number of unspent outputs per asset at or below the input cap.
//!
//! Each round lists the engine's unspent outputs of one asset; while there
//! are more fungible outputs than one transaction may spend, the smallest
//! `MAX_UTXO_NUM` of them are merged into a single output back to the engine.
//! Inscribed outputs are never merged.
//!
//! Rounds continue while they make progress. Once a call has spent the
//! engine's retry budget it pauses with [`SettlementError::ConsolidationIncomplete`],
//! which is transient: the next call picks up from the ledger's current set.

use std::time::Instant;

use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::engine::{Engine, TransferPermit};
use crate::errors::{Result, SettlementError};
use crate::ids;
use crate::ledger::OWN_THRESHOLD;
use crate::models::{TransferRequest, UnspentOutput};
use crate::selector::MAX_UTXO_NUM;

pub const AGGREGATE_MEMO: &str = "aggregate_utxo";

/// Page size for unspent-output listings.
pub const UNSPENT_PAGE: u32 = 500;

/// Consecutive rounds a partial listing may fail to shrink before
/// consolidation is declared stuck. A lagging listing re-merges the same
/// inputs under the same request id, which the ledger absorbs.
pub const STALL_ROUNDS: usize = 3;

/// Consolidate `asset_id` until its fungible unspent set fits in one
/// transaction, then return that set.
///
/// When a listing fills a whole page the count is a lower bound, so progress
/// is only judged on partial pages.
///
/// Requires the transfer lock: consolidation spends outputs.
pub async fn ensure_within_cap(
    engine: &Engine,
    permit: &TransferPermit<'_>,
    asset_id: &str,
) -> Result<Vec<UnspentOutput>> {
    let started = Instant::now();
    let budget = engine.policy().max_elapsed;
    let mut previous: Option<usize> = None;
    let mut stalled = 0usize;
    let mut round = 0usize;

    loop {
        let outputs = engine
            .ledger()
            .list_unspent(asset_id, OWN_THRESHOLD, UNSPENT_PAGE)
            .await?;
        let full_page = outputs.len() >= UNSPENT_PAGE as usize;

        let mut fungible: Vec<&UnspentOutput> =
            outputs.iter().filter(|o| o.is_fungible_for(asset_id)).collect();
        if fungible.len() <= MAX_UTXO_NUM {
            if round > 0 {
                info!(
                    "Consolidated {asset_id} down to {} outputs in {round} rounds",
                    fungible.len()
                );
            }
            return Ok(outputs);
        }

        if !full_page && previous.is_some_and(|seen| fungible.len() >= seen) {
            stalled += 1;
        } else {
            stalled = 0;
        }
        if stalled >= STALL_ROUNDS {
            warn!(
                "Consolidating {asset_id} stalled at {} outputs after {round} rounds",
                fungible.len()
            );
            return Err(SettlementError::TooManyInputs {
                count: fungible.len(),
                cap: MAX_UTXO_NUM,
            });
        }
        if round > 0 && started.elapsed() >= budget {
            info!(
                "Consolidating {asset_id} paused after {round} rounds ({budget:?}), {} left",
                fungible.len()
            );
            return Err(SettlementError::ConsolidationIncomplete {
                asset_id: asset_id.to_string(),
                remaining: fungible.len(),
            });
        }
        previous = Some(fungible.len());

        fungible.sort_by(|a, b| a.amount.cmp(&b.amount));
        let batch: Vec<UnspentOutput> = fungible
            .into_iter()
            .take(MAX_UTXO_NUM)
            .cloned()
            .collect();
        let request = consolidation_request(engine.identity(), asset_id, &batch);

        debug!(
            "Round {round}: merging {} outputs of {asset_id} ({} total)",
            batch.len(),
            request.total_amount()
        );
        engine.pipeline().execute(permit, &request, &batch).await?;
        round += 1;

        tokio::time::sleep(engine.settle_delay()).await;
    }
}

/// A self-transfer of the whole of `inputs`, keyed by the ids it spends so
/// that a retried round lands on the same ledger request.
fn consolidation_request(
    identity: &str,
    asset_id: &str,
    inputs: &[UnspentOutput],
) -> TransferRequest {
    let mut parts: Vec<&str> = Vec::with_capacity(inputs.len() + 1);
    parts.push(AGGREGATE_MEMO);
    parts.extend(inputs.iter().map(|o| o.output_id.as_str()));

    let amount: Decimal = inputs.iter().map(|o| o.amount).sum();
    TransferRequest::one(
        ids::derive_key(&parts),
        asset_id,
        identity,
        amount,
        AGGREGATE_MEMO,
    )
}
