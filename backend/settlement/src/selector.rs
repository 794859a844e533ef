//! UTXO selection.
//!
//! Outputs are sorted ascending by amount and accumulated smallest-first into
//! a window of at most `cap` inputs. Once the window is full, the smallest
//! member is evicted before the next output joins, so the window slides
//! towards larger outputs until it covers the target. Spending the small
//! outputs first merges dust as a side effect of ordinary payouts.
//!
//! If the scan ends below target, the window holds the `cap` largest outputs,
//! which is the best any selection could do; the shortfall is therefore real.

use std::collections::VecDeque;

use rust_decimal::Decimal;

use crate::errors::{Result, SettlementError};
use crate::models::UnspentOutput;

/// Hard ceiling on inputs (and outputs) per ledger transaction.
pub const MAX_UTXO_NUM: usize = 255;

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub inputs: Vec<UnspentOutput>,
    pub total: Decimal,
}

/// Choose inputs of `asset_id` covering `target` with at most `cap` members.
///
/// Inscribed and non-unspent outputs are never selected.
pub fn select(
    outputs: &[UnspentOutput],
    asset_id: &str,
    target: Decimal,
    cap: usize,
) -> Result<Selection> {
    let mut pool: Vec<&UnspentOutput> = outputs
        .iter()
        .filter(|o| o.is_fungible_for(asset_id))
        .collect();
    // Stable: equal amounts keep ledger order.
    pool.sort_by(|a, b| a.amount.cmp(&b.amount));

    let mut window: VecDeque<&UnspentOutput> = VecDeque::with_capacity(cap.min(pool.len()));
    let mut total = Decimal::ZERO;

    for output in pool {
        if cap == 0 {
            break;
        }
        if window.len() == cap {
            if let Some(evicted) = window.pop_front() {
                total -= evicted.amount;
            }
        }
        window.push_back(output);
        total += output.amount;

        if total >= target {
            return Ok(Selection {
                inputs: window.into_iter().cloned().collect(),
                total,
            });
        }
    }

    Err(SettlementError::InsufficientFunds {
        required: target,
        available: total,
    })
}
