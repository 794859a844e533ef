//! Splits multi-recipient payouts that exceed the per-transaction output cap.

use crate::ids;
use crate::models::{Recipient, TransferRequest};

/// Partition `recipients` into consecutive requests of at most `cap`
/// recipients each, preserving order.
///
/// A list that fits in one transaction keeps `request_id` unchanged. Larger
/// lists get one request per chunk keyed by [`ids::chunk_key`], so re-running
/// the whole batch maps each chunk onto the same ledger request again.
pub fn split(
    request_id: &str,
    asset_id: &str,
    recipients: &[Recipient],
    memo: &str,
    cap: usize,
) -> Vec<TransferRequest> {
    let cap = cap.max(1);

    if recipients.len() <= cap {
        return vec![TransferRequest {
            request_id: request_id.to_string(),
            asset_id: asset_id.to_string(),
            recipients: recipients.to_vec(),
            memo: memo.to_string(),
        }];
    }

    recipients
        .chunks(cap)
        .enumerate()
        .map(|(index, chunk)| TransferRequest {
            request_id: ids::chunk_key(request_id, index),
            asset_id: asset_id.to_string(),
            recipients: chunk.to_vec(),
            memo: memo.to_string(),
        })
        .collect()
}
