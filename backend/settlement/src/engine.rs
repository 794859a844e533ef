//! The settlement engine: one spend identity, one exclusion lock, and the
//! outward-transfer entry points built on top of them.
//!
//! Selecting UTXOs is read-then-act against a ledger with no atomic
//! select-and-spend, so every operation that can move value takes the
//! engine's transfer lock for the full aggregate → select → submit → confirm
//! sequence. The lock is owned by the engine instance rather than being
//! process-global, so independent engines never contend.
//!
//! Retry wraps whole transfers, never single pipeline steps: each attempt
//! re-reads the unspent set and reselects.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info};

use crate::aggregator;
use crate::batch;
use crate::errors::{Result, SettlementError};
use crate::ledger::signer::SpendKey;
use crate::ledger::{Ledger, MessagePayload, TxState, TxStatus, OWN_THRESHOLD};
use crate::models::{InscriptionTransferRequest, Recipient, TransferRequest};
use crate::pipeline::{Confirmation, TransferPipeline, TransferReceipt};
use crate::retry::{self, BackoffPolicy};
use crate::selector::{self, MAX_UTXO_NUM};

/// Proof that the holder owns the engine's transfer lock. Functions that
/// spend outputs take one by reference.
pub struct TransferPermit<'a> {
    _guard: MutexGuard<'a, ()>,
}

pub struct Engine {
    ledger: Arc<dyn Ledger>,
    identity: String,
    spend_key: SpendKey,
    policy: BackoffPolicy,
    transfer_lock: Mutex<()>,
}

impl Engine {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        identity: impl Into<String>,
        spend_key: SpendKey,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            ledger,
            identity: identity.into(),
            spend_key,
            policy,
            transfer_lock: Mutex::new(()),
        }
    }

    pub fn ledger(&self) -> &dyn Ledger {
        self.ledger.as_ref()
    }

    /// The ledger identity this engine spends from and consolidates into.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub async fn permit(&self) -> TransferPermit<'_> {
        TransferPermit {
            _guard: self.transfer_lock.lock().await,
        }
    }

    pub fn pipeline(&self) -> TransferPipeline<'_> {
        TransferPipeline::new(self.ledger.as_ref(), &self.spend_key, self.policy.base_delay)
    }

    /// Pause after a consolidation round so the next listing sees its output.
    pub fn settle_delay(&self) -> Duration {
        self.policy.base_delay / 4
    }

    /// Pay every recipient of `request` in one transaction, retrying the whole
    /// select-build-submit unit under the backoff policy.
    ///
    /// A consolidation that paused after making progress starts a fresh
    /// retry run, so a large unspent set never fails the transfer on its own.
    pub async fn transfer_one(&self, request: &TransferRequest) -> Result<TransferReceipt> {
        let label = format!("transfer {}", request.request_id);
        loop {
            let err = match retry::run(&self.policy, &label, |_| self.settle_once(request)).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) => SettlementError::from(e),
            };
            if let SettlementError::ConsolidationIncomplete { remaining, .. } = err.root() {
                info!("{label}: {remaining} outputs still to consolidate, resuming");
                continue;
            }
            return Err(err);
        }
    }

    /// Pay an arbitrarily long recipient list, split into cap-sized chunks
    /// sent one after another. Stops at the first chunk that fails; re-running
    /// with the same `request_id` skips chunks the ledger already holds.
    pub async fn transfer_many(
        &self,
        request_id: &str,
        asset_id: &str,
        recipients: &[Recipient],
        memo: &str,
    ) -> Result<Vec<TransferReceipt>> {
        let chunks = batch::split(request_id, asset_id, recipients, memo, MAX_UTXO_NUM);
        let mut receipts = Vec::with_capacity(chunks.len());

        for (index, chunk) in chunks.iter().enumerate() {
            match self.transfer_one(chunk).await {
                Ok(receipt) => receipts.push(receipt),
                Err(e) => {
                    error!(
                        "Batch {request_id}: chunk {index}/{} ({}) failed: {e}",
                        chunks.len(),
                        chunk.request_id
                    );
                    return Err(e);
                }
            }
        }
        Ok(receipts)
    }

    pub async fn transfer_inscription(
        &self,
        request: &InscriptionTransferRequest,
    ) -> Result<TransferReceipt> {
        let label = format!("inscription transfer {}", request.request_id);
        Ok(retry::run(&self.policy, &label, |_| self.inscription_once(request)).await?)
    }

    /// Consolidate `asset_id` down to at most the input cap. Returns the
    /// number of unspent outputs left.
    pub async fn consolidate(&self, asset_id: &str) -> Result<usize> {
        loop {
            let permit = self.permit().await;
            match aggregator::ensure_within_cap(self, &permit, asset_id).await {
                Ok(outputs) => return Ok(outputs.len()),
                Err(SettlementError::ConsolidationIncomplete { remaining, .. }) => {
                    info!("Consolidating {asset_id}: {remaining} outputs left, resuming");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Best-effort plain-text message, retried under the backoff policy.
    pub async fn notify(&self, recipient_id: &str, text: &str) -> Result<()> {
        let payload = MessagePayload::PlainText(text.to_string());
        let label = format!("message to {recipient_id}");
        retry::run(&self.policy, &label, |_| {
            self.ledger.send_message(recipient_id, &payload)
        })
        .await?;
        Ok(())
    }

    /// Status of a transaction the ledger already accepted under
    /// `request_id`, if any. A registered but unsubmitted request counts as
    /// absent.
    pub async fn prior_submission(&self, request_id: &str) -> Result<Option<TxStatus>> {
        match self.ledger.read_transaction_status(request_id).await {
            Ok(status) if status.state != TxState::Unspent => Ok(Some(status)),
            Ok(_) | Err(SettlementError::TransactionNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn settle_once(&self, request: &TransferRequest) -> Result<TransferReceipt> {
        let permit = self.permit().await;

        if let Some(status) = self.prior_submission(&request.request_id).await? {
            info!("{} already submitted ({:?})", request.request_id, status.state);
            return Ok(already_submitted(request, status));
        }

        let unspent = aggregator::ensure_within_cap(self, &permit, &request.asset_id).await?;
        let selection = selector::select(
            &unspent,
            &request.asset_id,
            request.total_amount(),
            MAX_UTXO_NUM,
        )?;

        self.pipeline()
            .execute(&permit, request, &selection.inputs)
            .await
    }

    async fn inscription_once(
        &self,
        request: &InscriptionTransferRequest,
    ) -> Result<TransferReceipt> {
        let permit = self.permit().await;

        let transfer = |amount| {
            TransferRequest::one(
                request.request_id.clone(),
                request.asset_id.clone(),
                request.member.clone(),
                amount,
                request.memo.clone(),
            )
        };

        if let Some(status) = self.prior_submission(&request.request_id).await? {
            return Ok(already_submitted(&transfer(Decimal::ZERO), status));
        }

        let matching: Vec<_> = self
            .ledger
            .list_unspent(&request.asset_id, OWN_THRESHOLD, aggregator::UNSPENT_PAGE)
            .await?
            .into_iter()
            .filter(|o| o.inscription_hash.as_deref() == Some(request.inscription_hash.as_str()))
            .collect();

        match matching.as_slice() {
            [] => Err(SettlementError::Inscription(format!(
                "inscription {} not found",
                request.inscription_hash
            ))),
            [output] => {
                self.pipeline()
                    .execute(&permit, &transfer(output.amount), &matching)
                    .await
            }
            _ => Err(SettlementError::Inscription(format!(
                "multiple outputs carry inscription {}",
                request.inscription_hash
            ))),
        }
    }
}

fn already_submitted(request: &TransferRequest, status: TxStatus) -> TransferReceipt {
    TransferReceipt {
        request_id: request.request_id.clone(),
        amount: request.total_amount(),
        inputs: 0,
        confirmation: Confirmation::AlreadySubmitted(status),
    }
}
