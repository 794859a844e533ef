//! Build → register → sign → submit → confirm for one outbound transaction.

use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::engine::TransferPermit;
use crate::errors::{Result, SettlementError};
use crate::ledger::signer::SpendKey;
use crate::ledger::{Ledger, TxOutput, TxStatus};
use crate::models::{TransferRequest, UnspentOutput};
use crate::selector::MAX_UTXO_NUM;

/// Status reads attempted after submission before giving up on confirmation.
pub const CONFIRM_READS: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum Confirmation {
    Confirmed(TxStatus),
    /// Submitted, but no terminal status was observed in time. The transfer
    /// may still have succeeded.
    Unknown,
    /// The ledger already held a submitted transaction under this request id.
    AlreadySubmitted(TxStatus),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferReceipt {
    pub request_id: String,
    pub amount: Decimal,
    pub inputs: usize,
    pub confirmation: Confirmation,
}

pub struct TransferPipeline<'a> {
    ledger: &'a dyn Ledger,
    spend_key: &'a SpendKey,
    read_delay: Duration,
}

impl<'a> TransferPipeline<'a> {
    pub fn new(ledger: &'a dyn Ledger, spend_key: &'a SpendKey, read_delay: Duration) -> Self {
        Self {
            ledger,
            spend_key,
            read_delay,
        }
    }

    /// Spend `inputs` into the outputs of `request`.
    ///
    /// Every step may fail on its own; a failure before submission leaves the
    /// ledger untouched apart from a replaceable registration. Confirmation
    /// failures are logged and reported as [`Confirmation::Unknown`].
    pub async fn execute(
        &self,
        _permit: &TransferPermit<'_>,
        request: &TransferRequest,
        inputs: &[UnspentOutput],
    ) -> Result<TransferReceipt> {
        let required = request.total_amount();
        let available: Decimal = inputs.iter().map(|o| o.amount).sum();
        if available < required {
            return Err(SettlementError::InsufficientFunds {
                required,
                available,
            });
        }
        if inputs.len() > MAX_UTXO_NUM {
            return Err(SettlementError::TooManyInputs {
                count: inputs.len(),
                cap: MAX_UTXO_NUM,
            });
        }

        let outputs: Vec<TxOutput> = request.recipients.iter().map(TxOutput::from).collect();
        let tx = self
            .ledger
            .build_transaction(inputs, &outputs, &request.memo)
            .await?;

        let views = self
            .ledger
            .register_transaction(&request.request_id, &tx.raw)
            .await?;

        let signed = self.ledger.sign_transaction(&tx, self.spend_key, &views)?;

        self.ledger
            .submit_transaction(&request.request_id, &signed.raw)
            .await?;

        info!(
            request_id = %request.request_id,
            asset_id = %request.asset_id,
            amount = %required,
            inputs = inputs.len(),
            outputs = outputs.len(),
            "Transaction submitted"
        );

        let confirmation = self.confirm(&request.request_id).await;

        Ok(TransferReceipt {
            request_id: request.request_id.clone(),
            amount: required,
            inputs: inputs.len(),
            confirmation,
        })
    }

    async fn confirm(&self, request_id: &str) -> Confirmation {
        for attempt in 1..=CONFIRM_READS {
            tokio::time::sleep(self.read_delay * attempt).await;
            match self.ledger.read_transaction_status(request_id).await {
                Ok(status) if status.is_terminal() => return Confirmation::Confirmed(status),
                Ok(status) => debug!("{request_id} not final yet: {:?}", status.state),
                Err(e) => debug!("{request_id} status read {attempt} failed: {e}"),
            }
        }

        warn!("{}", SettlementError::ConfirmationTimeout(request_id.to_string()));
        Confirmation::Unknown
    }
}
