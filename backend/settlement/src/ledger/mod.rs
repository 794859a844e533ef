//! The external UTXO ledger as seen by the settlement engine.
//!
//! [`Ledger`] is the whole surface the engine consumes. [`http::HttpLedger`]
//! talks to the real API; tests use [`simulated::SimulatedLedger`].

pub mod http;
pub mod signer;
#[cfg(test)]
pub mod simulated;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::models::{InboundEvent, Profile, Recipient, UnspentOutput};
use signer::SpendKey;

/// Minimum signer threshold of outputs the engine can spend alone.
pub const OWN_THRESHOLD: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Order {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxOutput {
    pub members: Vec<String>,
    pub threshold: u8,
    pub amount: Decimal,
}

impl From<&Recipient> for TxOutput {
    fn from(r: &Recipient) -> Self {
        Self {
            members: r.members.clone(),
            threshold: r.threshold,
            amount: r.amount,
        }
    }
}

/// A transaction assembled by the ledger but not yet signed. `raw` is the
/// hex-encoded transaction body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsignedTx {
    pub raw: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<TxOutput>,
}

/// Per-input view keys handed out when a transaction is registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewKeys(pub Vec<String>);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTx {
    pub raw: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    Unspent,
    Signed,
    Spent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxStatus {
    pub request_id: String,
    pub state: TxState,
    #[serde(default)]
    pub transaction_hash: Option<String>,
}

impl TxStatus {
    /// Finalised by the network; nothing left to wait for.
    pub fn is_terminal(&self) -> bool {
        self.state == TxState::Spent
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessagePayload {
    PlainText(String),
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn list_unspent(
        &self,
        asset_id: &str,
        threshold: u8,
        limit: u32,
    ) -> Result<Vec<UnspentOutput>>;

    /// Assemble a transaction spending `inputs`. The ledger appends a change
    /// output back to the sender when the inputs exceed the outputs.
    async fn build_transaction(
        &self,
        inputs: &[UnspentOutput],
        outputs: &[TxOutput],
        memo: &str,
    ) -> Result<UnsignedTx>;

    /// Register `raw` under `request_id`. Registering the same id twice
    /// returns the original registration.
    async fn register_transaction(&self, request_id: &str, raw: &str) -> Result<ViewKeys>;

    fn sign_transaction(&self, tx: &UnsignedTx, key: &SpendKey, views: &ViewKeys) -> Result<SignedTx> {
        signer::sign(tx, key, views)
    }

    async fn submit_transaction(&self, request_id: &str, signed_raw: &str) -> Result<()>;

    async fn read_transaction_status(&self, request_id: &str) -> Result<TxStatus>;

    async fn list_inbound_events(
        &self,
        asset_id: Option<&str>,
        since: DateTime<Utc>,
        order: Order,
        limit: u32,
    ) -> Result<Vec<InboundEvent>>;

    async fn read_profile(&self, identity: &str) -> Result<Profile>;

    async fn send_message(&self, recipient_id: &str, payload: &MessagePayload) -> Result<()>;
}
