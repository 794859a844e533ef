//! REST client for the ledger API.
//!
//! ## Failure mapping
//!
//! * Transport errors surface as [`SettlementError::Http`].
//! * `429 Too Many Requests` and `5xx` become [`SettlementError::LedgerUnavailable`].
//! * An `error` object in the body becomes [`SettlementError::LedgerRejected`].
//!
//! No call retries on its own: retry happens one level up, around whole
//! transfers, so a rebuilt transaction always sees a fresh UTXO read.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::errors::{Result, SettlementError};
use crate::ids;
use crate::ledger::{Ledger, MessagePayload, Order, TxOutput, TxStatus, UnsignedTx, ViewKeys};
use crate::models::{InboundEvent, Profile, UnspentOutput};

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    data: Option<T>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct RegisteredRequest {
    views: Vec<String>,
}

// ─────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────

pub struct HttpLedger {
    client: Client,
    base_url: String,
    token: String,
    client_id: String,
}

impl HttpLedger {
    pub fn new(client: Client, base_url: &str, token: &str, client_id: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client_id: client_id.to_string(),
        }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.client
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
    }

    async fn call<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        let resp = request.send().await?;
        let status = resp.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SettlementError::LedgerUnavailable(format!(
                "{what}: rate-limited"
            )));
        }
        if status.is_server_error() {
            return Err(SettlementError::LedgerUnavailable(format!(
                "{what}: HTTP {status}"
            )));
        }
        if status == StatusCode::NOT_FOUND {
            return Err(SettlementError::LedgerRejected {
                code: 404,
                message: format!("{what}: not found"),
            });
        }

        let body: ApiResponse<T> = resp.json().await?;

        if let Some(err) = body.error {
            return Err(SettlementError::LedgerRejected {
                code: err.code,
                message: format!("{what}: {}", err.description),
            });
        }

        body.data.ok_or_else(|| SettlementError::LedgerRejected {
            code: 0,
            message: format!("{what}: empty response"),
        })
    }
}

#[async_trait]
impl Ledger for HttpLedger {
    async fn list_unspent(
        &self,
        asset_id: &str,
        threshold: u8,
        limit: u32,
    ) -> Result<Vec<UnspentOutput>> {
        let request = self.get("/safe/outputs").query(&[
            ("asset", asset_id.to_string()),
            ("state", "unspent".to_string()),
            ("threshold", threshold.to_string()),
            ("limit", limit.to_string()),
        ]);
        let outputs: Vec<UnspentOutput> = self.call(request, "list outputs").await?;
        debug!("Listed {} unspent outputs of {asset_id}", outputs.len());
        Ok(outputs)
    }

    async fn build_transaction(
        &self,
        inputs: &[UnspentOutput],
        outputs: &[TxOutput],
        memo: &str,
    ) -> Result<UnsignedTx> {
        let input_ids: Vec<&str> = inputs.iter().map(|o| o.output_id.as_str()).collect();
        let request = self.post("/safe/transactions/build").json(&json!({
            "inputs": input_ids,
            "outputs": outputs,
            "memo": memo,
            "change": { "members": [self.client_id], "threshold": 1 },
        }));
        self.call(request, "build transaction").await
    }

    async fn register_transaction(&self, request_id: &str, raw: &str) -> Result<ViewKeys> {
        let request = self.post("/safe/transaction/requests").json(&json!([{
            "request_id": request_id,
            "raw": raw,
        }]));
        let mut registered: Vec<RegisteredRequest> =
            self.call(request, "register transaction").await?;
        let first = registered.pop().ok_or_else(|| SettlementError::LedgerRejected {
            code: 0,
            message: format!("register transaction {request_id}: no request returned"),
        })?;
        Ok(ViewKeys(first.views))
    }

    async fn submit_transaction(&self, request_id: &str, signed_raw: &str) -> Result<()> {
        let request = self.post("/safe/transactions").json(&json!([{
            "request_id": request_id,
            "raw": signed_raw,
        }]));
        let _: serde_json::Value = self.call(request, "submit transaction").await?;
        Ok(())
    }

    async fn read_transaction_status(&self, request_id: &str) -> Result<TxStatus> {
        let request = self.get(&format!("/safe/transactions/{request_id}"));
        match self.call::<TxStatus>(request, "read transaction").await {
            Err(SettlementError::LedgerRejected { code: 404, .. }) => {
                Err(SettlementError::TransactionNotFound(request_id.to_string()))
            }
            other => other,
        }
    }

    async fn list_inbound_events(
        &self,
        asset_id: Option<&str>,
        since: DateTime<Utc>,
        order: Order,
        limit: u32,
    ) -> Result<Vec<InboundEvent>> {
        let order = match order {
            Order::Asc => "ASC",
            Order::Desc => "DESC",
        };
        let request = self.get("/safe/snapshots").query(&[
            ("asset", asset_id.unwrap_or_default().to_string()),
            ("offset", since.to_rfc3339_opts(SecondsFormat::Nanos, true)),
            ("order", order.to_string()),
            ("limit", limit.to_string()),
        ]);
        let events: Vec<InboundEvent> = self.call(request, "list snapshots").await?;
        debug!("Fetched {} snapshots since {since}", events.len());
        Ok(events)
    }

    async fn read_profile(&self, identity: &str) -> Result<Profile> {
        let request = self.get(&format!("/users/{identity}"));
        self.call(request, "read user").await
    }

    async fn send_message(&self, recipient_id: &str, payload: &MessagePayload) -> Result<()> {
        let (category, data) = match payload {
            MessagePayload::PlainText(text) => ("PLAIN_TEXT", STANDARD.encode(text)),
        };
        let request = self.post("/messages").json(&json!([{
            "conversation_id": ids::derive_key(&[&self.client_id, recipient_id]),
            "recipient_id": recipient_id,
            "message_id": ids::random_key(),
            "category": category,
            "data": data,
        }]));
        let _: serde_json::Value = self.call(request, "send message").await?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
