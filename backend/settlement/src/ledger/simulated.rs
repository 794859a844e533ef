//! In-memory ledger used by the engine and reconciler tests.
//!
//! Models the parts of the real API the engine depends on: idempotent
//! registration per request id, input double-spend rejection, change outputs,
//! and injectable transient failures.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{Result, SettlementError};
use crate::ledger::{Ledger, MessagePayload, Order, TxOutput, TxState, TxStatus, UnsignedTx, ViewKeys};
use crate::models::{InboundEvent, OutputState, Profile, UnspentOutput};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Body {
    asset_id: String,
    inputs: Vec<String>,
    outputs: Vec<TxOutput>,
    change: Decimal,
    memo: String,
}

#[derive(Debug)]
struct Registered {
    raw: String,
    body: Body,
    views: ViewKeys,
    submitted: bool,
}

/// A value that left the engine's identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Payout {
    pub request_id: String,
    pub asset_id: String,
    pub members: Vec<String>,
    pub amount: Decimal,
    pub memo: String,
}

#[derive(Default)]
struct State {
    outputs: Vec<UnspentOutput>,
    requests: HashMap<String, Registered>,
    payouts: Vec<Payout>,
    events: Vec<InboundEvent>,
    profiles: HashMap<String, Profile>,
    messages: Vec<(String, MessagePayload)>,
    next_output: u64,
    registrations: u32,
    submissions: u32,
    submitted_memos: Vec<String>,
    fail_submits: u32,
    fail_messages: u32,
    fail_event_reads: u32,
    lagging_reads: u32,
}

pub struct SimulatedLedger {
    identity: String,
    state: Mutex<State>,
}

impl SimulatedLedger {
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            state: Mutex::new(State::default()),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().expect("simulated ledger poisoned");
        f(&mut state)
    }

    pub fn fund(&self, asset_id: &str, amount: Decimal) -> String {
        self.with_state(|s| mint(s, asset_id, amount, None))
    }

    pub fn fund_many(&self, asset_id: &str, count: usize, amount: Decimal) {
        for _ in 0..count {
            self.fund(asset_id, amount);
        }
    }

    pub fn fund_inscription(&self, asset_id: &str, amount: Decimal, hash: &str) -> String {
        self.with_state(|s| mint(s, asset_id, amount, Some(hash.to_string())))
    }

    pub fn push_event(&self, event: InboundEvent) {
        self.with_state(|s| s.events.push(event));
    }

    pub fn add_profile(&self, profile: Profile) {
        self.with_state(|s| {
            s.profiles.insert(profile.user_id.clone(), profile);
        });
    }

    pub fn fail_next_submits(&self, n: u32) {
        self.with_state(|s| s.fail_submits = n);
    }

    pub fn fail_next_messages(&self, n: u32) {
        self.with_state(|s| s.fail_messages = n);
    }

    pub fn fail_next_event_reads(&self, n: u32) {
        self.with_state(|s| s.fail_event_reads = n);
    }

    /// Status reads report `signed` this many times before `spent`.
    pub fn lag_status_reads(&self, n: u32) {
        self.with_state(|s| s.lagging_reads = n);
    }

    pub fn unspent_count(&self, asset_id: &str) -> usize {
        self.with_state(|s| {
            s.outputs
                .iter()
                .filter(|o| o.asset_id == asset_id && o.state == OutputState::Unspent)
                .count()
        })
    }

    pub fn balance(&self, asset_id: &str) -> Decimal {
        self.with_state(|s| {
            s.outputs
                .iter()
                .filter(|o| o.asset_id == asset_id && o.state == OutputState::Unspent)
                .map(|o| o.amount)
                .sum()
        })
    }

    pub fn payouts(&self) -> Vec<Payout> {
        self.with_state(|s| s.payouts.clone())
    }

    pub fn payouts_to(&self, member: &str) -> Vec<Payout> {
        self.payouts()
            .into_iter()
            .filter(|p| p.members.iter().any(|m| m == member))
            .collect()
    }

    pub fn messages(&self) -> Vec<(String, MessagePayload)> {
        self.with_state(|s| s.messages.clone())
    }

    pub fn registrations(&self) -> u32 {
        self.with_state(|s| s.registrations)
    }

    pub fn submissions(&self) -> u32 {
        self.with_state(|s| s.submissions)
    }

    /// Memos of submitted transactions, oldest first.
    pub fn submitted_memos(&self) -> Vec<String> {
        self.with_state(|s| s.submitted_memos.clone())
    }
}

fn mint(s: &mut State, asset_id: &str, amount: Decimal, inscription: Option<String>) -> String {
    s.next_output += 1;
    let output_id = format!("out-{}", s.next_output);
    s.outputs.push(UnspentOutput {
        output_id: output_id.clone(),
        asset_id: asset_id.to_string(),
        amount,
        state: OutputState::Unspent,
        inscription_hash: inscription,
    });
    output_id
}

fn rejected(message: impl Into<String>) -> SettlementError {
    SettlementError::LedgerRejected {
        code: 400,
        message: message.into(),
    }
}

#[async_trait]
impl Ledger for SimulatedLedger {
    async fn list_unspent(
        &self,
        asset_id: &str,
        _threshold: u8,
        limit: u32,
    ) -> Result<Vec<UnspentOutput>> {
        Ok(self.with_state(|s| {
            s.outputs
                .iter()
                .filter(|o| o.asset_id == asset_id && o.state == OutputState::Unspent)
                .take(limit as usize)
                .cloned()
                .collect()
        }))
    }

    async fn build_transaction(
        &self,
        inputs: &[UnspentOutput],
        outputs: &[TxOutput],
        memo: &str,
    ) -> Result<UnsignedTx> {
        let first = inputs.first().ok_or_else(|| rejected("no inputs"))?;
        let in_total: Decimal = inputs.iter().map(|o| o.amount).sum();
        let out_total: Decimal = outputs.iter().map(|o| o.amount).sum();
        if out_total > in_total {
            return Err(rejected("outputs exceed inputs"));
        }
        let body = Body {
            asset_id: first.asset_id.clone(),
            inputs: inputs.iter().map(|o| o.output_id.clone()).collect(),
            outputs: outputs.to_vec(),
            change: in_total - out_total,
            memo: memo.to_string(),
        };
        let raw = hex::encode(serde_json::to_vec(&body)?);
        Ok(UnsignedTx {
            raw,
            inputs: body.inputs,
            outputs: body.outputs,
        })
    }

    async fn register_transaction(&self, request_id: &str, raw: &str) -> Result<ViewKeys> {
        let bytes = hex::decode(raw).map_err(|_| rejected("raw is not hex"))?;
        let body: Body = serde_json::from_slice(&bytes)?;

        Ok(self.with_state(|s| {
            s.registrations += 1;
            // A submitted request is frozen; an unsubmitted one may be rebuilt.
            if let Some(existing) = s.requests.get(request_id) {
                if existing.submitted || existing.raw == raw {
                    return existing.views.clone();
                }
            }
            let views = ViewKeys(
                body.inputs
                    .iter()
                    .map(|input| {
                        hex::encode(
                            Sha256::new()
                                .chain_update(request_id)
                                .chain_update(input)
                                .finalize(),
                        )
                    })
                    .collect(),
            );
            s.requests.insert(
                request_id.to_string(),
                Registered {
                    raw: raw.to_string(),
                    body,
                    views: views.clone(),
                    submitted: false,
                },
            );
            views
        }))
    }

    async fn submit_transaction(&self, request_id: &str, signed_raw: &str) -> Result<()> {
        let identity = self.identity.clone();
        self.with_state(|s| {
            if s.fail_submits > 0 {
                s.fail_submits -= 1;
                return Err(SettlementError::LedgerUnavailable("submit: HTTP 503".into()));
            }

            let registered = s
                .requests
                .get(request_id)
                .ok_or_else(|| rejected(format!("{request_id} is not registered")))?;
            if registered.submitted {
                return Ok(());
            }
            if !signed_raw.starts_with(&registered.raw) || signed_raw.len() == registered.raw.len()
            {
                return Err(rejected("transaction is not signed"));
            }
            let body = registered.body.clone();

            for input in &body.inputs {
                let spendable = s
                    .outputs
                    .iter()
                    .any(|o| &o.output_id == input && o.state == OutputState::Unspent);
                if !spendable {
                    return Err(rejected(format!("input {input} already spent")));
                }
            }
            for output in s.outputs.iter_mut() {
                if body.inputs.contains(&output.output_id) {
                    output.state = OutputState::Spent;
                }
            }

            for out in &body.outputs {
                if out.members == [identity.clone()] {
                    mint(s, &body.asset_id, out.amount, None);
                } else {
                    s.payouts.push(Payout {
                        request_id: request_id.to_string(),
                        asset_id: body.asset_id.clone(),
                        members: out.members.clone(),
                        amount: out.amount,
                        memo: body.memo.clone(),
                    });
                }
            }
            if body.change > Decimal::ZERO {
                mint(s, &body.asset_id, body.change, None);
            }

            if let Some(r) = s.requests.get_mut(request_id) {
                r.submitted = true;
            }
            s.submissions += 1;
            s.submitted_memos.push(body.memo);
            Ok(())
        })
    }

    async fn read_transaction_status(&self, request_id: &str) -> Result<TxStatus> {
        self.with_state(|s| {
            let registered = s
                .requests
                .get(request_id)
                .ok_or_else(|| SettlementError::TransactionNotFound(request_id.to_string()))?;
            let state = if !registered.submitted {
                TxState::Unspent
            } else if s.lagging_reads > 0 {
                s.lagging_reads -= 1;
                TxState::Signed
            } else {
                TxState::Spent
            };
            Ok(TxStatus {
                request_id: request_id.to_string(),
                state,
                transaction_hash: None,
            })
        })
    }

    async fn list_inbound_events(
        &self,
        asset_id: Option<&str>,
        since: DateTime<Utc>,
        order: Order,
        limit: u32,
    ) -> Result<Vec<InboundEvent>> {
        self.with_state(|s| {
            if s.fail_event_reads > 0 {
                s.fail_event_reads -= 1;
                return Err(SettlementError::LedgerUnavailable("snapshots: HTTP 502".into()));
            }
            let mut events: Vec<InboundEvent> = s
                .events
                .iter()
                .filter(|e| e.created_at >= since)
                .filter(|e| asset_id.map_or(true, |a| a == e.asset_id))
                .cloned()
                .collect();
            events.sort_by_key(|e| e.created_at);
            if order == Order::Desc {
                events.reverse();
            }
            events.truncate(limit as usize);
            Ok(events)
        })
    }

    async fn read_profile(&self, identity: &str) -> Result<Profile> {
        self.with_state(|s| {
            // Users are addressable by id or by identity number.
            s.profiles
                .get(identity)
                .or_else(|| s.profiles.values().find(|p| p.identity_number == identity))
                .cloned()
                .ok_or(SettlementError::LedgerRejected {
                    code: 404,
                    message: format!("user {identity} not found"),
                })
        })
    }

    async fn send_message(&self, recipient_id: &str, payload: &MessagePayload) -> Result<()> {
        self.with_state(|s| {
            if s.fail_messages > 0 {
                s.fail_messages -= 1;
                return Err(SettlementError::LedgerUnavailable("messages: HTTP 500".into()));
            }
            s.messages.push((recipient_id.to_string(), payload.clone()));
            Ok(())
        })
    }
}
