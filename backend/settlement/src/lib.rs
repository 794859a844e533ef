//! Donation settlement engine.
//!
//! Polls a UTXO ledger for inbound transfers, attributes each one to a
//! project through its memo, and pays the project owner exactly once, or
//! refunds the sender when the transfer cannot be attributed.

pub mod aggregator;
pub mod api;
pub mod batch;
pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod ids;
pub mod ledger;
pub mod models;
pub mod pipeline;
pub mod reconciler;
pub mod retry;
pub mod selector;
