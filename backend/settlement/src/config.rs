//! Application configuration loaded from environment variables.

use crate::errors::{Result, SettlementError};
use crate::ledger::signer::SpendKey;

#[derive(Debug, Clone)]
pub struct Config {
    /// Ledger API base URL
    pub ledger_url: String,
    /// Bearer token for the ledger API
    pub ledger_token: String,
    /// The engine's own ledger identity
    pub client_id: String,
    /// Key that signs every outbound transaction
    pub spend_key: SpendKey,
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// How often (in seconds) to poll the ledger for inbound transfers
    pub poll_interval_secs: u64,
    /// How far back (in seconds) each poll looks
    pub lookback_secs: u64,
    /// Maximum number of events to fetch per poll
    pub events_per_page: u32,
    /// Upper bound on one reconciliation tick
    pub tick_deadline_secs: u64,
    /// Assets whose unspent outputs are consolidated at startup
    pub consolidate_assets: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            ledger_url: env_var("LEDGER_URL")
                .unwrap_or_else(|_| "https://api.mixin.one".to_string()),
            ledger_token: env_var("LEDGER_TOKEN").map_err(|_| {
                SettlementError::Config("LEDGER_TOKEN environment variable is required".to_string())
            })?,
            client_id: env_var("CLIENT_ID").map_err(|_| {
                SettlementError::Config("CLIENT_ID environment variable is required".to_string())
            })?,
            spend_key: SpendKey::from_hex(&env_var("SPEND_KEY").map_err(|_| {
                SettlementError::Config("SPEND_KEY environment variable is required".to_string())
            })?)?,
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./settlement.db".to_string()),
            api_port: parse_or("API_PORT", 8000)?,
            poll_interval_secs: parse_or("POLL_INTERVAL_SECS", 5)?,
            lookback_secs: parse_or("LOOKBACK_SECS", 3600)?,
            events_per_page: parse_or("EVENTS_PER_PAGE", 500)?,
            tick_deadline_secs: parse_or("TICK_DEADLINE_SECS", 300)?,
            consolidate_assets: env_var("CONSOLIDATE_ASSETS")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
        })
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| SettlementError::Config(format!("Missing env var: {key}")))
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env_var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| SettlementError::Config(format!("Invalid {key}"))),
        Err(_) => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
