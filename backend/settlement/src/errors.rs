//! Application-wide error types.

use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::retry::{RetryError, Transient};

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Decimal, available: Decimal },

    #[error("Transaction would spend {count} inputs, the cap is {cap}")]
    TooManyInputs { count: usize, cap: usize },

    #[error("Consolidation of {asset_id} paused with {remaining} outputs left")]
    ConsolidationIncomplete { asset_id: String, remaining: usize },

    #[error("Ledger unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("Ledger rejected request ({code}): {message}")]
    LedgerRejected { code: i64, message: String },

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Invalid memo: {0}")]
    InvalidMemo(String),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Invalid project reference: {0}")]
    InvalidProjectRef(String),

    #[error("Inscription error: {0}")]
    Inscription(String),

    #[error("Transaction {0} was submitted but not confirmed")]
    ConfirmationTimeout(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<SettlementError>,
    },

    #[error("Reconciliation tick exceeded its {0:?} deadline")]
    DeadlineExceeded(Duration),
}

impl SettlementError {
    /// The error that actually ended an operation, looking through retry
    /// exhaustion.
    pub fn root(&self) -> &SettlementError {
        match self {
            Self::RetriesExhausted { last, .. } => last.root(),
            other => other,
        }
    }

    pub fn is_insufficient_funds(&self) -> bool {
        matches!(self.root(), Self::InsufficientFunds { .. })
    }
}

impl Transient for SettlementError {
    /// Transport failures and stale-UTXO shortfalls clear up on a fresh read,
    /// and a paused consolidation resumes where it stopped. Everything else is
    /// a property of the request itself.
    fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Http(_)
                | Self::LedgerUnavailable(_)
                | Self::InsufficientFunds { .. }
                | Self::ConsolidationIncomplete { .. }
        )
    }
}

impl From<RetryError<SettlementError>> for SettlementError {
    fn from(err: RetryError<SettlementError>) -> Self {
        match err {
            RetryError::Permanent(e) => e,
            RetryError::Exhausted { attempts, last } => Self::RetriesExhausted {
                attempts,
                last: Box::new(last),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, SettlementError>;
