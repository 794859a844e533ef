//! Domain types shared by the ledger client, the settlement engine and the
//! persistence layer.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{Result, SettlementError};

// ─────────────────────────────────────────────────────────
// Ledger-side types
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputState {
    Unspent,
    Signed,
    Spent,
}

/// A spendable output held by the engine's identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnspentOutput {
    pub output_id: String,
    pub asset_id: String,
    pub amount: Decimal,
    pub state: OutputState,
    /// Set when the output carries a unique (non-fungible) inscription.
    #[serde(default)]
    pub inscription_hash: Option<String>,
}

impl UnspentOutput {
    pub fn is_inscribed(&self) -> bool {
        self.inscription_hash
            .as_deref()
            .is_some_and(|hash| !hash.is_empty())
    }

    /// Whether this output may be used as fungible balance for `asset_id`.
    pub fn is_fungible_for(&self, asset_id: &str) -> bool {
        self.state == OutputState::Unspent && self.asset_id == asset_id && !self.is_inscribed()
    }
}

/// One payout destination. A recipient with several members is a multi-party
/// address whose spend threshold equals the member count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub members: Vec<String>,
    pub threshold: u8,
    pub amount: Decimal,
}

impl Recipient {
    pub fn single(member: impl Into<String>, amount: Decimal) -> Self {
        Self {
            members: vec![member.into()],
            threshold: 1,
            amount,
        }
    }

    pub fn multisig(members: Vec<String>, amount: Decimal) -> Self {
        let threshold = u8::try_from(members.len()).unwrap_or(u8::MAX);
        Self {
            members,
            threshold,
            amount,
        }
    }
}

/// A logical outbound transfer. `request_id` is the ledger idempotency key
/// and must be reused verbatim across retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub request_id: String,
    pub asset_id: String,
    pub recipients: Vec<Recipient>,
    pub memo: String,
}

impl TransferRequest {
    pub fn one(
        request_id: impl Into<String>,
        asset_id: impl Into<String>,
        member: impl Into<String>,
        amount: Decimal,
        memo: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            asset_id: asset_id.into(),
            recipients: vec![Recipient::single(member, amount)],
            memo: memo.into(),
        }
    }

    pub fn total_amount(&self) -> Decimal {
        self.recipients.iter().map(|r| r.amount).sum()
    }
}

/// Move one specific inscribed output to `member`.
#[derive(Debug, Clone)]
pub struct InscriptionTransferRequest {
    pub request_id: String,
    pub asset_id: String,
    pub inscription_hash: String,
    pub member: String,
    pub memo: String,
}

/// An inbound (or outbound, negative amount) movement observed on the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub snapshot_id: String,
    /// Correlation id chosen by the sender.
    pub request_id: String,
    pub opponent_id: String,
    pub asset_id: String,
    pub amount: Decimal,
    #[serde(default)]
    pub memo: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: String,
    pub identity_number: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub avatar_url: String,
    #[serde(default)]
    pub biography: String,
    pub created_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────
// Stored records
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub identity_number: String,
    pub user_id: String,
    pub full_name: String,
    pub avatar_url: String,
    pub biography: String,
    pub ledger_created_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<&Profile> for User {
    fn from(profile: &Profile) -> Self {
        let now = Utc::now().timestamp();
        Self {
            identity_number: profile.identity_number.clone(),
            user_id: profile.user_id.clone(),
            full_name: profile.full_name.clone(),
            avatar_url: profile.avatar_url.clone(),
            biography: profile.biography.clone(),
            ledger_created_at: profile.created_at.timestamp(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Project {
    pub pid: String,
    pub title: String,
    pub description: String,
    pub img_url: String,
    pub link: String,
    pub identity_number: String,
    /// Ledger user id of the owner; payouts go here.
    pub owner_id: String,
    pub donate_cnt: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DonationRecord {
    pub id: String,
    pub pid: String,
    pub identity_number: String,
    pub asset_id: String,
    pub amount: String,
    pub created_at: i64,
}

/// What the reconciler did with one inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Donated,
    Refunded,
    /// Neither payout nor refund went through; the event is not retried.
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Donated => "donated",
            Self::Refunded => "refunded",
            Self::Failed => "failed",
        }
    }
}

/// Durable reconciliation position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SettlementCursor {
    pub last_snapshot_id: Option<String>,
    pub last_observed_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SnapshotRecord {
    pub snapshot_id: String,
    pub request_id: String,
    pub opponent_id: String,
    pub asset_id: String,
    pub amount: String,
    pub memo: String,
    pub outcome: String,
    pub created_at: i64,
    pub processed_at: i64,
}

// ─────────────────────────────────────────────────────────
// Project references
// ─────────────────────────────────────────────────────────

/// Project description carried base64-encoded in a share link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPayload {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub img_url: String,
    #[serde(default)]
    pub link: String,
    pub identity_number: String,
}

/// How a caller names a project: an existing id, or an encoded description
/// of a project that may not be registered yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectRef {
    ById(Uuid),
    ByEncodedPayload(ProjectPayload),
}

impl ProjectRef {
    pub fn parse(raw: &str) -> Result<Self> {
        if let Ok(pid) = Uuid::parse_str(raw) {
            if !pid.is_nil() {
                return Ok(Self::ById(pid));
            }
        }

        let bytes = STANDARD
            .decode(raw)
            .map_err(|_| SettlementError::InvalidProjectRef("invalid base64 string".into()))?;
        let payload: ProjectPayload = serde_json::from_slice(&bytes)
            .map_err(|_| SettlementError::InvalidProjectRef("invalid json payload".into()))?;

        if payload.title.is_empty() || payload.identity_number.is_empty() {
            return Err(SettlementError::InvalidProjectRef(
                "title or identityNumber is empty".into(),
            ));
        }

        Ok(Self::ByEncodedPayload(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn output(amount: Decimal, inscription: Option<&str>) -> UnspentOutput {
        UnspentOutput {
            output_id: "o1".into(),
            asset_id: "asset".into(),
            amount,
            state: OutputState::Unspent,
            inscription_hash: inscription.map(String::from),
        }
    }

    #[test]
    fn inscribed_outputs_are_not_fungible() {
        assert!(output(dec!(1), None).is_fungible_for("asset"));
        assert!(output(dec!(1), Some("")).is_fungible_for("asset"));
        assert!(!output(dec!(1), Some("abcd")).is_fungible_for("asset"));
        assert!(!output(dec!(1), None).is_fungible_for("other"));
    }

    #[test]
    fn multisig_threshold_is_member_count() {
        let r = Recipient::multisig(vec!["a".into(), "b".into(), "c".into()], dec!(3));
        assert_eq!(r.threshold, 3);
        assert_eq!(Recipient::single("a", dec!(1)).threshold, 1);
    }

    #[test]
    fn transfer_total_sums_recipients() {
        let req = TransferRequest {
            request_id: "r".into(),
            asset_id: "a".into(),
            recipients: vec![
                Recipient::single("x", dec!(1.5)),
                Recipient::single("y", dec!(2.25)),
            ],
            memo: String::new(),
        };
        assert_eq!(req.total_amount(), dec!(3.75));
    }

    #[test]
    fn project_ref_by_id() {
        let pid = "3fa1c0de-8d1b-4c55-9a4e-1f0a2b3c4d5e";
        assert_eq!(
            ProjectRef::parse(pid).unwrap(),
            ProjectRef::ById(Uuid::parse_str(pid).unwrap())
        );
    }

    #[test]
    fn project_ref_by_payload() {
        let json = r#"{"title":"Wells","identityNumber":"7000","imgUrl":"https://x/y.png"}"#;
        let encoded = STANDARD.encode(json);
        match ProjectRef::parse(&encoded).unwrap() {
            ProjectRef::ByEncodedPayload(p) => {
                assert_eq!(p.title, "Wells");
                assert_eq!(p.identity_number, "7000");
                assert_eq!(p.img_url, "https://x/y.png");
                assert!(p.description.is_empty());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn project_ref_rejects_nil_and_garbage() {
        assert!(ProjectRef::parse("00000000-0000-0000-0000-000000000000").is_err());
        assert!(ProjectRef::parse("%%%").is_err());
        let missing = STANDARD.encode(r#"{"title":"","identityNumber":"1"}"#);
        assert!(ProjectRef::parse(&missing).is_err());
    }
}
