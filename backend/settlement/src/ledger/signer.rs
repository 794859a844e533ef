//! Spend key handling and local transaction signing.
//!
//! Each input is signed with the spend key over
//! `sha256(raw || view_key)`, where `view_key` is the key the ledger issued
//! for that input at registration. Signatures are appended to the raw
//! transaction in input order.

use std::fmt;

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::errors::{Result, SettlementError};
use crate::ledger::{SignedTx, UnsignedTx, ViewKeys};

#[derive(Clone)]
pub struct SpendKey(SigningKey);

impl SpendKey {
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|_| SettlementError::Config("SPEND_KEY is not valid hex".to_string()))?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SettlementError::Config("SPEND_KEY must be 32 bytes".to_string()))?;
        Ok(Self(SigningKey::from_bytes(&seed)))
    }

    pub fn public(&self) -> VerifyingKey {
        self.0.verifying_key()
    }
}

impl fmt::Debug for SpendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpendKey({})", hex::encode(self.public().as_bytes()))
    }
}

pub fn sign(tx: &UnsignedTx, key: &SpendKey, views: &ViewKeys) -> Result<SignedTx> {
    if views.0.len() != tx.inputs.len() {
        return Err(SettlementError::Signing(format!(
            "expected {} view keys, got {}",
            tx.inputs.len(),
            views.0.len()
        )));
    }

    let body = hex::decode(&tx.raw)
        .map_err(|_| SettlementError::Signing("raw transaction is not hex".to_string()))?;

    let mut signed = body.clone();
    for view in &views.0 {
        let view_bytes = hex::decode(view)
            .map_err(|_| SettlementError::Signing(format!("view key {view} is not hex")))?;
        let digest = Sha256::new()
            .chain_update(&body)
            .chain_update(&view_bytes)
            .finalize();
        signed.extend_from_slice(&key.0.sign(&digest).to_bytes());
    }

    Ok(SignedTx {
        raw: hex::encode(signed),
    })
}
