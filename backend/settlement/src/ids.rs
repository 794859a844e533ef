//! Deterministic request ids.
//!
//! Every outbound transfer is keyed by an id derived from the business event
//! that caused it, so re-delivery of that event maps onto the same ledger
//! request and is deduplicated there.

use uuid::Uuid;

/// Name-based (v3) UUID over the ordered `parts`. Each part is length
/// prefixed, so no two part lists share a name.
pub fn derive_key(parts: &[&str]) -> String {
    let mut name = String::new();
    for part in parts {
        name.push_str(&part.len().to_string());
        name.push(':');
        name.push_str(part);
    }
    Uuid::new_v3(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

/// Key for chunk `index` of a split batch.
pub fn chunk_key(parent: &str, index: usize) -> String {
    derive_key(&[parent, &index.to_string()])
}

pub fn random_key() -> String {
    Uuid::new_v4().to_string()
}
