//! The message envelope (spec.md §3) and its canonical-JSON signing form.
//!
//! Every role-tagged message — whether published on the gossip topic or sent
//! as a single C5 direct-stream frame — is wrapped in an `Envelope`. Signing
//! and verification themselves live in `marketcore-market` (they need the
//! Ledger collaborator's key material); this crate only defines the shape
//! both sides agree on and the canonical byte encoding that gets signed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A signed, role-tagged message exchanged between peers.
///
/// `id` is a plain string rather than a `Uuid` type: most roles get a random
/// v4 UUID (still rendered as its string form), but `quote-request` from the
/// request façade derives it from `sha256(timestamp + body)` instead (spec.md
/// §4.10) — a shape a `Uuid`-typed field can't hold.
///
/// `to` is present only for delivery roles that carry an explicit recipient
/// (see `DeliveryRole` in `marketcore-market`); broadcast-only roles such as
/// `quote-request` always leave it `None`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub role: String,
    pub id: String,
    pub timestamp: i64,
    #[serde(rename = "fromWalletAddr")]
    pub from_wallet_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Envelope {
    pub fn new(role: impl Into<String>, from_wallet_addr: impl Into<String>, payload: Value) -> Self {
        Self {
            role: role.into(),
            id: Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            from_wallet_addr: from_wallet_addr.into(),
            to: None,
            payload,
            signature: None,
        }
    }

    /// Overrides the auto-generated id (used by the request façade to set a
    /// content-derived session id before signing and publishing).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn addressed_to(mut self, peer_or_wallet: impl Into<String>) -> Self {
        self.to = Some(peer_or_wallet.into());
        self
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Bytes a signer signs and a verifier checks: the envelope as JSON with
    /// the `signature` field removed.
    ///
    /// `serde_json::Value`'s `Object` variant is backed by a `BTreeMap`
    /// unless the `preserve_order` feature is enabled (it is not, anywhere in
    /// this workspace), so serializing a `Value` already emits object keys in
    /// sorted order at every depth — exactly the canonical form spec.md §3
    /// requires. No extra sorting pass is needed.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut value = serde_json::to_value(self).expect("Envelope always serializes");
        if let Value::Object(ref mut map) = value {
            map.remove("signature");
        }
        serde_json::to_vec(&value).expect("canonical value always serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_bytes_exclude_signature_and_sort_keys() {
        let env = Envelope::new("quote-request", "WALLETADDR", serde_json::json!({"z": 1, "a": 2}));
        let bytes = env.canonical_bytes();
        let text = String::from_utf8(bytes).unwrap();
        assert!(!text.contains("signature"));
        // `payload` sorts before `role` sorts before `timestamp` etc. — just
        // check the nested object's keys came out in sorted order.
        let a_pos = text.find("\"a\"").unwrap();
        let z_pos = text.find("\"z\"").unwrap();
        assert!(a_pos < z_pos);
    }

    #[test]
    fn re_signing_is_deterministic_on_the_same_envelope() {
        let env = Envelope::new("quote-request", "WALLETADDR", serde_json::json!({"model": "m"}));
        assert_eq!(env.canonical_bytes(), env.canonical_bytes());
    }

    #[test]
    fn signing_then_mutating_payload_changes_canonical_bytes() {
        let env = Envelope::new("quote-request", "WALLETADDR", serde_json::json!({"model": "m"}));
        let mut other = env.clone();
        other.payload = serde_json::json!({"model": "other"});
        assert_ne!(env.canonical_bytes(), other.canonical_bytes());
    }
}
