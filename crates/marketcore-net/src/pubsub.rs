//! C4 — Pub/Sub Bus helpers (spec.md §4.4).
//!
//! Topic-addressed, unreliable, at-most-once, unordered. The well-known
//! topic is configurable, not a hardcoded constant, so it lives in
//! `marketcore_config::QuoteEngineConfig`/`NodeConfig` and is threaded in by
//! the caller rather than baked in here.

use libp2p::gossipsub::{self, IdentTopic};

use crate::error::NetError;

/// Default well-known topic name, used when configuration doesn't override it.
pub const DEFAULT_WELL_KNOWN_TOPIC: &str = "diiisco/models/1.0.0";

pub fn topic(name: &str) -> IdentTopic {
    IdentTopic::new(name)
}

/// Publish-to-zero-peers must still succeed (spec.md §4.4's "zero-peer
/// publishing must be permitted" edge case): gossipsub's own `publish`
/// already returns `Ok` with `InsufficientPeers` suppressed by
/// `Behaviour::publish`'s semantics only when at least one subscription
/// exists locally (emit-self). Callers that also want the local handler to
/// see the message should call the processor directly in addition to
/// publishing, since gossipsub does not loop back to its own publisher.
pub fn classify_publish_error(err: &gossipsub::PublishError) -> NetError {
    NetError::Codec(format!("gossipsub publish failed: {err}"))
}
