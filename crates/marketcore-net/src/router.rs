//! C6 — Message Router (egress), spec.md §4.6.
//!
//! Pure routing decisions over the closed `DeliveryRole` taxonomy. The
//! actual dial/publish calls live in `node.rs`'s command handler, which is
//! the only place allowed to touch the swarm; this module only decides
//! *which* transport a given `send()` call should use. No retries, no
//! reordering, no per-peer queues — a single decision per call.

use libp2p::PeerId;

use crate::error::NetError;

/// The closed set of message roles and how each one is allowed to travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryRole {
    /// Always published on the well-known gossip topic; never sent directly.
    BroadcastOnly,
    /// Tries a direct stream to `target` first; falls back to broadcast.
    DirectPreferred,
}

/// Classify a message `role` string into its delivery taxonomy (spec.md
/// §3 "DeliveryRole taxonomy").
pub fn classify(role: &str) -> DeliveryRole {
    match role {
        "list-models" | "list-models-response" | "quote-request" | "quote-response" => {
            DeliveryRole::BroadcastOnly
        }
        "quote-accepted" | "contract-created" | "contract-signed" | "inference-response" => {
            DeliveryRole::DirectPreferred
        }
        // Unknown roles default to broadcast-only: C7's role dispatch will
        // reject them with `UnknownRole` on the receiving side regardless.
        _ => DeliveryRole::BroadcastOnly,
    }
}

/// What `send()` should do for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct(PeerId),
    Broadcast,
}

/// `send(message, targetPeerId?)` (spec.md §4.6): decide the transport for
/// one outbound message, given the router's configuration and whether a
/// direct-send handler is currently available (i.e. a connection to
/// `target` exists).
pub fn decide(
    role: &str,
    target: Option<PeerId>,
    direct_messaging_enabled: bool,
    handler_available: bool,
    fallback_to_gossipsub: bool,
) -> Result<Route, NetError> {
    let wants_direct = classify(role) == DeliveryRole::DirectPreferred
        && direct_messaging_enabled
        && target.is_some()
        && handler_available;

    if wants_direct {
        return Ok(Route::Direct(target.unwrap()));
    }
    if fallback_to_gossipsub {
        Ok(Route::Broadcast)
    } else {
        Err(NetError::Unreachable(format!(
            "no direct handler for {role} and gossipsub fallback disabled"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_request_is_broadcast_only_even_with_a_target() {
        assert_eq!(classify("quote-request"), DeliveryRole::BroadcastOnly);
    }

    #[test]
    fn direct_preferred_role_with_target_and_handler_goes_direct() {
        let peer = PeerId::random();
        let route = decide("quote-accepted", Some(peer), true, true, true).unwrap();
        assert_eq!(route, Route::Direct(peer));
    }

    #[test]
    fn direct_preferred_role_without_handler_falls_back_to_broadcast() {
        let peer = PeerId::random();
        let route = decide("quote-accepted", Some(peer), true, false, true).unwrap();
        assert_eq!(route, Route::Broadcast);
    }

    #[test]
    fn fallback_disabled_and_no_direct_handler_fails_delivery() {
        let peer = PeerId::random();
        let result = decide("quote-accepted", Some(peer), true, false, false);
        assert!(result.is_err());
    }

    #[test]
    fn broadcast_only_role_never_attempts_direct() {
        let peer = PeerId::random();
        let route = decide("quote-request", Some(peer), true, true, true).unwrap();
        assert_eq!(route, Route::Broadcast);
    }
}
