//! Net-layer configuration fragment (spec.md §4.2/§6).
//!
//! Plain, already-resolved values — no `serde`, no file I/O. The binary
//! builds this from `marketcore_config::Config` once at boot; this crate
//! never reads a config file itself.

use std::time::Duration;

use libp2p::Multiaddr;

#[derive(Debug, Clone)]
pub struct NetConfig {
    pub listen_addr: Multiaddr,
    /// Literal multiaddrs or aliases; resolved via `BootstrapResolver` before dialing.
    pub bootstrap: Vec<String>,
    pub min_connections: usize,
    pub max_connections: usize,
    /// Evict unused inbound connections above this count.
    pub inbound_connection_threshold: usize,
    pub max_relayed_connections: usize,
    pub keep_alive_interval: Duration,
    pub keep_alive_timeout: Duration,
    pub direct_messaging_enabled: bool,
    pub max_message_size: usize,
    pub fallback_to_gossipsub: bool,
    pub well_known_topic: String,
    pub reconnect_cooldown: Duration,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            listen_addr: "/ip4/0.0.0.0/tcp/0".parse().expect("valid multiaddr"),
            bootstrap: Vec::new(),
            min_connections: 2,
            max_connections: 100,
            inbound_connection_threshold: 100,
            max_relayed_connections: 32,
            keep_alive_interval: Duration::from_secs(30),
            keep_alive_timeout: Duration::from_secs(10),
            direct_messaging_enabled: true,
            max_message_size: crate::protocol::codec::DEFAULT_MAX_MESSAGE_SIZE,
            fallback_to_gossipsub: true,
            well_known_topic: crate::pubsub::DEFAULT_WELL_KNOWN_TOPIC.to_string(),
            reconnect_cooldown: crate::reconnect::DEFAULT_COOLDOWN,
        }
    }
}
