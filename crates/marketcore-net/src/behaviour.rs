//! libp2p `NetworkBehaviour` composition for a marketplace node (spec.md §4.2).
//!
//! Every node runs `NodeBehaviour`: NAT reachability probing (`autonat`),
//! opportunistic hole-punch upgrade (`dcutr`), relay-client dialing,
//! local-network auto-discovery (`mdns`), the well-known pub/sub topic
//! (`gossipsub`, C4), keep-alive (`ping`), and the C5 direct-messaging
//! protocol (`direct`). `relay_server` is a `Toggle` — disabled at
//! construction, enabled once the reachability probe reports `Public`, which
//! is how "relay-server capability, bounded by `maxRelayedConnections`, only
//! when publicly reachable" (spec.md §4.2) is expressed without a second
//! binary.

use std::time::Duration;

use libp2p::{
    autonat, dcutr, gossipsub, identify, identity, mdns, ping, relay, request_response,
    swarm::{behaviour::toggle::Toggle, NetworkBehaviour},
    PeerId,
};
use rand::rngs::OsRng;

use crate::protocol::{
    codec::{Ack, DirectCodec, DIRECT_PROTOCOL},
    envelope::Envelope,
};

/// `identify` protocol-version string, distinguishing this wire protocol from
/// any other libp2p deployment sharing a network segment.
pub const IDENTIFY_PROTOCOL: &str = "/diiisco/identify/1.0.0";

#[derive(NetworkBehaviour)]
#[behaviour(out_event = "NodeBehaviourEvent")]
pub struct NodeBehaviour {
    pub relay_client: relay::client::Behaviour,
    pub relay_server: Toggle<relay::Behaviour>,
    pub dcutr: dcutr::Behaviour,
    pub identify: identify::Behaviour,
    pub autonat: autonat::v2::client::Behaviour<OsRng>,
    pub ping: ping::Behaviour,
    pub mdns: mdns::tokio::Behaviour,
    pub gossipsub: gossipsub::Behaviour,
    pub direct: request_response::Behaviour<DirectCodec>,
}

#[derive(Debug)]
#[allow(clippy::large_enum_variant)]
pub enum NodeBehaviourEvent {
    Relay(relay::client::Event),
    RelayServer(relay::Event),
    Dcutr(dcutr::Event),
    Identify(identify::Event),
    Autonat(autonat::v2::client::Event),
    Ping(ping::Event),
    Mdns(mdns::Event),
    Gossipsub(gossipsub::Event),
    Direct(request_response::Event<Envelope, Ack>),
}

impl From<relay::client::Event> for NodeBehaviourEvent {
    fn from(e: relay::client::Event) -> Self {
        NodeBehaviourEvent::Relay(e)
    }
}
impl From<relay::Event> for NodeBehaviourEvent {
    fn from(e: relay::Event) -> Self {
        NodeBehaviourEvent::RelayServer(e)
    }
}
impl From<dcutr::Event> for NodeBehaviourEvent {
    fn from(e: dcutr::Event) -> Self {
        NodeBehaviourEvent::Dcutr(e)
    }
}
impl From<identify::Event> for NodeBehaviourEvent {
    fn from(e: identify::Event) -> Self {
        NodeBehaviourEvent::Identify(e)
    }
}
impl From<autonat::v2::client::Event> for NodeBehaviourEvent {
    fn from(e: autonat::v2::client::Event) -> Self {
        NodeBehaviourEvent::Autonat(e)
    }
}
impl From<ping::Event> for NodeBehaviourEvent {
    fn from(e: ping::Event) -> Self {
        NodeBehaviourEvent::Ping(e)
    }
}
impl From<mdns::Event> for NodeBehaviourEvent {
    fn from(e: mdns::Event) -> Self {
        NodeBehaviourEvent::Mdns(e)
    }
}
impl From<gossipsub::Event> for NodeBehaviourEvent {
    fn from(e: gossipsub::Event) -> Self {
        NodeBehaviourEvent::Gossipsub(e)
    }
}
impl From<request_response::Event<Envelope, Ack>> for NodeBehaviourEvent {
    fn from(e: request_response::Event<Envelope, Ack>) -> Self {
        NodeBehaviourEvent::Direct(e)
    }
}

impl NodeBehaviour {
    pub fn new(
        key: &identity::Keypair,
        relay_client: relay::client::Behaviour,
        max_message_size: usize,
        keep_alive_interval: Duration,
        keep_alive_timeout: Duration,
    ) -> Result<Self, String> {
        let local_peer_id = PeerId::from(key.public());

        let mdns = mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)
            .map_err(|e| e.to_string())?;

        let gossipsub_config = gossipsub::ConfigBuilder::default()
            .validation_mode(gossipsub::ValidationMode::Permissive)
            .build()
            .map_err(|e| e.to_string())?;
        let gossipsub = gossipsub::Behaviour::new(
            gossipsub::MessageAuthenticity::Signed(key.clone()),
            gossipsub_config,
        )
        .map_err(|e| e.to_string())?;

        Ok(Self {
            relay_client,
            relay_server: Toggle::from(None),
            dcutr: dcutr::Behaviour::new(local_peer_id),
            identify: identify::Behaviour::new(identify::Config::new(
                IDENTIFY_PROTOCOL.into(),
                key.public(),
            )),
            autonat: autonat::v2::client::Behaviour::new(OsRng, Default::default()),
            ping: ping::Behaviour::new(
                ping::Config::new()
                    .with_interval(keep_alive_interval)
                    .with_timeout(keep_alive_timeout),
            ),
            mdns,
            gossipsub,
            direct: request_response::Behaviour::with_codec(
                DirectCodec::new(max_message_size),
                [(DIRECT_PROTOCOL, request_response::ProtocolSupport::Full)],
                request_response::Config::default().with_request_timeout(Duration::from_secs(10)),
            ),
        })
    }

    /// Enable relay-server capability once the reachability probe reports
    /// `Public` (spec.md §4.2). Idempotent.
    pub fn enable_relay_server(&mut self, key: &identity::Keypair, max_relayed_connections: usize) {
        if self.relay_server.is_enabled() {
            return;
        }
        let local_peer_id = PeerId::from(key.public());
        let config = relay::Config {
            max_reservations: max_relayed_connections,
            max_circuits: max_relayed_connections,
            ..Default::default()
        };
        self.relay_server
            .set(Some(relay::Behaviour::new(local_peer_id, config)));
    }

    pub fn disable_relay_server(&mut self) {
        self.relay_server.set(None);
    }
}
