//! Transport construction: encrypted, multiplexed TCP (spec.md §4.2).

use std::time::Duration;

use libp2p::{
    core::{muxing::StreamMuxerBox, upgrade},
    identity, noise,
    swarm::Config as SwarmConfig,
    tcp, yamux, PeerId, Transport,
};

use crate::error::NetError;

/// Build a TCP transport with Noise encryption and Yamux multiplexing.
pub fn build_transport(
    key: &identity::Keypair,
) -> Result<libp2p::core::transport::Boxed<(PeerId, StreamMuxerBox)>, NetError> {
    let noise_config = noise::Config::new(key).map_err(|e| NetError::Keypair(e.to_string()))?;

    let transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
        .upgrade(upgrade::Version::V1)
        .authenticate(noise_config)
        .multiplex(yamux::Config::default())
        .boxed();
    Ok(transport)
}

/// Default swarm configuration: 30 s idle connection timeout so relay
/// reservations and DCUtR hole-punching have enough time to complete.
pub fn default_swarm_config() -> SwarmConfig {
    SwarmConfig::with_tokio_executor().with_idle_connection_timeout(Duration::from_secs(30))
}
