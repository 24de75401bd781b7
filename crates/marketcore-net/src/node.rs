//! C2 Peer Network event loop — wires together discovery (mdns + bootstrap),
//! NAT reachability (autonat), relay/hole-punch upgrade (relay + dcutr),
//! keep-alive (ping), C3 (reconnect), C4 (gossipsub), C5 (direct messaging),
//! and C6 (routing decisions) into one `tokio::select!` loop.
//!
//! The swarm is owned exclusively by `NodeState::event_loop` — every other
//! task talks to it only through `NetHandle`'s command channel, matching the
//! "no global lock on the message processor, but a single owner for the
//! swarm itself" shape.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use futures::StreamExt;
use libp2p::{
    autonat,
    core::{muxing::StreamMuxerBox, upgrade},
    dcutr, gossipsub, identify, identity, mdns, noise, ping, relay, request_response,
    swarm::{dial_opts::DialOpts, Swarm, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, Transport,
};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    time::{interval_at, Instant, MissedTickBehavior},
};

use crate::{
    behaviour::{NodeBehaviour, NodeBehaviourEvent},
    bootstrap::BootstrapResolver,
    config::NetConfig,
    error::NetError,
    protocol::{
        codec::{cbor_decode, cbor_encode, Ack},
        envelope::Envelope,
    },
    reconnect::{ReconnectSupervisor, SupervisorMetrics, TickAction},
    router::{self, Route},
    transport::default_swarm_config,
};

type NodeSwarm = Swarm<NodeBehaviour>;

/// NAT reachability classification (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Public,
    Private,
    Unknown,
}

#[derive(Debug, Clone)]
#[allow(clippy::large_enum_variant)]
pub enum NetEvent {
    Listening(Multiaddr),
    PeerDiscovered { peer_id: PeerId },
    Connected { peer_id: PeerId, via_relay: bool },
    Disconnected { peer_id: PeerId },
    ReachabilityChanged(Reachability),
    DirectMessage { from: PeerId, envelope: Envelope },
    GossipMessage { topic: String, envelope: Envelope },
    Error(NetError),
}

enum NetCommand {
    SendDirect {
        peer: PeerId,
        envelope: Envelope,
        reply_tx: oneshot::Sender<Result<bool, NetError>>,
    },
    Publish {
        topic: String,
        envelope: Envelope,
        reply_tx: oneshot::Sender<Result<(), NetError>>,
    },
    Subscribe {
        topic: String,
    },
    MeshPeerCount {
        topic: String,
        reply_tx: oneshot::Sender<usize>,
    },
    Metrics {
        reply_tx: oneshot::Sender<SupervisorMetrics>,
    },
    Shutdown,
}

/// Cheap-to-clone handle to the running peer network. Every public method is
/// a named "suspension point": the caller awaits a channel round trip into
/// the single event loop that owns the swarm.
#[derive(Clone)]
pub struct NetHandle {
    cmd_tx: mpsc::Sender<NetCommand>,
    event_tx: broadcast::Sender<NetEvent>,
    connected: Arc<Mutex<HashSet<PeerId>>>,
    local_peer_id: PeerId,
}

impl NetHandle {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<NetEvent> {
        self.event_tx.subscribe()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.connected.lock().unwrap().iter().copied().collect()
    }

    pub async fn send_direct(&self, peer: PeerId, envelope: Envelope) -> Result<bool, NetError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(NetCommand::SendDirect { peer, envelope, reply_tx })
            .await
            .map_err(|_| NetError::Shutdown)?;
        reply_rx.await.map_err(|_| NetError::Shutdown)?
    }

    pub async fn publish(&self, topic: impl Into<String>, envelope: Envelope) -> Result<(), NetError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(NetCommand::Publish { topic: topic.into(), envelope, reply_tx })
            .await
            .map_err(|_| NetError::Shutdown)?;
        reply_rx.await.map_err(|_| NetError::Shutdown)?
    }

    pub async fn subscribe(&self, topic: impl Into<String>) -> Result<(), NetError> {
        self.cmd_tx
            .send(NetCommand::Subscribe { topic: topic.into() })
            .await
            .map_err(|_| NetError::Shutdown)
    }

    async fn mesh_peer_count(&self, topic: &str) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(NetCommand::MeshPeerCount { topic: topic.to_string(), reply_tx })
            .await
            .is_err()
        {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }

    /// `waitForMesh(topic, minSubs, timeout)` (spec.md §4.4).
    pub async fn wait_for_mesh(
        &self,
        topic: impl Into<String>,
        min_subs: usize,
        deadline: Duration,
    ) -> Result<(), NetError> {
        let topic = topic.into();
        let handle = self.clone();
        let topic_for_poll = topic.clone();
        let poll = async move {
            loop {
                if handle.mesh_peer_count(&topic_for_poll).await >= min_subs {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        tokio::time::timeout(deadline, poll)
            .await
            .map_err(|_| NetError::NoMesh(topic))
    }

    /// `send(message, targetPeerId?)` (spec.md §4.6): direct-preferred with
    /// gossipsub fallback per the `DeliveryRole` taxonomy, decided by
    /// `router::decide`.
    pub async fn send(
        &self,
        role: &str,
        envelope: Envelope,
        target: Option<PeerId>,
        direct_messaging_enabled: bool,
        fallback_to_gossipsub: bool,
        well_known_topic: &str,
    ) -> Result<(), NetError> {
        let handler_available = target
            .map(|p| self.connected.lock().unwrap().contains(&p))
            .unwrap_or(false);

        let route = router::decide(
            role,
            target,
            direct_messaging_enabled,
            handler_available,
            fallback_to_gossipsub,
        )?;

        match route {
            Route::Direct(peer) => match self.send_direct(peer, envelope.clone()).await {
                Ok(true) => Ok(()),
                Ok(false) | Err(_) if fallback_to_gossipsub => {
                    self.publish(well_known_topic, envelope).await
                }
                Ok(false) => Err(NetError::Unreachable(peer.to_string())),
                Err(e) => Err(e),
            },
            Route::Broadcast => self.publish(well_known_topic, envelope).await,
        }
    }

    pub async fn metrics(&self) -> SupervisorMetrics {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(NetCommand::Metrics { reply_tx }).await.is_err() {
            return SupervisorMetrics::default();
        }
        reply_rx.await.unwrap_or_default()
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(NetCommand::Shutdown).await;
    }
}

pub struct Node {
    config: NetConfig,
    key: identity::Keypair,
    resolver: Arc<dyn BootstrapResolver>,
}

impl Node {
    pub fn new(config: NetConfig, key: identity::Keypair, resolver: Arc<dyn BootstrapResolver>) -> Self {
        Self { config, key, resolver }
    }

    /// Build the swarm, start listening, and run the event loop until
    /// `NetHandle::shutdown` or Ctrl-C is received. Returns the handle
    /// immediately; the loop itself runs in the returned `JoinHandle`.
    pub async fn spawn(self) -> Result<(NetHandle, tokio::task::JoinHandle<()>), NetError> {
        let local_peer_id = PeerId::from(self.key.public());
        let mut swarm = build_swarm(&self.key, &self.config)?;
        swarm
            .listen_on(self.config.listen_addr.clone())
            .map_err(|e| NetError::Codec(e.to_string()))?;

        let (event_tx, _) = broadcast::channel(256);
        let (cmd_tx, cmd_rx) = mpsc::channel(128);
        let connected = Arc::new(Mutex::new(HashSet::new()));

        let handle = NetHandle {
            cmd_tx,
            event_tx: event_tx.clone(),
            connected: Arc::clone(&connected),
            local_peer_id,
        };

        let state = NodeState {
            config: self.config,
            key: self.key,
            resolver: self.resolver,
            local_peer_id,
            event_tx,
            connected,
            supervisor: ReconnectSupervisor::new(Duration::from_secs(5 * 60)),
            reachability: Reachability::Unknown,
            inbound_peers: HashSet::new(),
            pending_outbound: HashMap::new(),
            subscribed_topics: HashSet::new(),
        };

        let join = tokio::spawn(async move {
            state.event_loop(swarm, cmd_rx).await;
        });

        Ok((handle, join))
    }
}

struct NodeState {
    config: NetConfig,
    key: identity::Keypair,
    resolver: Arc<dyn BootstrapResolver>,
    local_peer_id: PeerId,
    event_tx: broadcast::Sender<NetEvent>,
    connected: Arc<Mutex<HashSet<PeerId>>>,
    supervisor: ReconnectSupervisor,
    reachability: Reachability,
    inbound_peers: HashSet<PeerId>,
    pending_outbound: HashMap<request_response::OutboundRequestId, oneshot::Sender<Result<bool, NetError>>>,
    subscribed_topics: HashSet<String>,
}

impl NodeState {
    async fn event_loop(mut self, mut swarm: NodeSwarm, mut cmd_rx: mpsc::Receiver<NetCommand>) {
        let mut supervisor_tick = interval_at(
            Instant::now() + crate::reconnect::TICK_INTERVAL,
            crate::reconnect::TICK_INTERVAL,
        );
        supervisor_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Kick off the initial bootstrap dial immediately — zero connections
        // at start is the `tick()=0` case (spec.md §4.3).
        self.reconnect_to_bootstrap(&mut swarm).await;

        loop {
            tokio::select! {
                event = swarm.select_next_some() => {
                    self.on_swarm_event(&mut swarm, event).await;
                }
                _ = supervisor_tick.tick() => {
                    self.on_supervisor_tick(&mut swarm).await;
                }
                Some(cmd) = cmd_rx.recv() => {
                    if self.on_command(&mut swarm, cmd) { break; }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }
        tracing::info!("peer network shut down");
    }

    async fn on_swarm_event(&mut self, swarm: &mut NodeSwarm, event: SwarmEvent<NodeBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!(%address, "listening");
                self.emit(NetEvent::Listening(address));
            }
            SwarmEvent::ConnectionEstablished { peer_id, endpoint, num_established, .. } => {
                self.connected.lock().unwrap().insert(peer_id);
                self.supervisor.on_connect(peer_id, SystemTime::now());
                if endpoint.is_listener() {
                    self.inbound_peers.insert(peer_id);
                }
                let via_relay = endpoint.is_relayed();
                tracing::debug!(%peer_id, via_relay, connections = num_established, "connected");
                self.emit(NetEvent::Connected { peer_id, via_relay });
                self.evict_excess_inbound(swarm);
            }
            SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                if num_established == 0 {
                    self.connected.lock().unwrap().remove(&peer_id);
                    self.inbound_peers.remove(&peer_id);
                    self.supervisor.on_disconnect(peer_id);
                    self.emit(NetEvent::Disconnected { peer_id });
                }
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Mdns(mdns::Event::Discovered(list))) => {
                for (peer_id, addr) in list {
                    swarm.add_peer_address(peer_id, addr.clone());
                    self.supervisor.on_discovery(peer_id, vec![addr], SystemTime::now());
                    self.emit(NetEvent::PeerDiscovered { peer_id });
                    if swarm.is_connected(&peer_id)
                        || self.connected.lock().unwrap().len() >= self.config.max_connections
                    {
                        continue;
                    }
                    let _ = swarm.dial(DialOpts::peer_id(peer_id).build());
                }
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Mdns(mdns::Event::Expired(_))) => {}
            SwarmEvent::Behaviour(NodeBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. })) => {
                for addr in info.listen_addrs {
                    swarm.add_peer_address(peer_id, addr);
                }
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Autonat(event)) => {
                self.on_autonat_event(swarm, event);
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Dcutr(dcutr::Event { remote_peer_id, result })) => {
                match result {
                    Ok(_) => tracing::info!(%remote_peer_id, "dcutr upgrade to direct connection succeeded"),
                    Err(e) => tracing::debug!(%remote_peer_id, error = %e, "dcutr upgrade failed, staying relayed"),
                }
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                message, ..
            })) => {
                self.on_gossip_message(message);
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Direct(event)) => {
                self.on_direct_event(swarm, event);
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Ping(ping::Event { peer, result, .. })) => match result {
                Ok(rtt) => tracing::debug!(%peer, rtt_ms = rtt.as_millis(), "keep-alive ping"),
                Err(error) => tracing::warn!(%peer, %error, "keep-alive ping failed"),
            },
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                tracing::debug!(?peer_id, %error, "dial failed");
            }
            _ => {}
        }
    }

    fn on_autonat_event(&mut self, swarm: &mut NodeSwarm, event: autonat::v2::client::Event) {
        let new_reachability = match event.result {
            Ok(()) => Reachability::Public,
            Err(_) => Reachability::Private,
        };
        if new_reachability == self.reachability {
            return;
        }
        self.reachability = new_reachability;
        tracing::info!(reachability = ?new_reachability, "reachability changed");
        self.emit(NetEvent::ReachabilityChanged(new_reachability));
        match new_reachability {
            Reachability::Public => swarm
                .behaviour_mut()
                .enable_relay_server(&self.key, self.config.max_relayed_connections),
            Reachability::Private | Reachability::Unknown => {
                swarm.behaviour_mut().disable_relay_server()
            }
        }
    }

    fn on_gossip_message(&mut self, message: gossipsub::Message) {
        let topic = message.topic.to_string();
        match cbor_decode::<Envelope>(&message.data) {
            Ok(envelope) => self.emit(NetEvent::GossipMessage { topic, envelope }),
            Err(e) => tracing::warn!(%topic, error = %e, "dropping undecodable gossip message"),
        }
    }

    fn on_direct_event(&mut self, swarm: &mut NodeSwarm, event: request_response::Event<Envelope, Ack>) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                request_response::Message::Request { request, channel, .. } => {
                    // Ack immediately — no business-level reply travels on this
                    // stream (spec.md §4.5); any reply goes out separately via C6.
                    let _ = swarm.behaviour_mut().direct.send_response(channel, Ack);
                    self.emit(NetEvent::DirectMessage { from: peer, envelope: request });
                }
                request_response::Message::Response { request_id, .. } => {
                    if let Some(reply_tx) = self.pending_outbound.remove(&request_id) {
                        let _ = reply_tx.send(Ok(true));
                    }
                }
            },
            request_response::Event::OutboundFailure { request_id, error, .. } => {
                if let Some(reply_tx) = self.pending_outbound.remove(&request_id) {
                    let _ = reply_tx.send(Err(NetError::Timeout(Duration::from_secs(10))));
                }
                tracing::debug!(%error, "direct send failed");
            }
            request_response::Event::InboundFailure { error, .. } => {
                if let Some(frame_err) = as_frame_error(&error) {
                    tracing::warn!(%frame_err, "oversize inbound direct frame, aborting stream");
                } else {
                    tracing::debug!(%error, "inbound direct stream failed");
                }
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }

    async fn on_supervisor_tick(&mut self, swarm: &mut NodeSwarm) {
        match self.supervisor.tick(self.config.min_connections, SystemTime::now()) {
            TickAction::Idle => {}
            TickAction::ReconnectToBootstrap => self.reconnect_to_bootstrap(swarm).await,
            TickAction::Redial(targets) => {
                for (peer, addrs) in targets {
                    tracing::info!(%peer, "reconnect supervisor redialing");
                    let _ = swarm.dial(DialOpts::peer_id(peer).addresses(addrs).build());
                }
            }
        }
    }

    async fn reconnect_to_bootstrap(&mut self, swarm: &mut NodeSwarm) {
        for entry in self.config.bootstrap.clone() {
            match self.resolver.resolve(&entry).await {
                Ok(addrs) => {
                    for addr in addrs {
                        if let Err(e) = swarm.dial(addr.clone()) {
                            tracing::warn!(%addr, error = %e, "bootstrap dial failed");
                        }
                    }
                }
                Err(e) => tracing::warn!(entry = %entry, error = %e, "bootstrap entry did not resolve"),
            }
        }
    }

    /// Evict unused inbound connections above `inboundConnectionThreshold`
    /// (spec.md §4.2). "Unused" here means not currently tracked by the
    /// reconnect supervisor as an actively-reconnected peer — a coarse but
    /// safe proxy since inbound connections are opened by the remote side
    /// and this node has no queue depth signal for them.
    fn evict_excess_inbound(&mut self, swarm: &mut NodeSwarm) {
        if self.inbound_peers.len() <= self.config.inbound_connection_threshold {
            return;
        }
        let excess = self.inbound_peers.len() - self.config.inbound_connection_threshold;
        let victims: Vec<PeerId> = self.inbound_peers.iter().take(excess).copied().collect();
        for peer in victims {
            tracing::debug!(%peer, "evicting inbound connection above threshold");
            let _ = swarm.disconnect_peer_id(peer);
            self.inbound_peers.remove(&peer);
        }
    }

    fn on_command(&mut self, swarm: &mut NodeSwarm, cmd: NetCommand) -> bool {
        match cmd {
            NetCommand::SendDirect { peer, envelope, reply_tx } => {
                let request_id = swarm.behaviour_mut().direct.send_request(&peer, envelope);
                self.pending_outbound.insert(request_id, reply_tx);
                false
            }
            NetCommand::Publish { topic, envelope, reply_tx } => {
                let result = cbor_encode(&envelope)
                    .map_err(|e| NetError::Codec(e.to_string()))
                    .and_then(|data| {
                        let ident_topic = gossipsub::IdentTopic::new(topic);
                        match swarm.behaviour_mut().gossipsub.publish(ident_topic, data) {
                            Ok(_) => Ok(()),
                            // Zero-peer publishing must still succeed (spec.md §4.4).
                            Err(gossipsub::PublishError::InsufficientPeers) => Ok(()),
                            Err(e) => Err(crate::pubsub::classify_publish_error(&e)),
                        }
                    });
                let _ = reply_tx.send(result);
                false
            }
            NetCommand::Subscribe { topic } => {
                if self.subscribed_topics.insert(topic.clone()) {
                    let ident_topic = gossipsub::IdentTopic::new(&topic);
                    if let Err(e) = swarm.behaviour_mut().gossipsub.subscribe(&ident_topic) {
                        tracing::warn!(%topic, error = %e, "subscribe failed");
                    }
                }
                false
            }
            NetCommand::MeshPeerCount { topic, reply_tx } => {
                let ident_topic = gossipsub::IdentTopic::new(&topic);
                let count = swarm.behaviour_mut().gossipsub.mesh_peers(&ident_topic.hash()).count();
                let _ = reply_tx.send(count);
                false
            }
            NetCommand::Metrics { reply_tx } => {
                let _ = reply_tx.send(self.supervisor.metrics());
                false
            }
            NetCommand::Shutdown => true,
        }
    }

    fn emit(&self, event: NetEvent) {
        let _ = self.event_tx.send(event);
    }
}

fn as_frame_error(error: &request_response::InboundFailure) -> Option<String> {
    match error {
        request_response::InboundFailure::Io(e) => {
            crate::protocol::codec::as_frame_error(e).map(|fe| fe.to_string())
        }
        _ => None,
    }
}

fn build_swarm(key: &identity::Keypair, config: &NetConfig) -> Result<NodeSwarm, NetError> {
    let local_peer_id = PeerId::from(key.public());
    let (relay_transport, relay_client) = relay::client::new(local_peer_id);

    let tcp_transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
        .upgrade(upgrade::Version::V1)
        .authenticate(noise::Config::new(key).map_err(|e| NetError::Keypair(e.to_string()))?)
        .multiplex(yamux::Config::default())
        .map(|(p, m), _| (p, StreamMuxerBox::new(m)));

    let relay_transport = relay_transport
        .upgrade(upgrade::Version::V1)
        .authenticate(noise::Config::new(key).map_err(|e| NetError::Keypair(e.to_string()))?)
        .multiplex(yamux::Config::default())
        .map(|(p, m), _| (p, StreamMuxerBox::new(m)));

    let transport = tcp_transport
        .or_transport(relay_transport)
        .map(|either, _| match either {
            futures::future::Either::Left(v) => v,
            futures::future::Either::Right(v) => v,
        })
        .boxed();

    let behaviour = NodeBehaviour::new(
        key,
        relay_client,
        config.max_message_size,
        config.keep_alive_interval,
        config.keep_alive_timeout,
    )
    .map_err(NetError::Codec)?;

    Ok(Swarm::new(transport, behaviour, local_peer_id, default_swarm_config()))
}
