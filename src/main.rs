// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use libp2p::Multiaddr;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands, TokenCommands};
use marketcore_gateway::AppState;
use marketcore_market::{
    spawn_auction_engine, spawn_model_accumulator, spawn_session_hub, HttpModelClient,
    LedgerBootstrapResolver, LedgerClient, MessageProcessor, NullLedger, ProcessConfig,
};
use marketcore_net::{log_layer::LogEntry, Node, NetConfig, NetEvent, NetHandle, PeerIdentity};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_rx = init_logging(cli.verbose);

    match cli.command {
        Commands::Run { config, listen, api_key, algorand_mnemonic } => {
            run(config, listen, api_key, algorand_mnemonic, log_rx).await
        }
        Commands::Keygen { path, config, force } => keygen(path, config, force),
        Commands::Token { command: TokenCommands::Regenerate } => {
            println!("{}", marketcore_gateway::gateway::regenerate_token());
            Ok(())
        }
        Commands::ShowConfig { config } => {
            let config = marketcore_config::load(config.as_deref())?;
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            Ok(())
        }
    }
}

fn init_logging(verbosity: u8) -> tokio::sync::broadcast::Receiver<LogEntry> {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let (log_layer, log_rx) = marketcore_net::log_layer::build_log_channel();
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(log_layer)
        .with(filter)
        .try_init();
    log_rx
}

fn keygen(path: Option<std::path::PathBuf>, config: Option<std::path::PathBuf>, force: bool) -> anyhow::Result<()> {
    let identity_path = match path {
        Some(p) => p,
        None => std::path::PathBuf::from(marketcore_config::load(config.as_deref())?.node.identity_path),
    };

    if identity_path.exists() && !force {
        anyhow::bail!(
            "identity already exists at '{}'; pass --force to overwrite",
            identity_path.display()
        );
    }
    if force && identity_path.exists() {
        std::fs::remove_file(&identity_path)
            .with_context(|| format!("removing existing identity at '{}'", identity_path.display()))?;
    }

    let identity = PeerIdentity::load_or_create(&identity_path)?;
    println!("generated identity '{}' at '{}'", identity.peer_id(), identity_path.display());
    Ok(())
}

/// Loads config, assembles C1-C11, and serves the node until Ctrl-C.
///
/// Assembly order mirrors `gateway::run`'s own doc comment: identity and
/// peer network first (everything else needs `NetHandle`/the node's own
/// wallet address), then the ledger/model collaborators, then the
/// C8/C9/C11 engines, then C7 wired against all of them, then the HTTP
/// façade, then the ingress loop that feeds `NetEvent`s into C7.
async fn run(
    config_path: Option<std::path::PathBuf>,
    listen_override: Option<String>,
    api_key_override: Option<String>,
    algorand_mnemonic_override: Option<String>,
    log_rx: tokio::sync::broadcast::Receiver<LogEntry>,
) -> anyhow::Result<()> {
    let mut config = marketcore_config::load(config_path.as_deref())?;
    // Secrets never come from the YAML layers (see `loader::load`'s doc
    // comment) — they're overlaid here from clap's `env` attribute.
    if api_key_override.is_some() {
        config.models.api_key = api_key_override;
    }
    if algorand_mnemonic_override.is_some() {
        config.algorand.mnemonic = algorand_mnemonic_override;
    }

    let identity = PeerIdentity::load_or_create(std::path::Path::new(&config.node.identity_path))?;
    identity.verify_matches_disk()?;
    let self_wallet_addr = identity.peer_id().to_string();
    info!(peer_id = %self_wallet_addr, "node identity loaded");

    let ledger: Arc<dyn LedgerClient> = Arc::new(NullLedger::new(identity.keypair().clone()));
    let model = Arc::new(HttpModelClient::new(
        format!("{}:{}", config.models.base_url, config.models.port),
        config.models.api_key.clone(),
    ));

    let listen_addr: Multiaddr = match listen_override {
        Some(addr) => addr.parse().context("--listen is not a valid multiaddr")?,
        None => format!("/ip4/0.0.0.0/tcp/{}", config.node.port)
            .parse()
            .expect("host/port always produce a valid multiaddr"),
    };

    let net_config = NetConfig {
        listen_addr,
        bootstrap: config.node.libp2p_bootstrap_servers.clone(),
        min_connections: config.node.min_connections,
        max_connections: config.node.max_connections,
        inbound_connection_threshold: config.node.inbound_connection_threshold,
        max_relayed_connections: config.relay.max_relayed_connections,
        direct_messaging_enabled: config.direct_messaging.enabled,
        max_message_size: config.direct_messaging.max_message_size,
        fallback_to_gossipsub: config.direct_messaging.fallback_to_gossipsub,
        well_known_topic: config.quote_engine.well_known_topic.clone(),
        ..NetConfig::default()
    };

    let resolver = Arc::new(LedgerBootstrapResolver::new(Arc::clone(&ledger)));
    let node = Node::new(net_config, identity.keypair().clone(), resolver);
    let (net, net_join) = node.spawn().await?;
    net.subscribe(&config.quote_engine.well_known_topic).await?;

    let auction_window = std::time::Duration::from_millis(config.quote_engine.wait_time_ms);
    let auction = spawn_auction_engine(
        auction_window,
        config.quote_engine.quote_selection_function,
        Arc::clone(&ledger),
        config.algorand.asset_id,
    );
    let sessions = spawn_session_hub();
    let (model_accumulator, _compiled) = spawn_model_accumulator(auction_window);

    let process_config = ProcessConfig {
        self_wallet_addr: self_wallet_addr.clone(),
        well_known_topic: config.quote_engine.well_known_topic.clone(),
        direct_messaging_enabled: config.direct_messaging.enabled,
        fallback_to_gossipsub: config.direct_messaging.fallback_to_gossipsub,
        protocol_asset_id: config.algorand.asset_id,
        charge_per_1m_tokens: config.models.charge_per_1m_tokens.clone(),
    };
    let processor = Arc::new(MessageProcessor::new(
        net.clone(),
        Arc::clone(&ledger),
        model,
        auction.clone(),
        sessions.clone(),
        model_accumulator.clone(),
        process_config,
    ));

    let app_state = AppState {
        net: net.clone(),
        ledger: Arc::clone(&ledger),
        auction,
        sessions,
        model_accumulator,
        self_wallet_addr: self_wallet_addr.clone(),
        well_known_topic: config.quote_engine.well_known_topic.clone(),
        auction_window,
        session_deadline: std::time::Duration::from_millis(config.direct_messaging.timeout),
        log_feed: marketcore_gateway::spawn_log_feed(log_rx),
    };

    let gateway_config = config.api.clone();
    let gateway_join = tokio::spawn(async move {
        if let Err(e) = marketcore_gateway::gateway::run(&gateway_config, app_state).await {
            tracing::error!(error = %e, "request façade exited");
        }
    });

    let ingress_join = tokio::spawn(ingress_loop(net.clone(), Arc::clone(&processor), self_wallet_addr));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
        _ = gateway_join => info!("request façade task ended"),
        _ = ingress_join => info!("ingress loop ended"),
    }

    net.shutdown().await;
    net_join.abort();
    Ok(())
}

/// Step 1 of spec.md §4.7's pipeline: drop any envelope explicitly addressed
/// to a different peer before it ever reaches [`MessageProcessor::process`].
/// Broadcast-only roles never set `to`, so they always pass through here.
async fn ingress_loop(net: NetHandle, processor: Arc<MessageProcessor>, self_addr: String) {
    let mut events = net.subscribe_events();
    loop {
        let event = match events.recv().await {
            Ok(e) => e,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };

        let (envelope, source_peer) = match event {
            NetEvent::DirectMessage { from, envelope } => (envelope, Some(from)),
            NetEvent::GossipMessage { envelope, .. } => (envelope, None),
            _ => continue,
        };

        if matches!(&envelope.to, Some(to) if to != &self_addr) {
            continue;
        }

        if let Err(e) = processor.process(envelope, source_peer).await {
            tracing::debug!(error = %e, "envelope rejected");
        }
    }
}
