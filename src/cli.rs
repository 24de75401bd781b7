// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "marketcored", about = "Peer-to-peer messaging core for a distributed inference marketplace", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v = debug, -vv = trace).
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load config, start the node, and block until Ctrl-C.
    Run {
        /// Path to the node config file (overrides auto-discovery).
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
        /// Override `node.url`/`node.port`'s listen multiaddr, e.g. `/ip4/0.0.0.0/tcp/4001`.
        #[arg(long)]
        listen: Option<String>,
        /// Bearer key for the configured model provider's API (overrides `models.apiKey`).
        #[arg(long, env = "MARKETCORE_API_KEY")]
        api_key: Option<String>,
        /// Algorand wallet mnemonic used to sign outgoing envelopes (overrides `algorand.mnemonic`).
        #[arg(long, env = "ALGORAND_MNEMONIC")]
        algorand_mnemonic: Option<String>,
    },

    /// Force-generate a fresh identity file.
    ///
    /// Refuses to overwrite an existing valid identity without `--force`.
    Keygen {
        /// Path to the identity file (defaults to `node.identityPath` from config).
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
        /// Overwrite an existing identity file.
        #[arg(long)]
        force: bool,
    },

    /// Bearer-token management for the request façade.
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Print the effective configuration and exit.
    ShowConfig {
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
pub enum TokenCommands {
    /// Mint a new bearer key for `api.keys`. Printed once; paste it into config.
    Regenerate,
}
