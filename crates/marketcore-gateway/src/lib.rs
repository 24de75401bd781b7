// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! C10 — Request Façade: the node's synchronous HTTP surface onto the async
//! mesh (spec.md §4.10). Everything below the façade — discovery, the
//! auction, session tracking, signing — belongs to `marketcore-net` and
//! `marketcore-market`; this crate only bridges HTTP requests onto it.

pub mod crypto;
pub mod gateway;
pub mod http;

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use marketcore_market::{LedgerClient, ModelAccumulatorHandle, ProcessError};
use marketcore_net::{log_layer::LogEntry, Envelope, NetHandle};

pub use http::auth::AuthState;

/// Number of recent log entries `/health/logs` keeps around.
const LOG_FEED_CAPACITY: usize = 200;

/// Drains a `LogCaptureLayer`'s broadcast receiver into a bounded ring
/// buffer the façade can poll synchronously (spec.md's `/health`-adjacent
/// diagnostics feed) without every request subscribing to its own channel.
pub fn spawn_log_feed(mut rx: tokio::sync::broadcast::Receiver<LogEntry>) -> Arc<Mutex<VecDeque<LogEntry>>> {
    let buffer = Arc::new(Mutex::new(VecDeque::with_capacity(LOG_FEED_CAPACITY)));
    let buffer_task = Arc::clone(&buffer);
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(entry) => {
                    let mut buf = buffer_task.lock().unwrap();
                    if buf.len() == LOG_FEED_CAPACITY {
                        buf.pop_front();
                    }
                    buf.push_back(entry);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    buffer
}

/// Shared state threaded through every axum handler.
#[derive(Clone)]
pub struct AppState {
    pub net: NetHandle,
    pub ledger: Arc<dyn LedgerClient>,
    pub auction: marketcore_market::AuctionHandle,
    pub sessions: marketcore_market::SessionHandle,
    pub model_accumulator: ModelAccumulatorHandle,
    pub self_wallet_addr: String,
    pub well_known_topic: String,
    /// How long `/v1/models` and the quote-selection half of
    /// `/v1/chat/completions` wait for the mesh to answer — the
    /// `quoteEngine.waitTime` window (spec.md §4.8/§4.10).
    pub auction_window: Duration,
    /// How long `/v1/chat/completions` waits for the full contract round
    /// trip after a provider is selected, before answering with a gateway
    /// timeout (spec.md §4.10).
    pub session_deadline: Duration,
    /// Recent structured log entries, fed by `LogCaptureLayer` — backs
    /// `/health/logs`.
    pub log_feed: Arc<Mutex<VecDeque<LogEntry>>>,
}

impl AppState {
    pub async fn ledger_sign(&self, envelope: Envelope) -> Result<Envelope, String> {
        let bytes = envelope.canonical_bytes();
        let signature = self
            .ledger
            .sign_object(&bytes)
            .await
            .map_err(|e| ProcessError::from(e).to_string())?;
        Ok(envelope.with_signature(signature))
    }
}
