// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! C8 — Quote Auction Engine (spec.md §4.8), grounded in `marketcore-net`'s
//! handle/task-loop shape (`NetHandle`/`NodeState`): a cheap, clone-able
//! handle in front of an owned task that serializes all mutation of the
//! bid buffers, with per-session one-shot timers managed inside the loop
//! rather than as free-floating spawned tasks (so shutdown can abort every
//! outstanding timer without leaking).

use std::{collections::HashMap, sync::Arc, time::Duration};

use libp2p::PeerId;
use marketcore_config::SelectionPolicy;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};

use crate::ledger::LedgerClient;

/// `payload.quote` (spec.md §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub model: String,
    #[serde(rename = "inputCount")]
    pub input_count: u64,
    #[serde(rename = "tokenCount")]
    pub token_count: u64,
    #[serde(rename = "pricePerMillion")]
    pub price_per_million: f64,
    #[serde(rename = "totalPrice")]
    pub total_price: f64,
    pub addr: String,
}

/// `QuoteBid` (spec.md §3), keyed by session id in an ordered list.
#[derive(Debug, Clone)]
pub struct QuoteBid {
    pub from_peer: PeerId,
    pub quote: Quote,
}

/// `quote-selected-<id>` (spec.md §4.8).
#[derive(Debug, Clone)]
pub struct QuoteSelected {
    pub session_id: String,
    pub bid: QuoteBid,
}

enum AuctionCommand {
    AddBid { session_id: String, bid: QuoteBid },
    Shutdown,
}

/// Cheap, clone-able handle to the running auction engine.
#[derive(Clone)]
pub struct AuctionHandle {
    cmd_tx: mpsc::Sender<AuctionCommand>,
    event_tx: broadcast::Sender<QuoteSelected>,
}

impl AuctionHandle {
    /// `addBid(bid)` (spec.md §4.8). Bids arriving after the session's
    /// window has already fired are silently discarded by the engine.
    pub fn add_bid(&self, session_id: impl Into<String>, bid: QuoteBid) {
        let _ = self.cmd_tx.try_send(AuctionCommand::AddBid {
            session_id: session_id.into(),
            bid,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QuoteSelected> {
        self.event_tx.subscribe()
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(AuctionCommand::Shutdown).await;
    }
}

/// Spawns the auction engine and returns a handle to it.
///
/// `asset_id` is the protocol asset whose balance the `highest-stake`
/// selection policy consults (spec.md §4.8); it is unused by the other
/// three policies.
pub fn spawn_auction_engine(
    wait_time: Duration,
    selection: SelectionPolicy,
    ledger: Arc<dyn LedgerClient>,
    asset_id: u64,
) -> AuctionHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel(256);
    let (fire_tx, mut fire_rx) = mpsc::channel::<String>(256);
    let (event_tx, _) = broadcast::channel(256);

    let handle = AuctionHandle { cmd_tx, event_tx: event_tx.clone() };

    tokio::spawn(async move {
        let mut bids: HashMap<String, Vec<QuoteBid>> = HashMap::new();
        let mut timers: HashMap<String, JoinHandle<()>> = HashMap::new();

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(AuctionCommand::AddBid { session_id, bid }) => {
                            let is_first = !bids.contains_key(&session_id);
                            bids.entry(session_id.clone()).or_default().push(bid);
                            if is_first {
                                let fire_tx = fire_tx.clone();
                                let id = session_id.clone();
                                let timer = tokio::spawn(async move {
                                    tokio::time::sleep(wait_time).await;
                                    let _ = fire_tx.send(id).await;
                                });
                                timers.insert(session_id, timer);
                            }
                        }
                        Some(AuctionCommand::Shutdown) | None => {
                            for (_, timer) in timers.drain() {
                                timer.abort();
                            }
                            break;
                        }
                    }
                }
                Some(session_id) = fire_rx.recv() => {
                    timers.remove(&session_id);
                    // A bid list may have been removed by a prior fire for
                    // the same id if callers reuse ids (spec.md §4.9 rules
                    // this out, but the engine stays defensive).
                    let Some(list) = bids.remove(&session_id) else { continue };
                    if let Some(bid) = select_winner(list, selection, &*ledger, asset_id).await {
                        let _ = event_tx.send(QuoteSelected { session_id, bid });
                    }
                }
            }
        }
    });

    handle
}

async fn select_winner(
    bids: Vec<QuoteBid>,
    policy: SelectionPolicy,
    ledger: &dyn LedgerClient,
    asset_id: u64,
) -> Option<QuoteBid> {
    if bids.is_empty() {
        return None;
    }
    match policy {
        SelectionPolicy::Cheapest => bids.into_iter().min_by(|a, b| {
            a.quote
                .total_price
                .partial_cmp(&b.quote.total_price)
                .unwrap_or(std::cmp::Ordering::Equal)
        }),
        SelectionPolicy::First => bids.into_iter().next(),
        SelectionPolicy::Random => {
            let idx = rand::thread_rng().gen_range(0..bids.len());
            bids.into_iter().nth(idx)
        }
        SelectionPolicy::HighestStake => {
            let mut best: Option<(u64, QuoteBid)> = None;
            for bid in bids {
                let balance = balance_of(ledger, &bid.quote.addr, asset_id).await;
                let keep = match &best {
                    None => true,
                    Some((best_balance, _)) => balance > *best_balance,
                };
                if keep {
                    best = Some((balance, bid));
                }
            }
            best.map(|(_, bid)| bid)
        }
    }
}

async fn balance_of(ledger: &dyn LedgerClient, addr: &str, asset_id: u64) -> u64 {
    match ledger.check_opted_in_to_asset(addr, asset_id).await {
        Ok(status) if status.opted_in => status.balance,
        Ok(_) => 0,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::fake::FakeLedger;

    fn bid(peer: PeerId, total_price: f64, addr: &str) -> QuoteBid {
        QuoteBid {
            from_peer: peer,
            quote: Quote {
                model: "gpt-oss:20b".into(),
                input_count: 1,
                token_count: 10,
                price_per_million: 2.0,
                total_price,
                addr: addr.into(),
            },
        }
    }

    #[tokio::test]
    async fn cheapest_policy_picks_lowest_total_price() {
        let ledger: Arc<dyn LedgerClient> = Arc::new(FakeLedger::default());
        let handle = spawn_auction_engine(Duration::from_millis(30), SelectionPolicy::Cheapest, ledger, 1);
        let mut events = handle.subscribe();

        let p1 = PeerId::random();
        let p2 = PeerId::random();
        handle.add_bid("s1", bid(p1, 0.02, "P1"));
        handle.add_bid("s1", bid(p2, 0.017, "P2"));

        let selected = tokio::time::timeout(Duration::from_millis(500), events.recv())
            .await
            .expect("no event")
            .unwrap();
        assert_eq!(selected.session_id, "s1");
        assert_eq!(selected.bid.quote.addr, "P2");
    }

    #[tokio::test]
    async fn first_policy_picks_earliest_arrival() {
        let ledger: Arc<dyn LedgerClient> = Arc::new(FakeLedger::default());
        let handle = spawn_auction_engine(Duration::from_millis(30), SelectionPolicy::First, ledger, 1);
        let mut events = handle.subscribe();

        handle.add_bid("s1", bid(PeerId::random(), 0.03, "P1"));
        handle.add_bid("s1", bid(PeerId::random(), 0.01, "P2"));

        let selected = events.recv().await.unwrap();
        assert_eq!(selected.bid.quote.addr, "P1");
    }

    #[tokio::test]
    async fn late_bid_after_window_closes_is_discarded() {
        let ledger: Arc<dyn LedgerClient> = Arc::new(FakeLedger::default());
        let handle = spawn_auction_engine(Duration::from_millis(20), SelectionPolicy::Cheapest, ledger, 1);
        let mut events = handle.subscribe();

        handle.add_bid("s1", bid(PeerId::random(), 0.02, "P1"));
        let selected = events.recv().await.unwrap();
        assert_eq!(selected.bid.quote.addr, "P1");

        // Late bid for the same (already-closed) session id must not
        // produce a second selection event.
        handle.add_bid("s1", bid(PeerId::random(), 0.001, "P2"));
        let late = tokio::time::timeout(Duration::from_millis(200), events.recv()).await;
        assert!(late.is_err(), "no second quote-selected event should fire for s1");
    }

    #[tokio::test]
    async fn distinct_sessions_get_independent_windows() {
        let ledger: Arc<dyn LedgerClient> = Arc::new(FakeLedger::default());
        let handle = spawn_auction_engine(Duration::from_millis(30), SelectionPolicy::Cheapest, ledger, 1);
        let mut events = handle.subscribe();

        handle.add_bid("s1", bid(PeerId::random(), 0.02, "P1"));
        handle.add_bid("s2", bid(PeerId::random(), 0.05, "P2"));

        let mut seen = std::collections::HashSet::new();
        for _ in 0..2 {
            let selected = tokio::time::timeout(Duration::from_millis(500), events.recv())
                .await
                .unwrap()
                .unwrap();
            seen.insert(selected.session_id);
        }
        assert!(seen.contains("s1") && seen.contains("s2"));
    }
}
