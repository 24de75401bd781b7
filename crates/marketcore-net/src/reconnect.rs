//! C3 — Reconnection Supervisor (spec.md §4.3).
//!
//! Owns `PeerRecord`/`ReconnectState` for every peer this node has ever seen
//! and decides, on a 60-second tick, which peers to redial. The supervisor
//! never dials directly — it hands addresses back to the caller (`node.rs`),
//! which owns the swarm.

use std::{
    collections::HashMap,
    time::{Duration, SystemTime},
};

use libp2p::{Multiaddr, PeerId};

/// `attemptCount` ceiling (spec.md §3): after this many failed attempts a
/// peer is left alone until its cooldown elapses.
pub const MAX_ATTEMPTS: u32 = 5;
/// `BASE` backoff unit: delay for attempt *n* is `BASE * 2^n`.
pub const BASE_BACKOFF: Duration = Duration::from_secs(5);
/// Default cooldown after `MAX_ATTEMPTS` is reached.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5 * 60);
/// `PeerRecord` eviction age.
pub const RECORD_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Supervisor tick cadence.
pub const TICK_INTERVAL: Duration = Duration::from_secs(60);
/// Minimum gap between `0 < count < minConnections` recovery dials.
pub const PARTIAL_RECOVERY_INTERVAL: Duration = Duration::from_secs(120);

/// What the supervisor remembers about a peer it has seen at least once.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub last_seen: SystemTime,
    pub multiaddrs: Vec<Multiaddr>,
}

/// Backoff bookkeeping for a peer the supervisor is actively trying to
/// reconnect to.
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    pub attempt_count: u32,
    pub last_attempt_at: Option<SystemTime>,
}

impl ReconnectState {
    /// Delay before the *next* attempt, given `attempt_count` attempts have
    /// already been made: `BASE * 2^attemptCount`, capped at `MAX_ATTEMPTS`.
    pub fn backoff(&self) -> Duration {
        let exp = self.attempt_count.min(MAX_ATTEMPTS);
        BASE_BACKOFF * 2u32.saturating_pow(exp)
    }

    pub fn exhausted(&self) -> bool {
        self.attempt_count >= MAX_ATTEMPTS
    }

    /// Whether the cooldown window since the last attempt has elapsed.
    pub fn cooldown_elapsed(&self, cooldown: Duration, now: SystemTime) -> bool {
        match self.last_attempt_at {
            None => true,
            Some(last) => now.duration_since(last).unwrap_or_default() >= cooldown,
        }
    }

    fn record_attempt(&mut self, now: SystemTime) {
        self.attempt_count += 1;
        self.last_attempt_at = Some(now);
    }

    fn reset(&mut self) {
        self.attempt_count = 0;
        self.last_attempt_at = None;
    }
}

/// Liveness counters exposed to the C10 `/health` handler (SPEC_FULL.md §12
/// supplement — read-only, does not change C3 behavior).
#[derive(Debug, Clone, Default)]
pub struct SupervisorMetrics {
    pub connected: usize,
    pub reconnecting: usize,
    pub evicted_today: u64,
}

/// C3's owned state: every peer record and reconnect-attempt counter.
pub struct ReconnectSupervisor {
    records: HashMap<PeerId, PeerRecord>,
    states: HashMap<PeerId, ReconnectState>,
    connected: std::collections::HashSet<PeerId>,
    cooldown: Duration,
    last_partial_recovery: Option<SystemTime>,
    evicted_today: u64,
}

impl ReconnectSupervisor {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            records: HashMap::new(),
            states: HashMap::new(),
            connected: std::collections::HashSet::new(),
            cooldown,
            last_partial_recovery: None,
            evicted_today: 0,
        }
    }

    /// `onDiscovery(peer, addrs)`.
    pub fn on_discovery(&mut self, peer: PeerId, addrs: Vec<Multiaddr>, now: SystemTime) {
        self.records
            .entry(peer)
            .and_modify(|r| {
                r.last_seen = now;
                for a in &addrs {
                    if !r.multiaddrs.contains(a) {
                        r.multiaddrs.push(a.clone());
                    }
                }
            })
            .or_insert(PeerRecord {
                last_seen: now,
                multiaddrs: addrs,
            });
    }

    /// `onConnect(peer)`: clears backoff state, marks connected.
    pub fn on_connect(&mut self, peer: PeerId, now: SystemTime) {
        self.connected.insert(peer);
        self.states.entry(peer).or_default().reset();
        if let Some(r) = self.records.get_mut(&peer) {
            r.last_seen = now;
        }
    }

    /// `onDisconnect(peer)`: begins backoff tracking from a clean slate.
    pub fn on_disconnect(&mut self, peer: PeerId) {
        self.connected.remove(&peer);
        self.states.entry(peer).or_default();
    }

    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    pub fn metrics(&self) -> SupervisorMetrics {
        SupervisorMetrics {
            connected: self.connected.len(),
            reconnecting: self
                .states
                .values()
                .filter(|s| s.attempt_count > 0 && !s.exhausted())
                .count(),
            evicted_today: self.evicted_today,
        }
    }

    /// Evict `PeerRecord`s not seen within `RECORD_TTL`.
    fn evict_stale(&mut self, now: SystemTime) {
        let before = self.records.len();
        self.records.retain(|_, r| {
            now.duration_since(r.last_seen).unwrap_or_default() < RECORD_TTL
        });
        self.evicted_today += (before - self.records.len()) as u64;
    }

    /// `tick()` (spec.md §4.3): run every 60 s.
    ///
    /// - If there are zero connections, reconnect to bootstrap immediately.
    /// - If `0 < connected < minConnections`, do so at most once per
    ///   `PARTIAL_RECOVERY_INTERVAL`.
    /// - Otherwise, iterate stale `PeerRecord`s and redial any whose cooldown
    ///   has elapsed and whose attempt budget is not exhausted.
    ///
    /// Returns the list of peers (with known addresses) to dial this tick.
    pub fn tick(&mut self, min_connections: usize, now: SystemTime) -> TickAction {
        self.evict_stale(now);

        if self.connected.is_empty() {
            return TickAction::ReconnectToBootstrap;
        }

        if self.connected.len() < min_connections {
            let due = self
                .last_partial_recovery
                .map(|t| now.duration_since(t).unwrap_or_default() >= PARTIAL_RECOVERY_INTERVAL)
                .unwrap_or(true);
            if due {
                self.last_partial_recovery = Some(now);
                return TickAction::ReconnectToBootstrap;
            }
            return TickAction::Idle;
        }

        let mut redial = Vec::new();
        let peers: Vec<PeerId> = self.records.keys().copied().collect();
        for peer in peers {
            if self.connected.contains(&peer) {
                continue;
            }
            let state = self.states.entry(peer).or_default();
            if state.exhausted() {
                if !state.cooldown_elapsed(self.cooldown, now) {
                    continue;
                }
                state.reset();
            }
            if state.attempt_count > 0 && !state.cooldown_elapsed(state.backoff(), now) {
                // Still inside the exponential backoff window for this peer.
                continue;
            }
            if let Some(record) = self.records.get(&peer) {
                state.record_attempt(now);
                redial.push((peer, record.multiaddrs.clone()));
            }
        }
        TickAction::Redial(redial)
    }
}

#[derive(Debug)]
pub enum TickAction {
    Idle,
    ReconnectToBootstrap,
    Redial(Vec<(PeerId, Vec<Multiaddr>)>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sequence_follows_base_times_two_pow_attempts() {
        let mut state = ReconnectState::default();
        let expected = [
            BASE_BACKOFF,
            BASE_BACKOFF * 2,
            BASE_BACKOFF * 4,
            BASE_BACKOFF * 8,
            BASE_BACKOFF * 16,
        ];
        for exp in expected {
            assert_eq!(state.backoff(), exp);
            state.record_attempt(SystemTime::now());
        }
        assert!(state.exhausted());
    }

    #[test]
    fn zero_connections_triggers_immediate_bootstrap_reconnect() {
        let mut sup = ReconnectSupervisor::new(DEFAULT_COOLDOWN);
        let action = sup.tick(2, SystemTime::now());
        assert!(matches!(action, TickAction::ReconnectToBootstrap));
    }

    #[test]
    fn partial_recovery_is_rate_limited() {
        let mut sup = ReconnectSupervisor::new(DEFAULT_COOLDOWN);
        let peer = PeerId::random();
        let now = SystemTime::now();
        sup.on_connect(peer, now);
        // connected=1 < min_connections=2 -> first tick recovers immediately.
        assert!(matches!(sup.tick(2, now), TickAction::ReconnectToBootstrap));
        // second tick right away should be rate-limited to Idle.
        assert!(matches!(sup.tick(2, now), TickAction::Idle));
    }

    #[test]
    fn redial_waits_for_full_exponential_backoff_not_just_base() {
        let mut sup = ReconnectSupervisor::new(DEFAULT_COOLDOWN);
        let peer = PeerId::random();
        let other_a = PeerId::random();
        let other_b = PeerId::random();
        let t0 = SystemTime::now();
        sup.on_discovery(peer, vec![], t0);
        // Two other connected peers keep `tick()` in the per-peer redial
        // branch instead of the `< min_connections` partial-recovery branch.
        sup.on_connect(other_a, t0);
        sup.on_connect(other_b, t0);

        // Attempt 1 (attempt_count 0 -> 1): always immediate, no backoff owed yet.
        let t1 = t0;
        match sup.tick(2, t1) {
            TickAction::Redial(redialed) => assert!(redialed.iter().any(|(p, _)| *p == peer)),
            other => panic!("expected a redial attempt, got {other:?}"),
        }

        // Attempt 2 (attempt_count 1 -> 2): owed backoff is BASE * 2^1 = 10s.
        let t2 = t1 + Duration::from_secs(11);
        match sup.tick(2, t2) {
            TickAction::Redial(redialed) => assert!(redialed.iter().any(|(p, _)| *p == peer)),
            other => panic!("expected a redial attempt, got {other:?}"),
        }

        // Attempt 3 (attempt_count 2 -> 3): owed backoff is BASE * 2^2 = 20s.
        let t3 = t2 + Duration::from_secs(21);
        match sup.tick(2, t3) {
            TickAction::Redial(redialed) => assert!(redialed.iter().any(|(p, _)| *p == peer)),
            other => panic!("expected a redial attempt, got {other:?}"),
        }

        // Attempt 4 (attempt_count 3 -> 4): owed backoff is BASE * 2^3 = 40s.
        let t4 = t3 + Duration::from_secs(41);
        match sup.tick(2, t4) {
            TickAction::Redial(redialed) => assert!(redialed.iter().any(|(p, _)| *p == peer)),
            other => panic!("expected a redial attempt, got {other:?}"),
        }

        // Now attempt_count is 4, so the next owed backoff is BASE * 2^4 = 80s.
        // Only BASE_BACKOFF (5s) plus a hair has elapsed since attempt 4 — the
        // old flat-5s outer gate would have let this redial through; the true
        // exponential schedule must not.
        let barely_past_base = t4 + BASE_BACKOFF + Duration::from_secs(1);
        match sup.tick(2, barely_past_base) {
            TickAction::Redial(redialed) => {
                assert!(!redialed.iter().any(|(p, _)| *p == peer), "redialed before the true 80s backoff elapsed");
            }
            _ => {}
        }

        // Once the real 80s backoff since attempt 4 has elapsed, the peer is
        // eligible again.
        let past_full_backoff = t4 + Duration::from_secs(81);
        match sup.tick(2, past_full_backoff) {
            TickAction::Redial(redialed) => {
                assert!(redialed.iter().any(|(p, _)| *p == peer), "expected redial once the true backoff elapsed");
            }
            other => panic!("expected a redial attempt, got {other:?}"),
        }
    }

    #[test]
    fn stale_peer_records_are_evicted_after_ttl() {
        let mut sup = ReconnectSupervisor::new(DEFAULT_COOLDOWN);
        let peer = PeerId::random();
        let old = SystemTime::now() - RECORD_TTL - Duration::from_secs(1);
        sup.on_discovery(peer, vec![], old);
        sup.on_connect(PeerId::random(), SystemTime::now());
        sup.on_connect(PeerId::random(), SystemTime::now());
        sup.tick(2, SystemTime::now());
        assert_eq!(sup.metrics().evicted_today, 1);
    }
}
