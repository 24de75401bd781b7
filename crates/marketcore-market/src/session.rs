// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! C9 — Session Workflow (spec.md §4.9), grounded in the control-service
//! hub pattern (cheap clone-able handle, an mpsc command queue processed
//! sequentially by one owned task, a broadcast channel fanning out
//! completion events to whoever is awaiting a given session id).
//!
//! Sessions are owned by exactly one peer at a time and keyed by `id`
//! (spec.md §3); this module tracks only the local side's view of that
//! state machine, advanced by C7's role handlers as replies arrive.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Customer path: `DISCOVERING → QUOTED → ACCEPTED → CONTRACT_CREATED →
/// CONTRACT_SIGNED → INFERRED → PAID`. Provider path runs the same state
/// names from its own perspective (spec.md §4.9 describes both as a single
/// shared lifecycle keyed by `id`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Discovering,
    Quoted,
    Accepted,
    ContractCreated,
    ContractSigned,
    Inferred,
    Paid,
    /// Dropped after a terminal error (spec.md §4.9: "no partial rollback").
    Failed,
}

/// `Session` (spec.md §3).
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub state: SessionState,
}

/// Emitted when a session reaches `PAID` (the customer-side facade awaits
/// this to answer its HTTP request) or is dropped on a terminal error.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Completed { session_id: String, completion: String },
    Failed { session_id: String, reason: String },
}

enum SessionCommand {
    /// Registers a session id the first time it is observed, silently
    /// ignoring duplicates (spec.md §4.9: "duplicates with the same id in
    /// the same role are silently dropped").
    Start { session_id: String, reply_tx: oneshot::Sender<bool> },
    Advance { session_id: String, state: SessionState },
    Complete { session_id: String, completion: String },
    Fail { session_id: String, reason: String },
    List { reply_tx: oneshot::Sender<Vec<SessionInfo>> },
}

/// Cheap, clone-able handle to the running session hub.
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<SessionCommand>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    /// Registers `session_id` if this is the first message seen for it.
    /// Returns `true` if this call created the session, `false` if it was
    /// already known — the caller must treat `false` as a silent drop per
    /// spec.md §4.9's single-in-flight-session invariant.
    pub async fn start(&self, session_id: impl Into<String>) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SessionCommand::Start { session_id: session_id.into(), reply_tx })
            .await
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    pub fn advance(&self, session_id: impl Into<String>, state: SessionState) {
        let _ = self.cmd_tx.try_send(SessionCommand::Advance {
            session_id: session_id.into(),
            state,
        });
    }

    pub fn complete(&self, session_id: impl Into<String>, completion: impl Into<String>) {
        let _ = self.cmd_tx.try_send(SessionCommand::Complete {
            session_id: session_id.into(),
            completion: completion.into(),
        });
    }

    pub fn fail(&self, session_id: impl Into<String>, reason: impl Into<String>) {
        let _ = self.cmd_tx.try_send(SessionCommand::Fail {
            session_id: session_id.into(),
            reason: reason.into(),
        });
    }

    /// The customer-side facade (C10) subscribes to this to learn when its
    /// session id reaches `PAID` or fails.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }
}

/// Spawns the session hub task and returns a handle to it.
pub fn spawn_session_hub() -> SessionHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel(512);
    let (event_tx, _) = broadcast::channel(512);
    let handle = SessionHandle { cmd_tx, event_tx: event_tx.clone() };

    tokio::spawn(async move {
        let mut sessions: HashMap<String, SessionInfo> = HashMap::new();
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                SessionCommand::Start { session_id, reply_tx } => {
                    let created = !sessions.contains_key(&session_id);
                    sessions.entry(session_id.clone()).or_insert(SessionInfo {
                        id: session_id,
                        state: SessionState::Discovering,
                    });
                    let _ = reply_tx.send(created);
                }
                SessionCommand::Advance { session_id, state } => {
                    if let Some(s) = sessions.get_mut(&session_id) {
                        s.state = state;
                    }
                }
                SessionCommand::Complete { session_id, completion } => {
                    if let Some(s) = sessions.get_mut(&session_id) {
                        s.state = SessionState::Paid;
                    }
                    let _ = event_tx.send(SessionEvent::Completed { session_id, completion });
                }
                SessionCommand::Fail { session_id, reason } => {
                    if let Some(s) = sessions.get_mut(&session_id) {
                        s.state = SessionState::Failed;
                    }
                    let _ = event_tx.send(SessionEvent::Failed { session_id, reason });
                }
                SessionCommand::List { reply_tx } => {
                    let _ = reply_tx.send(sessions.values().cloned().collect());
                }
            }
        }
    });

    handle
}

/// Parses `payload.model`/`payload.inputs` from a `quote-request`-shaped
/// envelope, used by C10 when it constructs the initial request.
pub fn chat_request_payload(model: &str, inputs: Value) -> Value {
    serde_json::json!({ "model": model, "inputs": inputs })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starting_a_fresh_session_id_succeeds() {
        let handle = spawn_session_hub();
        assert!(handle.start("s1").await);
    }

    #[tokio::test]
    async fn starting_a_duplicate_session_id_is_rejected() {
        let handle = spawn_session_hub();
        assert!(handle.start("s1").await);
        // The session already exists; the second `start` reports `false` so
        // the caller (C7) can silently drop the duplicate per spec.md §4.9.
        assert!(!handle.start("s1").await);
    }

    #[tokio::test]
    async fn completing_a_session_emits_a_completed_event() {
        let handle = spawn_session_hub();
        let mut events = handle.subscribe();
        handle.start("s1").await;
        handle.complete("s1", "the answer");

        let ev = tokio::time::timeout(std::time::Duration::from_millis(200), events.recv())
            .await
            .unwrap()
            .unwrap();
        match ev {
            SessionEvent::Completed { session_id, completion } => {
                assert_eq!(session_id, "s1");
                assert_eq!(completion, "the answer");
            }
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failing_a_session_emits_a_failed_event() {
        let handle = spawn_session_hub();
        let mut events = handle.subscribe();
        handle.start("s1").await;
        handle.fail("s1", "underfunded");

        let ev = events.recv().await.unwrap();
        assert!(matches!(ev, SessionEvent::Failed { reason, .. } if reason == "underfunded"));
    }
}
