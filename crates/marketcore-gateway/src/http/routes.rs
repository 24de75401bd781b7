// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! C10 — Request Façade (spec.md §4.10): the node's only HTTP surface, a
//! thin bridge from a synchronous HTTP request onto the async mesh.

use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use marketcore_market::{Quote, SessionEvent};
use marketcore_net::Envelope;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::AppState;

/// `/health` never requires a bearer token (spec.md §4.10).
pub fn public_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/logs", get(health_logs))
        .with_state(state)
}

/// `/peers`, `/v1/models`, `/v1/chat/completions` — covered by the optional
/// bearer allowlist when `api.bearerAuthentication` is set.
pub fn protected_router(state: AppState) -> Router {
    Router::new()
        .route("/peers", get(peers))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(state)
}

/// Reports liveness beyond a bare 200 — the reconnect supervisor's counters
/// (spec.md §4.3's `PeerRecord` bookkeeping, exposed read-only).
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = state.net.metrics().await;
    Json(json!({
        "status": "ok",
        "connectedPeers": metrics.connected,
        "reconnecting": metrics.reconnecting,
        "evictedToday": metrics.evicted_today,
    }))
}

/// Recent structured log entries captured from the P2P subsystem, newest
/// last — a diagnostics feed alongside `/health` (spec.md §7).
async fn health_logs(State(state): State<AppState>) -> impl IntoResponse {
    let entries: Vec<_> = state.log_feed.lock().unwrap().iter().cloned().collect();
    Json(json!({ "entries": entries }))
}

async fn peers(State(state): State<AppState>) -> impl IntoResponse {
    let peers: Vec<String> = state.net.connected_peers().iter().map(|p| p.to_string()).collect();
    Json(json!({ "peers": peers }))
}

/// `GET /v1/models`: publishes `list-models` on the well-known topic, waits
/// for the accumulator's compiled `model-list-compiled` event within the
/// auction window, and returns it (spec.md §4.10).
async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let mut compiled = state.model_accumulator.subscribe();

    let envelope = Envelope::new("list-models", &state.self_wallet_addr, json!({}));
    let envelope = match state.ledger_sign(envelope).await {
        Ok(e) => e,
        Err(e) => return error_response(StatusCode::BAD_GATEWAY, &e),
    };

    if let Err(e) = state.net.publish(state.well_known_topic.clone(), envelope).await {
        return error_response(StatusCode::BAD_GATEWAY, &e.to_string());
    }

    match tokio::time::timeout(state.auction_window, compiled.recv()).await {
        Ok(Ok(models)) => Json(json!({ "models": models })).into_response(),
        _ => error_response(StatusCode::GATEWAY_TIMEOUT, "no models discovered within the auction window"),
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub inputs: Value,
}

#[derive(Debug, Serialize)]
struct ChatCompletionResponse {
    model: String,
    completion: String,
}

/// `POST /v1/chat/completions` (spec.md §4.10): discovers a provider via the
/// quote auction, awaits its contract round-trip, and returns the inference
/// result. Session id is the first 56 hex characters of
/// `sha256(timestamp + body)`, matching spec.md's literal id-derivation rule.
async fn chat_completions(State(state): State<AppState>, Json(req): Json<ChatCompletionRequest>) -> impl IntoResponse {
    if state
        .net
        .wait_for_mesh(state.well_known_topic.clone(), 1, Duration::from_secs(5))
        .await
        .is_err()
    {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "no mesh peers reachable");
    }

    let body = json!({ "model": req.model, "inputs": req.inputs });
    let timestamp = chrono::Utc::now().timestamp_millis();
    let session_id = session_id_for(timestamp, &body);

    let mut quote_selected = state.auction.subscribe();
    let mut session_events = state.sessions.subscribe();
    if !state.sessions.start(session_id.clone()).await {
        return error_response(StatusCode::CONFLICT, "a session with this id is already in flight");
    }

    let envelope = Envelope::new("quote-request", &state.self_wallet_addr, body).with_id(session_id.clone());
    let envelope = match state.ledger_sign(envelope).await {
        Ok(e) => e,
        Err(e) => return error_response(StatusCode::BAD_GATEWAY, &e),
    };

    if let Err(e) = state.net.publish(state.well_known_topic.clone(), envelope).await {
        return error_response(StatusCode::BAD_GATEWAY, &e.to_string());
    }

    let winner: Option<Quote> = match tokio::time::timeout(state.auction_window, async {
        loop {
            match quote_selected.recv().await {
                Ok(selected) if selected.session_id == session_id => break Some(selected.bid.quote),
                Ok(_) => continue,
                Err(_) => break None,
            }
        }
    })
    .await
    {
        Ok(winner) => winner,
        Err(_) => None,
    };

    let Some(_winner) = winner else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "no provider produced a quote");
    };

    match tokio::time::timeout(state.session_deadline, async {
        loop {
            match session_events.recv().await {
                Ok(SessionEvent::Completed { session_id: id, completion }) if id == session_id => {
                    break Some(completion)
                }
                Ok(SessionEvent::Failed { session_id: id, reason }) if id == session_id => {
                    break Some(format!("__failed__:{reason}"))
                }
                Ok(_) => continue,
                Err(_) => break None,
            }
        }
    })
    .await
    {
        Ok(Some(completion)) if completion.starts_with("__failed__:") => {
            error_response(StatusCode::BAD_GATEWAY, completion.trim_start_matches("__failed__:"))
        }
        Ok(Some(completion)) => Json(ChatCompletionResponse { model: req.model, completion }).into_response(),
        _ => error_response(StatusCode::GATEWAY_TIMEOUT, "session did not complete before the deadline"),
    }
}

fn session_id_for(timestamp: i64, body: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(timestamp.to_string());
    hasher.update(serde_json::to_vec(body).unwrap_or_default());
    let digest = hasher.finalize();
    hex::encode(digest)[..56].to_string()
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (status, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_is_56_hex_chars() {
        let id = session_id_for(1_700_000_000_000, &json!({"model": "m"}));
        assert_eq!(id.len(), 56);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn session_id_changes_with_body() {
        let a = session_id_for(1, &json!({"model": "a"}));
        let b = session_id_for(1, &json!({"model": "b"}));
        assert_ne!(a, b);
    }
}
