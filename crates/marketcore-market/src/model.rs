// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! C11 — Model collaborator (spec.md §6), consumed interface, plus the
//! `list-models-response` accumulator C7 hands accepted model lists to.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};

use crate::error::ModelError;

/// One entry of `getModels()`'s result / a `list-models-response` payload item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The local OpenAI-compatible inference endpoint's consumed surface
/// (spec.md §6). [`HttpModelClient`] is the production implementation
/// against `models.baseURL`; tests substitute an in-memory fake.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn get_response(&self, model: &str, inputs: &Value) -> Result<String, ModelError>;
    async fn get_models(&self) -> Result<Vec<ModelInfo>, ModelError>;
    /// Deterministic token count for pricing (spec.md §4.7's `RawQuote.tokens`).
    async fn count_tokens(&self, model: &str, inputs: &Value) -> Result<u64, ModelError>;
}

/// `addModel(list)` (spec.md §6): dedupes model lists arriving from multiple
/// peers within one debounce window and emits a single compiled list once
/// the window is quiet, mirroring the quote-auction engine's one-shot-timer
/// shape (C8) at a smaller scope.
#[derive(Clone)]
pub struct ModelAccumulatorHandle {
    cmd_tx: mpsc::Sender<Vec<ModelInfo>>,
    event_tx: broadcast::Sender<Vec<ModelInfo>>,
}

impl ModelAccumulatorHandle {
    pub fn add_models(&self, models: Vec<ModelInfo>) {
        let _ = self.cmd_tx.try_send(models);
    }

    /// A fresh subscription to `model-list-compiled` (spec.md §4.7), starting
    /// from the next round — independent of any other subscriber's cursor.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<ModelInfo>> {
        self.event_tx.subscribe()
    }
}

/// Spawns the accumulator task. `debounce` is the quote-auction window
/// (spec.md §6 ties the two together — "debounces for `waitTime` ms").
/// Returns a cheap handle plus the event stream `model-list-compiled`
/// (spec.md §4.7) is delivered on.
pub fn spawn_model_accumulator(debounce: Duration) -> (ModelAccumulatorHandle, broadcast::Receiver<Vec<ModelInfo>>) {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Vec<ModelInfo>>(256);
    let (event_tx, event_rx) = broadcast::channel(16);
    let handle = ModelAccumulatorHandle { cmd_tx, event_tx: event_tx.clone() };

    tokio::spawn(async move {
        let mut seen: HashMap<String, ModelInfo> = HashMap::new();
        loop {
            // Wait for the first contribution of a new round.
            let Some(batch) = cmd_rx.recv().await else { break };
            for m in batch {
                seen.insert(m.name.clone(), m);
            }

            // Debounce: keep absorbing further contributions until the
            // channel is quiet for `debounce`.
            loop {
                match tokio::time::timeout(debounce, cmd_rx.recv()).await {
                    Ok(Some(batch)) => {
                        for m in batch {
                            seen.insert(m.name.clone(), m);
                        }
                    }
                    Ok(None) => break,
                    Err(_) => break, // quiet for `debounce` — round closes
                }
            }

            let compiled: Vec<ModelInfo> = seen.drain().map(|(_, v)| v).collect();
            let _ = event_tx.send(compiled);
        }
    });

    (handle, event_rx)
}

/// Thin client for the local OpenAI-compatible inference endpoint named by
/// `models.baseURL`/`.port` (spec.md §6). Speaks the same
/// `/chat/completions` + `/models` wire format the rest of the ecosystem's
/// model drivers speak; unlike them this client serves exactly one node's
/// own model roster, so it carries no provider registry or auth-style
/// switch — only a bearer key, sent when configured.
pub struct HttpModelClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpModelClient {
    /// `base_url` should already include the port, e.g. `http://127.0.0.1:11434`.
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn get_response(&self, model: &str, inputs: &Value) -> Result<String, ModelError> {
        let body = json!({ "model": model, "messages": inputs, "stream": false });
        let url = format!("{}/chat/completions", self.base_url);
        let req = self.authed(self.client.post(&url).json(&body));

        let resp = req.send().await.map_err(|e| ModelError::Rpc(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(ModelError::Rpc(format!("{status}: {text}")));
        }

        let body: Value = resp.json().await.map_err(|e| ModelError::Rpc(e.to_string()))?;
        body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ModelError::Rpc("response carried no message content".into()))
    }

    async fn get_models(&self) -> Result<Vec<ModelInfo>, ModelError> {
        let url = format!("{}/models", self.base_url);
        let req = self.authed(self.client.get(&url));

        let resp = req.send().await.map_err(|e| ModelError::Rpc(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(ModelError::Rpc(format!("{status} listing models")));
        }

        let body: Value = resp.json().await.map_err(|e| ModelError::Rpc(e.to_string()))?;
        let entries = body["data"]
            .as_array()
            .ok_or_else(|| ModelError::Rpc("models response carried no data[]".into()))?;

        Ok(entries
            .iter()
            .filter_map(|e| e["id"].as_str())
            .map(|name| ModelInfo { name: name.to_string(), description: None })
            .collect())
    }

    /// No tokenizer ships with this client; the OpenAI-compatible wire
    /// format reports usage only after a completion runs, which would mean
    /// paying for inference just to price a quote. Approximates instead,
    /// at four characters per token — close enough for a quote, not for
    /// billing reconciliation (spec.md doesn't prescribe a tokenizer).
    async fn count_tokens(&self, _model: &str, inputs: &Value) -> Result<u64, ModelError> {
        let char_count: usize = inputs
            .as_array()
            .map(|messages| {
                messages
                    .iter()
                    .filter_map(|m| m["content"].as_str())
                    .map(str::len)
                    .sum()
            })
            .unwrap_or(0);
        Ok(((char_count as u64) / 4).max(1))
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;

    pub struct FakeModelClient {
        pub models: Vec<ModelInfo>,
        pub tokens_per_message: u64,
        pub completion: String,
    }

    impl Default for FakeModelClient {
        fn default() -> Self {
            Self {
                models: vec![ModelInfo { name: "gpt-oss:20b".into(), description: None }],
                tokens_per_message: 10,
                completion: "hello from the model".into(),
            }
        }
    }

    #[async_trait]
    impl ModelClient for FakeModelClient {
        async fn get_response(&self, model: &str, _inputs: &Value) -> Result<String, ModelError> {
            if !self.models.iter().any(|m| m.name == model) {
                return Err(ModelError::NotServed(model.to_string()));
            }
            Ok(self.completion.clone())
        }

        async fn get_models(&self) -> Result<Vec<ModelInfo>, ModelError> {
            Ok(self.models.clone())
        }

        async fn count_tokens(&self, model: &str, inputs: &Value) -> Result<u64, ModelError> {
            if !self.models.iter().any(|m| m.name == model) {
                return Err(ModelError::NotServed(model.to_string()));
            }
            let messages = inputs.as_array().map(|a| a.len() as u64).unwrap_or(1);
            Ok(messages * self.tokens_per_message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn http_client_token_count_is_proportional_to_message_length() {
        let client = HttpModelClient::new("http://127.0.0.1:11434", None);
        let short = client
            .count_tokens("gpt-oss:20b", &json!([{"role": "user", "content": "hi"}]))
            .await
            .unwrap();
        let long = client
            .count_tokens(
                "gpt-oss:20b",
                &json!([{"role": "user", "content": "a".repeat(400)}]),
            )
            .await
            .unwrap();
        assert!(long > short);
        assert_eq!(short, 1, "short messages still cost at least one token");
    }

    #[tokio::test]
    async fn http_client_token_count_of_empty_inputs_is_nonzero() {
        let client = HttpModelClient::new("http://127.0.0.1:11434", None);
        let count = client.count_tokens("gpt-oss:20b", &Value::Null).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn accumulator_dedupes_models_by_name_across_contributions() {
        let (handle, mut events) = spawn_model_accumulator(Duration::from_millis(50));
        handle.add_models(vec![ModelInfo { name: "a".into(), description: None }]);
        handle.add_models(vec![ModelInfo { name: "a".into(), description: Some("dup".into()) }]);
        handle.add_models(vec![ModelInfo { name: "b".into(), description: None }]);

        let compiled = tokio::time::timeout(Duration::from_millis(500), events.recv())
            .await
            .expect("no compiled event")
            .unwrap();
        assert_eq!(compiled.len(), 2);
    }

    #[tokio::test]
    async fn accumulator_emits_once_per_quiet_window() {
        let (handle, mut events) = spawn_model_accumulator(Duration::from_millis(30));
        handle.add_models(vec![ModelInfo { name: "a".into(), description: None }]);
        let _first = events.recv().await.unwrap();

        handle.add_models(vec![ModelInfo { name: "b".into(), description: None }]);
        let second = events.recv().await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].name, "b");
    }
}
