// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! C7 — Message Processor, ingress (spec.md §4.7).
//!
//! One authoritative `process(envelope, sourcePeerId)` entry point called
//! from both the gossipsub adapter and the direct-stream adapter after
//! decode (spec.md §9's "two historical ingress code paths" re-architecture
//! note) — no per-transport duplication of validation or role dispatch.

use std::{collections::HashMap, sync::Arc};

use libp2p::PeerId;
use marketcore_net::{Envelope, NetHandle};
use serde_json::json;

use crate::{
    auction::{AuctionHandle, Quote, QuoteBid},
    error::ProcessError,
    ledger::LedgerClient,
    model::{ModelAccumulatorHandle, ModelClient},
    session::{SessionHandle, SessionState},
};

/// Static configuration the processor needs on every call; cheap to clone.
#[derive(Clone)]
pub struct ProcessConfig {
    pub self_wallet_addr: String,
    pub well_known_topic: String,
    pub direct_messaging_enabled: bool,
    pub fallback_to_gossipsub: bool,
    pub protocol_asset_id: u64,
    /// `models.chargePer1MTokens`, keyed by model name (spec.md §6). A model
    /// with no entry here produces no quote even if it is served.
    pub charge_per_1m_tokens: HashMap<String, f64>,
}

/// The C7 ingress pipeline. Holds no session state of its own (spec.md §3:
/// "C7 holds no session state, only collaborator references") — session
/// bookkeeping lives entirely in [`SessionHandle`].
pub struct MessageProcessor {
    net: NetHandle,
    ledger: Arc<dyn LedgerClient>,
    model: Arc<dyn ModelClient>,
    auction: AuctionHandle,
    sessions: SessionHandle,
    accumulator: ModelAccumulatorHandle,
    config: ProcessConfig,
}

impl MessageProcessor {
    /// Takes an already-spawned [`ModelAccumulatorHandle`] rather than
    /// building its own, so the caller (the request façade's `AppState`)
    /// can subscribe to the same `model-list-compiled` stream C7 feeds.
    pub fn new(
        net: NetHandle,
        ledger: Arc<dyn LedgerClient>,
        model: Arc<dyn ModelClient>,
        auction: AuctionHandle,
        sessions: SessionHandle,
        accumulator: ModelAccumulatorHandle,
        config: ProcessConfig,
    ) -> Self {
        Self { net, ledger, model, auction, sessions, accumulator, config }
    }

    /// Steps 2-5 of spec.md §4.7's pipeline. Step 1 (the addressing filter)
    /// is applied by the caller before an envelope ever reaches here.
    pub async fn process(&self, envelope: Envelope, source_peer: Option<PeerId>) -> Result<(), ProcessError> {
        if !self.ledger.is_valid_address(&envelope.from_wallet_addr) {
            return Err(ProcessError::BadSender(envelope.from_wallet_addr.clone()));
        }

        let signature = envelope.signature.as_ref().ok_or(ProcessError::Unsigned)?.clone();

        let verified = self
            .ledger
            .verify_signature(&envelope.canonical_bytes(), &envelope.from_wallet_addr, &signature)
            .await
            .map_err(ProcessError::from)?;
        if !verified {
            return Err(ProcessError::BadSignature);
        }

        match envelope.role.as_str() {
            "list-models" => self.handle_list_models(envelope, source_peer).await,
            "list-models-response" => self.handle_list_models_response(envelope),
            "quote-request" => self.handle_quote_request(envelope, source_peer).await,
            "quote-response" => self.handle_quote_response(envelope, source_peer),
            "quote-accepted" => self.handle_quote_accepted(envelope, source_peer).await,
            "contract-created" => self.handle_contract_created(envelope, source_peer).await,
            "contract-signed" => self.handle_contract_signed(envelope, source_peer).await,
            "inference-response" => self.handle_inference_response(envelope).await,
            other => Err(ProcessError::UnknownRole(other.to_string())),
        }
    }

    async fn sign(&self, envelope: Envelope) -> Result<Envelope, ProcessError> {
        let bytes = envelope.canonical_bytes();
        let signature = self.ledger.sign_object(&bytes).await.map_err(ProcessError::from)?;
        Ok(envelope.with_signature(signature))
    }

    async fn reply(&self, role: &str, envelope: Envelope, target: Option<PeerId>) -> Result<(), ProcessError> {
        self.net
            .send(
                role,
                envelope,
                target,
                self.config.direct_messaging_enabled,
                self.config.fallback_to_gossipsub,
                &self.config.well_known_topic,
            )
            .await
            .map_err(|e| ProcessError::LedgerFailed(format!("delivery: {e}")))
    }

    async fn handle_list_models(&self, envelope: Envelope, source_peer: Option<PeerId>) -> Result<(), ProcessError> {
        let models = self.model.get_models().await?;
        let payload = json!({ "models": models });
        let reply = Envelope::new("list-models-response", &self.config.self_wallet_addr, payload);
        let reply = self.sign(reply).await?;
        self.reply("list-models-response", reply, source_peer).await
    }

    fn handle_list_models_response(&self, envelope: Envelope) -> Result<(), ProcessError> {
        let models: Vec<crate::model::ModelInfo> = serde_json::from_value(
            envelope.payload.get("models").cloned().unwrap_or(serde_json::Value::Null),
        )
        .map_err(|e| ProcessError::MalformedPayload {
            role: envelope.role.clone(),
            reason: e.to_string(),
        })?;
        self.accumulator.add_models(models);
        Ok(())
    }

    async fn handle_quote_request(&self, envelope: Envelope, source_peer: Option<PeerId>) -> Result<(), ProcessError> {
        if !self.sessions.start(envelope.id.clone()).await {
            return Ok(()); // duplicate quote-request for an in-flight session: silently dropped (spec.md §4.9)
        }

        let model_name = envelope
            .payload
            .get("model")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProcessError::MalformedPayload {
                role: envelope.role.clone(),
                reason: "missing payload.model".into(),
            })?
            .to_string();
        let inputs = envelope.payload.get("inputs").cloned().unwrap_or(serde_json::Value::Null);

        let served = self.model.get_models().await?;
        if !served.iter().any(|m| m.name == model_name) {
            self.sessions.fail(envelope.id.clone(), "model not served");
            return Ok(()); // ModelNotServed: drop silently per spec.md §4.7
        }

        let opted_in = self
            .ledger
            .check_opted_in_to_asset(&envelope.from_wallet_addr, self.config.protocol_asset_id)
            .await
            .map_err(ProcessError::from)?;
        if !opted_in.opted_in {
            self.sessions.fail(envelope.id.clone(), "not opted in to protocol asset");
            return Ok(()); // NotOptedIn: logged by the caller, no reply
        }

        let token_count = self.model.count_tokens(&model_name, &inputs).await?;
        let input_count = inputs.as_array().map(|a| a.len() as u64).unwrap_or(1);
        let Some(quote) = self.create_quote(&model_name, input_count, token_count) else {
            self.sessions.fail(envelope.id.clone(), "no quote produced");
            return Ok(()); // NoQuoteProduced: business rejection, logged, no reply (spec.md §7)
        };

        let payload = json!({ "model": model_name, "inputs": inputs, "quote": quote });
        let reply = Envelope::new("quote-response", &self.config.self_wallet_addr, payload).with_id(envelope.id.clone());
        let reply = self.sign(reply).await?;
        self.sessions.advance(envelope.id.clone(), SessionState::Quoted);
        self.reply("quote-response", reply, source_peer).await
    }

    /// The configured pricing pipeline (spec.md §9: "an ordered list of
    /// `RawQuote?`-returning closures; evaluate in order; return the first
    /// non-null"). Only the `flat-rate` strategy is currently registered;
    /// additional strategies plug in here by name without touching C7's
    /// dispatch logic.
    fn create_quote(&self, model: &str, input_count: u64, token_count: u64) -> Option<Quote> {
        let price_per_million = *self.config.charge_per_1m_tokens.get(model)?;
        let total_price = ((token_count as f64 / 1_000_000.0) * price_per_million * 1e6).round() / 1e6;
        Some(Quote {
            model: model.to_string(),
            input_count,
            token_count,
            price_per_million,
            total_price,
            addr: self.config.self_wallet_addr.clone(),
        })
    }

    fn handle_quote_response(&self, envelope: Envelope, source_peer: Option<PeerId>) -> Result<(), ProcessError> {
        let Some(source_peer) = source_peer else {
            return Err(ProcessError::MalformedPayload {
                role: envelope.role.clone(),
                reason: "quote-response without a source peer".into(),
            });
        };
        let quote: Quote = serde_json::from_value(
            envelope.payload.get("quote").cloned().unwrap_or(serde_json::Value::Null),
        )
        .map_err(|e| ProcessError::MalformedPayload {
            role: envelope.role.clone(),
            reason: e.to_string(),
        })?;
        self.sessions.advance(envelope.id.to_string(), SessionState::Quoted);
        self.auction.add_bid(envelope.id.to_string(), QuoteBid { from_peer: source_peer, quote });
        Ok(())
    }

    async fn handle_quote_accepted(&self, envelope: Envelope, source_peer: Option<PeerId>) -> Result<(), ProcessError> {
        let quote: Quote = serde_json::from_value(
            envelope.payload.get("quote").cloned().unwrap_or(serde_json::Value::Null),
        )
        .map_err(|e| ProcessError::MalformedPayload {
            role: envelope.role.clone(),
            reason: e.to_string(),
        })?;
        self.sessions.advance(envelope.id.clone(), SessionState::Accepted);
        let usdc_base_units = (quote.total_price * 1_000_000.0).round() as u64;
        self.ledger
            .create_quote(&envelope.id.to_string(), &envelope.from_wallet_addr, usdc_base_units)
            .await
            .map_err(ProcessError::from)?;

        let reply = Envelope::new("contract-created", &self.config.self_wallet_addr, envelope.payload.clone())
            .with_id(envelope.id.clone())
            .addressed_to(envelope.from_wallet_addr.clone());
        let reply = self.sign(reply).await?;
        self.sessions.advance(envelope.id.clone(), SessionState::ContractCreated);
        self.reply("contract-created", reply, source_peer).await
    }

    async fn handle_contract_created(&self, envelope: Envelope, source_peer: Option<PeerId>) -> Result<(), ProcessError> {
        let quote: Quote = serde_json::from_value(
            envelope.payload.get("quote").cloned().unwrap_or(serde_json::Value::Null),
        )
        .map_err(|e| ProcessError::MalformedPayload {
            role: envelope.role.clone(),
            reason: e.to_string(),
        })?;
        self.sessions.advance(envelope.id.clone(), SessionState::ContractCreated);
        let usdc_base_units = (quote.total_price * 1_000_000.0).round() as u64;
        self.ledger
            .fund_quote(&envelope.id.to_string(), usdc_base_units)
            .await
            .map_err(ProcessError::from)?;

        let reply = Envelope::new("contract-signed", &self.config.self_wallet_addr, envelope.payload.clone())
            .with_id(envelope.id.clone())
            .addressed_to(envelope.from_wallet_addr.clone());
        let reply = self.sign(reply).await?;
        self.sessions.advance(envelope.id.clone(), SessionState::ContractSigned);
        self.reply("contract-signed", reply, source_peer).await
    }

    async fn handle_contract_signed(&self, envelope: Envelope, source_peer: Option<PeerId>) -> Result<(), ProcessError> {
        let session_id = envelope.id.to_string();
        let quote: Quote = serde_json::from_value(
            envelope.payload.get("quote").cloned().unwrap_or(serde_json::Value::Null),
        )
        .map_err(|e| ProcessError::MalformedPayload {
            role: envelope.role.clone(),
            reason: e.to_string(),
        })?;

        self.sessions.advance(session_id.clone(), SessionState::ContractSigned);

        let funded = self
            .ledger
            .verify_quote_funded(&session_id)
            .await
            .map_err(ProcessError::from)?;
        let quoted_base_units = (quote.total_price * 1_000_000.0).round() as u64;
        if !funded.funded || funded.usdc_base_units < quoted_base_units {
            self.sessions.fail(session_id, "underfunded");
            return Err(ProcessError::Underfunded);
        }

        let inputs = envelope
            .payload
            .get("inputs")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let completion = self.model.get_response(&quote.model, &inputs).await?;

        let mut payload = envelope.payload.clone();
        if let serde_json::Value::Object(ref mut map) = payload {
            map.insert("completion".to_string(), json!(completion));
        }

        let reply = Envelope::new("inference-response", &self.config.self_wallet_addr, payload)
            .with_id(envelope.id.clone())
            .addressed_to(envelope.from_wallet_addr.clone());
        let reply = self.sign(reply).await?;
        self.sessions.advance(session_id, SessionState::Inferred);
        self.reply("inference-response", reply, source_peer).await
    }

    async fn handle_inference_response(&self, envelope: Envelope) -> Result<(), ProcessError> {
        let completion = envelope
            .payload
            .get("completion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProcessError::MalformedPayload {
                role: envelope.role.clone(),
                reason: "missing payload.completion".into(),
            })?
            .to_string();

        self.ledger
            .complete_quote(&envelope.id.to_string(), &envelope.from_wallet_addr)
            .await
            .map_err(ProcessError::from)?;

        self.sessions.advance(envelope.id.to_string(), SessionState::Inferred);
        self.sessions.complete(envelope.id.to_string(), completion);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        ledger::fake::FakeLedger,
        model::{fake::FakeModelClient, spawn_model_accumulator},
        session::spawn_session_hub,
    };
    use libp2p::identity::Keypair;
    use marketcore_net::Node;

    async fn test_net_handle() -> NetHandle {
        let key = Keypair::generate_ed25519();
        let resolver = Arc::new(marketcore_net::PassthroughResolver);
        let config = marketcore_net::NetConfig::default();
        let (handle, _join) = Node::new(config, key, resolver).spawn().await.unwrap();
        handle
    }

    fn cfg() -> ProcessConfig {
        ProcessConfig {
            self_wallet_addr: "SELFADDR".into(),
            well_known_topic: "diiisco/models/1.0.0".into(),
            direct_messaging_enabled: true,
            fallback_to_gossipsub: true,
            protocol_asset_id: 1,
            charge_per_1m_tokens: [("gpt-oss:20b".to_string(), 2.0)].into_iter().collect(),
        }
    }

    fn signed_envelope(role: &str, from: &str, payload: serde_json::Value) -> Envelope {
        let env = Envelope::new(role, from, payload);
        let sig = hex::encode(env.canonical_bytes());
        env.with_signature(sig)
    }

    #[tokio::test]
    async fn unsigned_envelope_is_rejected() {
        let net = test_net_handle().await;
        let ledger: Arc<dyn LedgerClient> = Arc::new(FakeLedger::default());
        let model: Arc<dyn ModelClient> = Arc::new(FakeModelClient::default());
        let auction = crate::auction::spawn_auction_engine(Duration::from_millis(50), marketcore_config::SelectionPolicy::Cheapest, ledger.clone(), 1);
        let sessions = spawn_session_hub();
        let (accumulator, _compiled) = spawn_model_accumulator(Duration::from_millis(50));
        let processor = MessageProcessor::new(net, ledger, model, auction, sessions, accumulator, cfg());

        let env = Envelope::new("list-models", "SOMEADDR", serde_json::json!({}));
        let result = processor.process(env, None).await;
        assert!(matches!(result, Err(ProcessError::Unsigned)));
    }

    #[tokio::test]
    async fn tampered_signature_is_rejected() {
        let net = test_net_handle().await;
        let ledger: Arc<dyn LedgerClient> = Arc::new(FakeLedger::default());
        let model: Arc<dyn ModelClient> = Arc::new(FakeModelClient::default());
        let auction = crate::auction::spawn_auction_engine(Duration::from_millis(50), marketcore_config::SelectionPolicy::Cheapest, ledger.clone(), 1);
        let sessions = spawn_session_hub();
        let (accumulator, _compiled) = spawn_model_accumulator(Duration::from_millis(50));
        let processor = MessageProcessor::new(net, ledger, model, auction, sessions, accumulator, cfg());

        let env = signed_envelope("list-models", "SOMEADDR", serde_json::json!({})).with_signature("tampered");
        let result = processor.process(env, None).await;
        assert!(matches!(result, Err(ProcessError::BadSignature)));
    }

    #[tokio::test]
    async fn quote_request_for_unserved_model_is_silently_dropped() {
        let net = test_net_handle().await;
        let ledger: Arc<dyn LedgerClient> = Arc::new(FakeLedger::default());
        let model: Arc<dyn ModelClient> = Arc::new(FakeModelClient::default());
        let auction = crate::auction::spawn_auction_engine(Duration::from_millis(50), marketcore_config::SelectionPolicy::Cheapest, ledger.clone(), 1);
        let sessions = spawn_session_hub();
        let (accumulator, _compiled) = spawn_model_accumulator(Duration::from_millis(50));
        let processor = MessageProcessor::new(net, ledger, model, auction, sessions, accumulator, cfg());

        let env = signed_envelope(
            "quote-request",
            "CUSTOMERADDR",
            serde_json::json!({ "model": "not-a-real-model", "inputs": [] }),
        );
        assert!(processor.process(env, None).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_role_is_rejected() {
        let net = test_net_handle().await;
        let ledger: Arc<dyn LedgerClient> = Arc::new(FakeLedger::default());
        let model: Arc<dyn ModelClient> = Arc::new(FakeModelClient::default());
        let auction = crate::auction::spawn_auction_engine(Duration::from_millis(50), marketcore_config::SelectionPolicy::Cheapest, ledger.clone(), 1);
        let sessions = spawn_session_hub();
        let (accumulator, _compiled) = spawn_model_accumulator(Duration::from_millis(50));
        let processor = MessageProcessor::new(net, ledger, model, auction, sessions, accumulator, cfg());

        let env = signed_envelope("not-a-role", "CUSTOMERADDR", serde_json::json!({}));
        let result = processor.process(env, None).await;
        assert!(matches!(result, Err(ProcessError::UnknownRole(_))));
    }

    #[tokio::test]
    async fn inference_response_completes_the_session() {
        let net = test_net_handle().await;
        let ledger: Arc<dyn LedgerClient> = Arc::new(FakeLedger::default());
        let model: Arc<dyn ModelClient> = Arc::new(FakeModelClient::default());
        let auction = crate::auction::spawn_auction_engine(Duration::from_millis(50), marketcore_config::SelectionPolicy::Cheapest, ledger.clone(), 1);
        let sessions = spawn_session_hub();
        let mut session_events = sessions.subscribe();
        let (accumulator, _compiled) = spawn_model_accumulator(Duration::from_millis(50));
        let processor = MessageProcessor::new(net, ledger, model, auction, sessions.clone(), accumulator, cfg());

        sessions.start("s1").await;
        let env = Envelope::new("inference-response", "PROVIDERADDR", serde_json::json!({ "completion": "42" }))
            .with_id("s1");
        let sig = hex::encode(env.canonical_bytes());
        let env = env.with_signature(sig);

        processor.process(env.clone(), None).await.unwrap();

        let ev = tokio::time::timeout(Duration::from_millis(200), session_events.recv())
            .await
            .unwrap()
            .unwrap();
        match ev {
            crate::session::SessionEvent::Completed { completion, .. } => assert_eq!(completion, "42"),
            other => panic!("expected Completed, got {other:?}"),
        }
    }
}
