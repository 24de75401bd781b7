// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// Root configuration record (spec.md §6's enumerated keys, one struct per
/// top-level section). Every substruct carries `#[serde(deny_unknown_fields)]`
/// per spec.md §9's "unknown keys rejected at load" design note — a typo'd
/// key is a `ConfigError` at start-up, never silently ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub node: NodeConfig,
    pub relay: RelayConfig,
    #[serde(rename = "directMessaging")]
    pub direct_messaging: DirectMessagingConfig,
    #[serde(rename = "quoteEngine")]
    pub quote_engine: QuoteEngineConfig,
    pub models: ModelsConfig,
    pub algorand: AlgorandConfig,
    pub api: ApiConfig,
}

/// `node.port`, `node.url` — listen port and advertised host; `libp2pBootstrapServers[]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NodeConfig {
    pub port: u16,
    pub url: String,
    #[serde(rename = "libp2pBootstrapServers")]
    pub libp2p_bootstrap_servers: Vec<String>,
    /// Path to the persisted identity file (protobuf-encoded key-pair).
    pub identity_path: String,
    pub min_connections: usize,
    pub max_connections: usize,
    pub inbound_connection_threshold: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: 0,
            url: "0.0.0.0".into(),
            libp2p_bootstrap_servers: Vec::new(),
            identity_path: "identity.key".into(),
            min_connections: 2,
            max_connections: 100,
            inbound_connection_threshold: 100,
        }
    }
}

/// `relay.enableRelayServer`/`.enableRelayClient`/`.enableDCUtR` and the
/// relay-server resource caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RelayConfig {
    #[serde(rename = "enableRelayServer")]
    pub enable_relay_server: bool,
    #[serde(rename = "enableRelayClient")]
    pub enable_relay_client: bool,
    #[serde(rename = "enableDCUtR")]
    pub enable_dcutr: bool,
    #[serde(rename = "maxRelayedConnections")]
    pub max_relayed_connections: usize,
    #[serde(rename = "maxDataPerConnection")]
    pub max_data_per_connection: u64,
    /// Relay reservation/circuit duration cap, in seconds.
    #[serde(rename = "maxRelayDuration")]
    pub max_relay_duration_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enable_relay_server: true,
            enable_relay_client: true,
            enable_dcutr: true,
            max_relayed_connections: 32,
            max_data_per_connection: 16 * 1024 * 1024,
            max_relay_duration_secs: 2 * 60 * 60,
        }
    }
}

/// `directMessaging.*` (C5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DirectMessagingConfig {
    pub enabled: bool,
    /// Per-stream abort timeout, in milliseconds.
    pub timeout: u64,
    #[serde(rename = "fallbackToGossipsub")]
    pub fallback_to_gossipsub: bool,
    pub protocol: String,
    #[serde(rename = "maxMessageSize")]
    pub max_message_size: usize,
}

impl Default for DirectMessagingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: 10_000,
            fallback_to_gossipsub: true,
            protocol: "/diiisco/direct/1.0.0".into(),
            max_message_size: 10 * 1024 * 1024,
        }
    }
}

/// `quoteEngine.waitTime`, `.quoteSelectionFunction`, `.quoteCreationFunction[]` (C8).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct QuoteEngineConfig {
    /// Auction window, in milliseconds.
    #[serde(rename = "waitTime")]
    pub wait_time_ms: u64,
    #[serde(rename = "quoteSelectionFunction")]
    pub quote_selection_function: SelectionPolicy,
    /// Ordered pricing pipeline; first entry producing a non-null `RawQuote`
    /// wins (spec.md §9's "polymorphic pricing via an array of creation
    /// functions" re-architecture note).
    #[serde(rename = "quoteCreationFunction")]
    pub quote_creation_function: Vec<String>,
    pub well_known_topic: String,
}

impl Default for QuoteEngineConfig {
    fn default() -> Self {
        Self {
            wait_time_ms: 5_000,
            quote_selection_function: SelectionPolicy::Cheapest,
            quote_creation_function: vec!["flat-rate".into()],
            well_known_topic: "diiisco/models/1.0.0".into(),
        }
    }
}

/// `quoteEngine.quoteSelectionFunction` policy tag (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicy {
    Cheapest,
    First,
    Random,
    #[serde(rename = "highest-stake")]
    HighestStake,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        SelectionPolicy::Cheapest
    }
}

/// `models.enabled`, `.baseURL`, `.port`, `.apiKey`, `.chargePer1MTokens` —
/// the local OpenAI-compatible inference endpoint and its per-model rate card.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ModelsConfig {
    pub enabled: bool,
    #[serde(rename = "baseURL")]
    pub base_url: String,
    pub port: u16,
    /// Prefer `MARKETCORE_API_KEY` at runtime; this field exists so tests and
    /// local setups can set it directly without an environment variable.
    #[serde(rename = "apiKey")]
    pub api_key: Option<String>,
    /// Rate per million tokens, keyed by model name.
    #[serde(rename = "chargePer1MTokens")]
    pub charge_per_1m_tokens: HashMap<String, f64>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://127.0.0.1".into(),
            port: 11434,
            api_key: None,
            charge_per_1m_tokens: HashMap::new(),
        }
    }
}

/// `algorand.addr`, `.mnemonic`, `.network`, `.assetId`, `.client.*` —
/// ledger identity, endpoint, and the protocol asset `checkIfOptedInToAsset`/
/// `optInToAsset` (spec.md §6) and the `highest-stake` selection policy
/// (spec.md §4.8) consult. `mnemonic` should come from `ALGORAND_MNEMONIC`
/// at runtime rather than sitting in a YAML file on disk; the field exists
/// for tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AlgorandConfig {
    pub addr: String,
    pub mnemonic: Option<String>,
    pub network: String,
    #[serde(rename = "assetId")]
    pub asset_id: u64,
    pub client: AlgorandClientConfig,
}

impl Default for AlgorandConfig {
    fn default() -> Self {
        Self {
            addr: String::new(),
            mnemonic: None,
            network: "testnet".into(),
            asset_id: 0,
            client: AlgorandClientConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AlgorandClientConfig {
    pub url: String,
    pub port: u16,
    pub token: Option<String>,
}

impl Default for AlgorandClientConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1".into(),
            port: 4001,
            token: None,
        }
    }
}

/// `api.enabled`, `.port`, `.bearerAuthentication`, `.keys[]` — the HTTP façade (C10).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
    #[serde(rename = "bearerAuthentication")]
    pub bearer_authentication: bool,
    #[serde(default = "default_true")]
    pub rate_limit_enabled: bool,
    /// Pre-shared bearer keys the façade accepts on `/v1/*` and `/peers`
    /// when `bearerAuthentication` is set; mint new ones with
    /// `marketcored token regenerate` and paste them in here directly.
    pub keys: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
            bearer_authentication: true,
            rate_limit_enabled: true,
            keys: Vec::new(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_default_node_port_is_ephemeral() {
        assert_eq!(Config::default().node.port, 0);
    }

    #[test]
    fn config_default_direct_messaging_enabled() {
        let c = Config::default();
        assert!(c.direct_messaging.enabled);
        assert!(c.direct_messaging.fallback_to_gossipsub);
    }

    #[test]
    fn config_default_quote_engine_selection_is_cheapest() {
        let c = Config::default();
        assert_eq!(c.quote_engine.quote_selection_function, SelectionPolicy::Cheapest);
    }

    #[test]
    fn config_default_quote_creation_pipeline_is_nonempty() {
        let c = Config::default();
        assert!(!c.quote_engine.quote_creation_function.is_empty());
    }

    #[test]
    fn config_default_relay_server_and_client_enabled() {
        let c = Config::default();
        assert!(c.relay.enable_relay_server);
        assert!(c.relay.enable_relay_client);
        assert!(c.relay.enable_dcutr);
    }

    #[test]
    fn config_default_api_bearer_auth_enabled_with_no_keys() {
        let c = Config::default();
        assert!(c.api.bearer_authentication);
        assert!(c.api.keys.is_empty());
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        let yaml = "nodee:\n  port: 1234\n";
        let result: Result<Config, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err(), "unrecognized top-level key must fail to parse");
    }

    #[test]
    fn unknown_nested_key_is_rejected() {
        let yaml = "node:\n  port: 1234\n  bogus_field: true\n";
        let result: Result<Config, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err(), "unrecognized nested key must fail to parse");
    }

    #[test]
    fn partial_yaml_fills_in_section_defaults() {
        let yaml = "node:\n  port: 4001\n";
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(c.node.port, 4001);
        assert_eq!(c.relay.max_relayed_connections, RelayConfig::default().max_relayed_connections);
    }

    #[test]
    fn quote_selection_function_parses_kebab_case() {
        let yaml = "quoteEngine:\n  quoteSelectionFunction: highest-stake\n";
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(c.quote_engine.quote_selection_function, SelectionPolicy::HighestStake);
    }

    #[test]
    fn models_charge_per_1m_tokens_round_trips() {
        let yaml = "models:\n  chargePer1MTokens:\n    gpt-oss:20b: 2.5\n";
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(c.models.charge_per_1m_tokens.get("gpt-oss:20b"), Some(&2.5));
        let back = serde_yaml::to_string(&c).unwrap();
        let reparsed: Config = serde_yaml::from_str(&back).unwrap();
        assert_eq!(reparsed.models.charge_per_1m_tokens.get("gpt-oss:20b"), Some(&2.5));
    }

    #[test]
    fn config_serialises_to_valid_yaml() {
        let c = Config::default();
        let yaml = serde_yaml::to_string(&c).unwrap();
        assert!(yaml.contains("node"));
        assert!(yaml.contains("quoteEngine"));
    }
}
