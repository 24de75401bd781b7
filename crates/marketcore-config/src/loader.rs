// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{Config, ConfigError};

/// Ordered list of config file locations searched from lowest to highest priority.
/// Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/marketcore/config.yaml"));
    paths.push(PathBuf::from("/etc/marketcore/config.yml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/marketcore/config.yaml"));
        paths.push(home.join(".config/marketcore/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("marketcore/config.yaml"));
        paths.push(cfg.join("marketcore/config.yml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".marketcore/config.yaml"));
    paths.push(PathBuf::from(".marketcore/config.yml"));
    paths.push(PathBuf::from("marketcore.yaml"));
    paths.push(PathBuf::from("marketcore.yml"));

    paths
}

fn read_yaml_layer(path: &Path) -> Result<serde_yaml::Value, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load configuration by merging all discovered YAML files, lowest to highest
/// priority, then an optional explicit override (the `--config` CLI flag).
/// Secrets (`ALGORAND_MNEMONIC`, `MARKETCORE_API_KEY`) never come from these
/// files — they're layered on top by the binary via `clap`'s `env` attribute.
pub fn load(extra: Option<&Path>) -> Result<Config, ConfigError> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            merge_yaml(&mut merged, read_yaml_layer(&path)?);
        }
    }

    if let Some(p) = extra {
        if !p.is_file() {
            return Err(ConfigError::MissingConfig(p.to_path_buf()));
        }
        debug!(path = %p.display(), "loading explicit config");
        merge_yaml(&mut merged, read_yaml_layer(p)?);
    }

    if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        return Ok(Config::default());
    }
    serde_yaml::from_value(merged).map_err(ConfigError::Invalid)
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn val(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn merge_scalar_src_wins() {
        let mut dst = val("x: 1");
        let src = val("x: 2");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["x"].as_i64(), Some(2));
    }

    #[test]
    fn merge_preserves_keys_not_in_src() {
        let mut dst = val("a: 1\nb: 2");
        let src = val("b: 99");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["a"].as_i64(), Some(1));
        assert_eq!(dst["b"].as_i64(), Some(99));
    }

    #[test]
    fn merge_nested_tables() {
        let mut dst = val("node:\n  port: 4001\n  url: host-a");
        let src = val("node:\n  url: host-b");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["node"]["port"].as_i64(), Some(4001));
        assert_eq!(dst["node"]["url"].as_str(), Some("host-b"));
    }

    #[test]
    fn load_returns_error_when_explicit_path_missing() {
        let result = load(Some(Path::new("/tmp/marketcore_nonexistent_config_xyz.yaml")));
        assert!(matches!(result, Err(ConfigError::MissingConfig(_))));
    }

    #[test]
    fn load_with_no_files_returns_defaults() {
        // Assumes no marketcore config files exist on the test runner.
        let cfg = load(None).unwrap();
        assert_eq!(cfg.node.port, Config::default().node.port);
    }

    #[test]
    fn load_explicit_file_overrides_defaults() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "node:\n  port: 4001\n  url: 10.0.0.5").unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.node.port, 4001);
        assert_eq!(cfg.node.url, "10.0.0.5");
    }

    #[test]
    fn load_explicit_file_with_unknown_key_is_invalid() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "node:\n  bogus: true").unwrap();
        let result = load(Some(f.path()));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
