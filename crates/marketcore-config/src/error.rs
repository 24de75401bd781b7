// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced while locating, reading, or parsing configuration.
/// Every variant is fatal at start-up; callers wrap this in `anyhow::Context`
/// to attach the stage ("loading config", "starting node", ...) at the call site.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("explicit config path {0} does not exist")]
    MissingConfig(PathBuf),

    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("merged configuration failed validation: {0}")]
    Invalid(#[source] serde_yaml::Error),
}
