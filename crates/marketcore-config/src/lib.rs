// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::load;
pub use schema::*;
