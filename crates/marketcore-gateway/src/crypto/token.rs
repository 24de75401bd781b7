// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Bearer token generation for `api.keys` (spec.md §4.10).
//!
//! Unlike a rotating single admin secret, the façade's bearer allowlist is a
//! plain list of pre-shared keys the operator pastes into
//! `api.keys` in the node's YAML config — there is nothing to hash or persist
//! here, only a convenient way to mint a new high-entropy key to add to that
//! list.

use rand::rngs::OsRng;
use rand::RngCore;

/// A freshly generated, high-entropy bearer key suitable for `api.keys`.
#[derive(Debug)]
pub struct RawToken(String);

impl RawToken {
    /// Generates a cryptographically random 256-bit key, base64url-encoded
    /// (43 characters, no padding).
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        RawToken(base64url_encode(&bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RawToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn base64url_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_token_is_43_chars() {
        let t = RawToken::generate();
        assert_eq!(t.as_str().len(), 43);
    }

    #[test]
    fn two_generated_tokens_are_different() {
        assert_ne!(RawToken::generate().as_str(), RawToken::generate().as_str());
    }
}
