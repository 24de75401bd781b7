// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Message-content rejections produced by C7's ingress pipeline (spec.md
/// §4.7/§7) and session/auction-level business failures. Transport-layer
/// failures (`Unreachable`, `Timeout`, `OversizeFrame`, ...) live in
/// `marketcore_net::NetError` instead — this crate never touches a swarm.
#[derive(Debug, Error, Clone)]
pub enum ProcessError {
    #[error("fromWalletAddr {0} is not a well-formed ledger address")]
    BadSender(String),

    #[error("envelope carries no signature")]
    Unsigned,

    #[error("signature verification failed")]
    BadSignature,

    #[error("unknown role: {0}")]
    UnknownRole(String),

    #[error("message addressed to a different peer")]
    MessageNotAddressedHere,

    #[error("requester is not opted in to the protocol asset")]
    NotOptedIn,

    #[error("no quote could be produced by the configured pricing pipeline")]
    NoQuoteProduced,

    #[error("model {0} is not served locally")]
    ModelNotServed(String),

    #[error("contract funded for less than the quoted total")]
    Underfunded,

    #[error("model inference failed: {0}")]
    InferenceFailed(String),

    #[error("ledger call failed: {0}")]
    LedgerFailed(String),

    #[error("malformed payload for role {role}: {reason}")]
    MalformedPayload { role: String, reason: String },
}

/// Failures talking to the Ledger collaborator (spec.md §6).
#[derive(Debug, Error, Clone)]
pub enum LedgerError {
    #[error("ledger RPC failed: {0}")]
    Rpc(String),

    #[error("address {0} is not a well-formed ledger address")]
    BadAddress(String),

    #[error("bootstrap alias did not resolve: {0}")]
    UnknownAlias(String),
}

/// Failures talking to the Model collaborator (spec.md §6).
#[derive(Debug, Error, Clone)]
pub enum ModelError {
    #[error("model {0} is not served locally")]
    NotServed(String),

    #[error("inference RPC failed: {0}")]
    Rpc(String),
}

impl From<LedgerError> for ProcessError {
    fn from(e: LedgerError) -> Self {
        ProcessError::LedgerFailed(e.to_string())
    }
}

impl From<ModelError> for ProcessError {
    fn from(e: ModelError) -> Self {
        ProcessError::InferenceFailed(e.to_string())
    }
}
