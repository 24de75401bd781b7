// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The marketplace core: C7's message processor and the C8/C9/C11
//! collaborators it drives (spec.md §4.7-§4.9, §6). Transport (C2-C5) lives
//! in `marketcore-net`; this crate owns what happens once a validated
//! envelope reaches the local node.

pub mod auction;
pub mod error;
pub mod ledger;
pub mod model;
pub mod process;
pub mod session;

pub use auction::{spawn_auction_engine, AuctionHandle, Quote, QuoteBid, QuoteSelected};
pub use error::{LedgerError, ModelError, ProcessError};
pub use ledger::{Confirmation, FundedStatus, LedgerBootstrapResolver, LedgerClient, NullLedger, OptInStatus};
pub use model::{spawn_model_accumulator, HttpModelClient, ModelAccumulatorHandle, ModelClient, ModelInfo};
pub use process::{MessageProcessor, ProcessConfig};
pub use session::{spawn_session_hub, SessionEvent, SessionHandle, SessionInfo, SessionState};
