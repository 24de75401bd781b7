// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Façade startup — assembles the HTTP router over an already-running
//! mesh node and serves it.
//!
//! # Startup sequence
//!
//! [`run`] performs these steps in order, then blocks on the HTTP server:
//!
//! 1. Build [`AppState`] from the caller's already-spawned `NetHandle`,
//!    ledger/session/auction handles, and the compiled-model broadcast.
//! 2. If `api.bearerAuthentication` is set, wrap `/v1/*` and `/peers` in the
//!    bearer-token allowlist middleware; `/health` is always open.
//! 3. Apply the security-headers and CSRF-guard middleware to every route.
//! 4. Serve on `api.port` (blocks until shutdown).

use std::net::SocketAddr;

use axum::{middleware, Router};
use marketcore_config::ApiConfig;
use tracing::info;

use crate::{
    http::{auth::bearer_auth_mw, routes, security},
    AppState, AuthState,
};

/// Starts the façade. Runs until the server task is aborted by the caller.
pub async fn run(config: &ApiConfig, state: AppState) -> anyhow::Result<()> {
    let mut protected = routes::protected_router(state.clone());
    if config.bearer_authentication {
        let auth_state = AuthState::new(config.keys.clone(), config.rate_limit_enabled);
        protected = protected.layer(middleware::from_fn_with_state(auth_state, bearer_auth_mw));
    }

    let router = Router::new()
        .merge(routes::public_router(state))
        .merge(protected)
        .layer(middleware::from_fn(security::security_headers))
        .layer(middleware::from_fn(security::csrf_guard));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, bearer_authentication = config.bearer_authentication, "starting request façade");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}

/// Mints a new high-entropy bearer key for the operator to add to
/// `api.keys`. Called by `marketcored token regenerate`.
pub fn regenerate_token() -> String {
    crate::crypto::token::RawToken::generate().as_str().to_string()
}
