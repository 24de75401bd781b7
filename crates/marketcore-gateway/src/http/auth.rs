// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! HTTP bearer-token allowlist and per-IP rate limiting (spec.md §4.10).
//!
//! # Token authentication
//!
//! When `api.bearerAuthentication` is enabled, `/v1/*` and `/peers` require:
//! ```text
//! Authorization: Bearer <token>
//! ```
//! where `<token>` is one of the plain strings in `api.keys`. `/health`
//! never requires a token.
//!
//! # Rate limiting
//!
//! Uses the `governor` crate (GCRA algorithm) for per-IP rate limiting of
//! failed attempts when `api.rateLimitEnabled` is set. Loopback addresses are
//! exempt — a local process that can reach loopback already has local access
//! to the machine.

use std::{
    collections::HashSet,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    num::NonZeroU32,
    sync::Arc,
};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{clock::DefaultClock, state::keyed::DashMapStateStore, Quota, RateLimiter};
use subtle::ConstantTimeEq;
use tracing::warn;

type IpLimiter = RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock>;

/// Shared auth state threaded through axum middleware.
#[derive(Clone)]
pub struct AuthState {
    keys: Arc<HashSet<String>>,
    limiter: Option<Arc<IpLimiter>>,
}

impl AuthState {
    /// `keys` is `api.keys` verbatim. `rate_limit_enabled` mirrors
    /// `api.rateLimitEnabled`; when `false` failed attempts are never
    /// throttled (only rejected).
    pub fn new(keys: Vec<String>, rate_limit_enabled: bool) -> Self {
        let limiter = rate_limit_enabled.then(|| {
            let quota = Quota::per_minute(NonZeroU32::new(5).unwrap()).allow_burst(NonZeroU32::new(2).unwrap());
            Arc::new(RateLimiter::keyed(quota))
        });
        Self { keys: Arc::new(keys.into_iter().collect()), limiter }
    }

    /// Constant-time against the bearer token's content — membership in
    /// `keys` (a small, low-cardinality set) is not itself secret, but a
    /// plain `HashSet::contains` short-circuits per-byte on the first
    /// mismatch, leaking timing information about how close a guess got.
    fn accepts(&self, token: &str) -> bool {
        let token = token.as_bytes();
        self.keys
            .iter()
            .fold(subtle::Choice::from(0u8), |acc, key| acc | key.as_bytes().ct_eq(token))
            .into()
    }
}

// ── Middleware ────────────────────────────────────────────────────────────────

/// Axum middleware that verifies the bearer token against `api.keys`.
pub async fn bearer_auth_mw<S>(
    State(state): State<S>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response
where
    S: AsAuthState + Clone + Send + Sync + 'static,
{
    let auth = state.auth_state();
    verify_bearer(auth, addr.ip(), req, next).await
}

/// Trait for app-state types that carry auth info.
pub trait AsAuthState {
    fn auth_state(&self) -> &AuthState;
}

impl AsAuthState for AuthState {
    fn auth_state(&self) -> &AuthState {
        self
    }
}

/// Standalone bearer verification logic.
///
/// Rate limiting applies only to failed attempts — legitimate clients are
/// never throttled by their own traffic.
pub async fn verify_bearer(auth: &AuthState, ip: IpAddr, req: Request, next: Next) -> Response {
    match extract_bearer(req.headers()) {
        Some(token) if auth.accepts(token) => next.run(req).await,
        _ => {
            if !is_loopback(ip) {
                if let Some(limiter) = &auth.limiter {
                    if limiter.check_key(&ip).is_err() {
                        warn!(%ip, "rate limit exceeded after repeated auth failures");
                        return (
                            StatusCode::TOO_MANY_REQUESTS,
                            [(axum::http::header::RETRY_AFTER, "60")],
                            "Too Many Requests",
                        )
                            .into_response();
                    }
                }
            }
            warn!(%ip, "authentication failed");
            (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let auth = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    auth.strip_prefix("Bearer ")
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4 == Ipv4Addr::LOCALHOST,
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_bearer_from_valid_header() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer my-token-123".parse().unwrap());
        assert_eq!(extract_bearer(&headers), Some("my-token-123"));
    }

    #[test]
    fn extract_bearer_missing_header() {
        let headers = HeaderMap::new();
        assert!(extract_bearer(&headers).is_none());
    }

    #[test]
    fn extract_bearer_wrong_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Basic dXNlcjpwYXNz".parse().unwrap());
        assert!(extract_bearer(&headers).is_none());
    }

    #[test]
    fn loopback_v4_is_loopback() {
        assert!(is_loopback(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }

    #[test]
    fn loopback_v6_is_loopback() {
        assert!(is_loopback(IpAddr::V6(std::net::Ipv6Addr::LOCALHOST)));
    }

    #[test]
    fn non_loopback_is_not_loopback() {
        assert!(!is_loopback("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn configured_key_is_accepted() {
        let auth = AuthState::new(vec!["secret-1".into()], false);
        assert!(auth.accepts("secret-1"));
    }

    #[test]
    fn unknown_key_is_rejected() {
        let auth = AuthState::new(vec!["secret-1".into()], false);
        assert!(!auth.accepts("secret-2"));
    }
}
