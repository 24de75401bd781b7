//! Bootstrap-address resolution (spec.md §4.2/§6).
//!
//! The bootstrap list may contain literal multiaddrs or aliases that need
//! resolving through the Ledger collaborator (e.g. an ENS-style name). This
//! crate has no Ledger access, so it only validates literal multiaddrs
//! against the one pattern spec.md §6 guarantees
//! (`/(dns4|ip4)/host/tcp/port/p2p/id`) and exposes a trait the binary wires
//! up to `marketcore_market::ledger::LedgerClient` for everything else.

use async_trait::async_trait;
use libp2p::{multiaddr::Protocol, Multiaddr};

use crate::error::NetError;

/// Resolves a bootstrap-list entry (literal multiaddr or alias) to one or
/// more dialable multiaddrs.
#[async_trait]
pub trait BootstrapResolver: Send + Sync {
    async fn resolve(&self, entry: &str) -> Result<Vec<Multiaddr>, NetError>;
}

/// Accepts only entries that already parse as a multiaddr matching
/// `/(dns4|ip4)/host/tcp/port/p2p/id`; rejects anything alias-shaped. Used
/// when no Ledger collaborator is configured (e.g. in tests).
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughResolver;

#[async_trait]
impl BootstrapResolver for PassthroughResolver {
    async fn resolve(&self, entry: &str) -> Result<Vec<Multiaddr>, NetError> {
        let addr: Multiaddr = entry
            .parse()
            .map_err(|_| NetError::BadBootstrapAlias(entry.to_string()))?;
        if is_valid_bootstrap_addr(&addr) {
            Ok(vec![addr])
        } else {
            Err(NetError::BadBootstrapAlias(entry.to_string()))
        }
    }
}

/// `/(dns4|ip4)/host/tcp/port/p2p/id`.
pub fn is_valid_bootstrap_addr(addr: &Multiaddr) -> bool {
    let mut iter = addr.iter();
    let host_ok = matches!(
        iter.next(),
        Some(Protocol::Dns4(_)) | Some(Protocol::Ip4(_))
    );
    let tcp_ok = matches!(iter.next(), Some(Protocol::Tcp(_)));
    let p2p_ok = matches!(iter.next(), Some(Protocol::P2p(_)));
    host_ok && tcp_ok && p2p_ok && iter.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accepts_a_well_formed_dns4_bootstrap_addr() {
        let addr: Multiaddr =
            "/dns4/bootstrap.example.com/tcp/4001/p2p/12D3KooWJWoaqZhDaoEFshF7Rx1Q3ZL6viJV8xu2L4wCfzffIWXC"
                .parse()
                .unwrap();
        assert!(is_valid_bootstrap_addr(&addr));
        assert!(PassthroughResolver.resolve(&addr.to_string()).await.is_ok());
    }

    #[tokio::test]
    async fn rejects_a_bare_alias() {
        assert!(PassthroughResolver.resolve("bootstrap-east").await.is_err());
    }
}
