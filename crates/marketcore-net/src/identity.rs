//! C1 — Identity Store.
//!
//! A node's identity is a process-lifetime Ed25519 key-pair, loaded from a
//! local file if present, or generated and persisted atomically otherwise.
//! The identity used to build the swarm must equal the identity on disk —
//! any other outcome (corrupt file, partial write) is a fatal start-up error,
//! never a silent regeneration.

use std::{
    fs,
    path::{Path, PathBuf},
};

use libp2p::{identity, PeerId};

use crate::error::NetError;

/// A loaded or freshly created node identity.
#[derive(Clone)]
pub struct PeerIdentity {
    keypair: identity::Keypair,
    path: PathBuf,
}

impl PeerIdentity {
    /// `loadOrCreate(path) -> PeerIdentity` (spec.md §4.1).
    ///
    /// If `path` exists, parses it as a protobuf-encoded `identity::Keypair`
    /// and fails with [`NetError::IdentityCorrupt`] if it cannot be decoded —
    /// there is no legacy format to migrate and no silent regeneration.
    /// Otherwise generates a fresh Ed25519 key-pair and writes it via a
    /// temp-file-then-rename so a crash mid-write never leaves a partial
    /// identity file behind.
    pub fn load_or_create(path: &Path) -> Result<Self, NetError> {
        if path.exists() {
            let raw = fs::read(path).map_err(|e| NetError::IdentityCorrupt(e.to_string()))?;
            let keypair = identity::Keypair::from_protobuf_encoding(&raw).map_err(|e| {
                NetError::IdentityCorrupt(format!(
                    "'{}' ({} bytes) is not a valid protobuf-encoded keypair: {e}",
                    path.display(),
                    raw.len()
                ))
            })?;
            tracing::info!(path = %path.display(), peer_id = %keypair.public().to_peer_id(), "loaded identity");
            return Ok(Self {
                keypair,
                path: path.to_path_buf(),
            });
        }

        let keypair = identity::Keypair::generate_ed25519();
        let encoded = keypair
            .to_protobuf_encoding()
            .map_err(|e| NetError::Keypair(e.to_string()))?;
        write_atomic(path, &encoded)?;
        tracing::info!(path = %path.display(), peer_id = %keypair.public().to_peer_id(), "generated new identity");
        Ok(Self {
            keypair,
            path: path.to_path_buf(),
        })
    }

    pub fn keypair(&self) -> &identity::Keypair {
        &self.keypair
    }

    pub fn peer_id(&self) -> PeerId {
        self.keypair.public().to_peer_id()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Invariant check: the identity this node is running with must equal the
    /// identity reloaded from disk. Call after boot to catch a racing writer.
    pub fn verify_matches_disk(&self) -> Result<(), NetError> {
        let reloaded = Self::load_or_create(&self.path)?;
        if reloaded.peer_id() != self.peer_id() {
            return Err(NetError::IdentityMismatch);
        }
        Ok(())
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), NetError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| NetError::Keypair(e.to_string()))?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, data).map_err(|e| NetError::Keypair(e.to_string()))?;
    fs::rename(&tmp_path, path).map_err(|e| NetError::Keypair(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_persists_a_new_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        let id = PeerIdentity::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert!(id.verify_matches_disk().is_ok());
    }

    #[test]
    fn reloading_yields_the_same_peer_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        let first = PeerIdentity::load_or_create(&path).unwrap();
        let second = PeerIdentity::load_or_create(&path).unwrap();
        assert_eq!(first.peer_id(), second.peer_id());
    }

    #[test]
    fn corrupt_file_is_rejected_without_regenerating() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        fs::write(&path, b"not a valid keypair").unwrap();
        let err = PeerIdentity::load_or_create(&path).unwrap_err();
        assert!(matches!(err, NetError::IdentityCorrupt(_)));
        // The corrupt file must still be there - no silent overwrite.
        assert_eq!(fs::read(&path).unwrap(), b"not a valid keypair");
    }
}
