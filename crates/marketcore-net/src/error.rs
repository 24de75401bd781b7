use thiserror::Error;

/// Transport/transport-adjacent errors (C1 identity, C2 peer network, C5
/// direct messaging framing). Message-content rejections (`BadSender`,
/// `BadSignature`, ...) live in `marketcore-market::ProcessError` instead —
/// this crate never inspects envelope payloads, only carries them.
#[derive(Debug, Error, Clone)]
pub enum NetError {
    #[error("dial failed: no route to peer ({0})")]
    Unreachable(String),

    #[error("dial timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("dial refused: {0}")]
    DialRefused(String),

    #[error("frame of {got} bytes exceeds max_message_size of {max} bytes")]
    OversizeFrame { got: usize, max: usize },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("identity file is corrupt or unreadable: {0}")]
    IdentityCorrupt(String),

    #[error("identity mismatch: on-disk identity does not match the running node")]
    IdentityMismatch,

    #[error("keypair error: {0}")]
    Keypair(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("no mesh peers for topic {0} within deadline")]
    NoMesh(String),

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("bootstrap alias did not resolve to a valid multiaddr: {0}")]
    BadBootstrapAlias(String),

    #[error("node already shut down")]
    Shutdown,
}

impl From<std::io::Error> for NetError {
    fn from(e: std::io::Error) -> Self {
        NetError::Io(e.to_string())
    }
}
