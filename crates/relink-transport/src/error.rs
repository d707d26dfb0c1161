use thiserror::Error;

/// Errors produced by the transport engine.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no hosts configured")]
    NoHosts,

    #[error("every configured host is dead")]
    HostsExhausted,

    #[error("failed to open carrier session: {reason}")]
    SessionOpen { reason: String },

    #[error("request to {url} failed: {reason}")]
    RequestFailed { url: String, reason: String },

    #[error("unexpected response status {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },

    #[error("peer disconnected")]
    PeerDisconnected,

    #[error("frame rejected: expected agent id 0x{expected:08X}, got 0x{got:08X}")]
    ForeignFrame { expected: u32, got: u32 },

    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },

    #[error("handshake rejected: controller did not echo the agent id")]
    HandshakeRejected,

    #[error("operation not supported by the active carrier")]
    Unsupported,

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
