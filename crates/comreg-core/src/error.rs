use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("peer closed the channel after {read} of {expected} bytes")]
    PeerClosed { read: usize, expected: usize },

    #[error("invalid frame: payload length {0}")]
    InvalidFrame(i64),

    #[error("channel is unusable after an earlier failure")]
    Unusable,

    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// True when the peer went away, as opposed to a protocol violation.
    pub fn is_closed(&self) -> bool {
        matches!(self, ChannelError::PeerClosed { .. })
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("a virtualization scope is already open in this process")]
    ScopeActive,

    #[error("unknown registry root: {0}")]
    UnknownRoot(String),

    #[error("registry key not found: {0}")]
    NotFound(String),

    #[error("registry access is not supported on this platform")]
    Unsupported,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    pub fn os(op: &'static str, code: u32) -> Self {
        RegistryError::Os {
            op,
            source: std::io::Error::from_raw_os_error(code as i32),
        }
    }
}
