use std::io;

use crate::host::{HostError, PeerId};

/// Errors returned by [crate::Client] operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// No accepted protocol could be negotiated with the peer
    #[error("failed to open stream to {peer}: {source}")]
    Negotiation {
        peer: PeerId,
        #[source]
        source: HostError,
    },

    /// The sender was retired by an earlier failure
    #[error("message sender has been invalidated")]
    Invalidated,

    #[error("failed to encode message: {0}")]
    Encode(#[from] bincode::Error),

    #[error("message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: usize, max: usize },

    #[error("failed to write message: {0}")]
    Write(#[source] io::Error),

    #[error("timed out reading response")]
    ReadTimeout,

    #[error("failed to read response: {0}")]
    Read(#[source] io::Error),

    /// Returned as-is from the caller's decoder
    #[error(transparent)]
    Decode(anyhow::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid client configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
