use std::io;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TunnelError>;

/// Failures of one tunnel session. None of these end the process on their own.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("{context}: {source}")]
    Transport {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("payload of {size} bytes exceeds the echo payload limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("adapter in unrecoverable state: {0}")]
    AdapterFatal(String),
}

impl TunnelError {
    pub fn transport(context: &'static str, source: io::Error) -> Self {
        TunnelError::Transport { context, source }
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        TunnelError::Malformed(msg.into())
    }
}
