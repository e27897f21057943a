use crate::types::Rank;

pub type Result<T> = std::result::Result<T, TenaxError>;

/// Errors surfaced by engine setup and cluster formation.
///
/// Collective operations themselves never return an error: transient link
/// faults are recovered internally and logical invariant violations abort
/// the process.
#[derive(Debug, thiserror::Error)]
pub enum TenaxError {
    #[error("connection to rank {rank} failed: {reason}")]
    ConnectionFailed { rank: Rank, reason: String },

    #[error("cluster formation timed out: {joined}/{expected} nodes joined")]
    ClusterFormationTimeout { joined: u32, expected: u32 },

    #[error("rendezvous timed out waiting for the link table (epoch {epoch})")]
    RendezvousTimeout { epoch: u64 },

    #[error("protocol version mismatch: local={local}, remote={remote}")]
    ProtocolMismatch { local: u16, remote: u16 },

    #[error("message decode failed: {0}")]
    DecodeFailed(String),

    #[error("message encode failed: {0}")]
    EncodeFailed(String),

    #[error("invalid rank {rank}: world size is {world_size}")]
    InvalidRank { rank: Rank, world_size: u32 },

    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TenaxError {
    /// Create a `Transport` error with just a message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Transport` error with a message and a source error.
    pub fn transport_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }
}
