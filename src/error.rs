//! RelayMesh error types

use thiserror::Error;

/// Result type alias for RelayMesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// RelayMesh error taxonomy (see SPEC_FULL.md §7)
#[derive(Error, Debug)]
pub enum Error {
    /// Rejected by business-rule validation: unknown user/channel, duplicate name.
    #[error("validation failed: {0}")]
    ValidationFailure(String),

    /// A peer RPC (election, Berkeley, pull-sync) timed out or the peer dropped.
    #[error("peer {node_id} unreachable: {reason}")]
    PeerUnreachable { node_id: u64, reason: String },

    /// The registry could not be reached for register/heartbeat/list.
    #[error("registry unreachable: {0}")]
    RegistryUnreachable(String),

    /// Socket-level failure on the local listener or an outbound connection.
    #[error("transport error: {0}")]
    TransportError(String),

    /// Snapshot load/persist failed.
    #[error("persistence error: {0}")]
    PersistenceError(String),

    /// Undecodable frame or unknown service verb.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("message decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("snapshot encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether a periodic task should log-and-retry-next-tick rather than escalate.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::PeerUnreachable { .. }
                | Error::RegistryUnreachable(_)
                | Error::TransportError(_)
        )
    }
}
