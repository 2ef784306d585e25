//! Client-level error type.

use thiserror::Error;

use crate::relay::RelayError;
use crate::transport::TransportError;

/// Errors surfaced by the connection manager.
///
/// Wraps the layer-specific errors so callers get one type; use
/// [`hushlink_core::ConnectionError::is_transient`] on the connection
/// variant to decide whether to retry.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection lifecycle failure.
    #[error(transparent)]
    Connection(#[from] hushlink_core::ConnectionError),

    /// Pairwise session failure.
    #[error(transparent)]
    Session(#[from] hushlink_crypto::SessionError),

    /// Group synchronization failure.
    #[error(transparent)]
    Sync(#[from] hushlink_core::SyncError),

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Rendezvous relay failure.
    #[error(transparent)]
    Relay(#[from] RelayError),

    /// Wire frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Operation targeted a peer the manager has never seen.
    #[error("unknown peer {peer_id}")]
    UnknownPeer {
        /// Peer the operation targeted.
        peer_id: String,
    },

    /// Operation targeted a group the local device is not in.
    #[error("unknown group {group_id}")]
    UnknownGroup {
        /// Group the operation targeted.
        group_id: String,
    },
}

impl From<hushlink_proto::ProtocolError> for ClientError {
    fn from(err: hushlink_proto::ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}
