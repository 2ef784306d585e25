//! Error types for the Hushlink domain core.
//!
//! Strongly typed per layer: connection errors (discovery, channel,
//! handshake, timeouts, state transitions) and group sync errors. Each
//! enum carries a classification helper so drivers can decide between
//! retrying locally and surfacing a trust event to the user.

use std::time::Duration;

use thiserror::Error;

use crate::connection::PeerState;

/// Errors from the per-peer connection state machine and its drivers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Peer could not be located through any rendezvous channel.
    #[error("discovery failed for peer {peer_id}: {reason}")]
    DiscoveryFailed {
        /// Peer that was being discovered.
        peer_id: String,
        /// Driver-reported cause.
        reason: String,
    },

    /// A transport channel to the peer could not be opened.
    #[error("channel open failed for peer {peer_id}: {reason}")]
    ChannelOpenFailed {
        /// Peer the channel targeted.
        peer_id: String,
        /// Driver-reported cause.
        reason: String,
    },

    /// The cryptographic handshake was rejected or did not verify.
    ///
    /// Never retried silently: a failed handshake is a trust event.
    #[error("handshake with peer {peer_id} failed: {reason}")]
    HandshakeFailed {
        /// Peer the handshake was with.
        peer_id: String,
        /// What went wrong.
        reason: String,
    },

    /// A connection phase exceeded its configured deadline.
    #[error("{phase} timeout after {elapsed:?}")]
    Timeout {
        /// Phase that timed out (`"connect"` or `"handshake"`).
        phase: &'static str,
        /// How long we waited.
        elapsed: Duration,
    },

    /// Operation requires a connected peer.
    #[error("peer {peer_id} is not connected")]
    NotConnected {
        /// Peer the operation targeted.
        peer_id: String,
    },

    /// Invalid state transition attempted.
    #[error("invalid transition: cannot {operation} from {state:?}")]
    InvalidState {
        /// Current state when the error occurred.
        state: PeerState,
        /// Operation that was attempted.
        operation: &'static str,
    },
}

impl ConnectionError {
    /// True when this error is transient and the operation may succeed on
    /// retry.
    ///
    /// Timeouts and transport failures recover locally through the state
    /// machine. Handshake failures never do: they indicate a key
    /// mismatch, an identity rotation mid-flight, or a hostile peer, and
    /// are surfaced to the caller instead of retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::DiscoveryFailed { .. } | Self::ChannelOpenFailed { .. } | Self::Timeout { .. }
        )
    }
}

/// Errors from group synchronization.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// A gap-repair request referenced sequence numbers the author never
    /// produced.
    #[error(
        "out-of-range sequence for device {device_id}: requested {from}..={to}, have up to {max}"
    )]
    OutOfRangeSequence {
        /// Device whose messages were requested.
        device_id: String,
        /// First requested sequence number.
        from: u64,
        /// Last requested sequence number.
        to: u64,
        /// Highest sequence number the local clock covers.
        max: u64,
    },

    /// The group is at its member capacity.
    #[error("group {group_id} is full ({max} members)")]
    GroupFull {
        /// Group that rejected the member.
        group_id: String,
        /// Member capacity.
        max: usize,
    },

    /// An envelope referenced a device that is not a group member.
    #[error("device {device_id} is not a member of group {group_id}")]
    UnknownMember {
        /// Group the envelope targeted.
        group_id: String,
        /// Unrecognized device.
        device_id: String,
    },

    /// Sender-key operation failed.
    #[error(transparent)]
    SenderKey(#[from] hushlink_crypto::SenderKeyError),

    /// Control payload could not be parsed.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<hushlink_proto::ProtocolError> for SyncError {
    fn from(err: hushlink_proto::ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl SyncError {
    /// True when this error indicates possible tampering rather than a
    /// recoverable protocol mismatch.
    pub fn is_security_relevant(&self) -> bool {
        matches!(
            self,
            Self::SenderKey(hushlink_crypto::SenderKeyError::TamperedMessage { .. })
        )
    }
}
