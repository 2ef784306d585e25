//! Error types for session and sender-key operations.
//!
//! Tampering and missing-session conditions are deliberately distinct:
//! a missing session is recoverable by performing a handshake, while a
//! failed authentication tag is a trust event that must reach the caller
//! and must never be retried silently.

use thiserror::Error;

/// Errors from pairwise session operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No completed handshake exists for this peer.
    #[error("no established session for peer {peer_id}")]
    SessionNotEstablished {
        /// Peer the operation targeted.
        peer_id: String,
    },

    /// Ciphertext failed integrity verification. No plaintext is released.
    #[error("message from peer {peer_id} failed authentication")]
    TamperedMessage {
        /// Peer the ciphertext claimed to come from.
        peer_id: String,
    },

    /// A previously seen nonce was replayed on this session.
    #[error("replayed nonce from peer {peer_id}")]
    ReplayedNonce {
        /// Peer the ciphertext claimed to come from.
        peer_id: String,
    },

    /// Peer public key bytes were not a valid X25519 point encoding.
    #[error("invalid peer public key: expected {expected} bytes, got {actual}")]
    InvalidPublicKey {
        /// Required key length.
        expected: usize,
        /// Length received.
        actual: usize,
    },
}

impl SessionError {
    /// True when this error indicates possible tampering or an active
    /// attack, as opposed to missing local state.
    ///
    /// Security-relevant errors are surfaced to the user as trust events
    /// and are never auto-retried.
    pub fn is_security_relevant(&self) -> bool {
        matches!(self, Self::TamperedMessage { .. } | Self::ReplayedNonce { .. })
    }
}

/// Errors from group sender-key operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SenderKeyError {
    /// No sender key is held for this (group, device) pair.
    #[error("no sender key for device {device_id} in group {group_id}")]
    NoSenderKey {
        /// Group the operation targeted.
        group_id: String,
        /// Author device the key belongs to.
        device_id: String,
    },

    /// Sealed group payload failed integrity verification.
    #[error("group message from device {device_id} in group {group_id} failed authentication")]
    TamperedMessage {
        /// Group the payload belongs to.
        group_id: String,
        /// Claimed author device.
        device_id: String,
    },

    /// A sender key had the wrong length.
    #[error("invalid sender key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Required key length.
        expected: usize,
        /// Length received.
        actual: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tampering_is_security_relevant() {
        assert!(SessionError::TamperedMessage { peer_id: "p".into() }.is_security_relevant());
        assert!(SessionError::ReplayedNonce { peer_id: "p".into() }.is_security_relevant());
    }

    #[test]
    fn missing_session_is_not_security_relevant() {
        assert!(
            !SessionError::SessionNotEstablished { peer_id: "p".into() }.is_security_relevant()
        );
    }
}
