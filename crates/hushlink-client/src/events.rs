//! Events broadcast by the connection manager.

use hushlink_core::{GroupMessage, PeerState};
use hushlink_proto::ReceiptKind;

/// A peer connection state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTransition {
    /// Peer whose state changed.
    pub peer_id: String,
    /// State before the transition.
    pub from: PeerState,
    /// State after the transition.
    pub to: PeerState,
}

/// Application-level events decoded from incoming frames.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A chat message arrived over a pairwise session.
    Message {
        /// Sending peer.
        peer_id: String,
        /// Decrypted message text.
        text: String,
    },

    /// The peer started or stopped typing.
    Typing {
        /// Sending peer.
        peer_id: String,
        /// `true` while the peer is typing.
        active: bool,
    },

    /// The peer acknowledged a message.
    Receipt {
        /// Sending peer.
        peer_id: String,
        /// Delivered or read.
        kind: ReceiptKind,
    },

    /// A new group message was decrypted and applied.
    GroupMessage {
        /// Peer the envelope arrived from (the relaying member, not
        /// necessarily the author).
        peer_id: String,
        /// The applied message.
        message: GroupMessage,
    },

    /// The local device joined a group via invitation.
    GroupJoined {
        /// Group identifier.
        group_id: String,
        /// Group display name.
        name: String,
    },

    /// A trusted peer presented a different key than the one on record.
    ///
    /// The connection proceeds, but the change stays pending until the
    /// user acknowledges it.
    KeyRotation {
        /// Peer whose key changed.
        peer_id: String,
    },

    /// A frame from this peer failed cryptographic verification.
    ///
    /// Raised for tampered ciphertexts and replayed nonces, on both
    /// pairwise and group frames. The frame is dropped; the channel
    /// stays up. How loudly to warn the user is the caller's call.
    SecurityAlert {
        /// Peer the offending frame arrived from.
        peer_id: String,
        /// What failed verification.
        detail: String,
    },
}
