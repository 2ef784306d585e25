//! Peer model.
//!
//! Two layers of identity live here:
//!
//! - [`PeerId`] is session-ephemeral: freshly generated from environment
//!   entropy each run and never persisted. It identifies a peer within
//!   the current process only.
//! - [`TrustedPeer`] is durable: keyed by the peer's stable public tag,
//!   it records the exchange key we trust and tracks key rotations. A
//!   changed key is never silently re-trusted; the previous key is kept
//!   and the change stays visible until the user acknowledges it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connection::PeerState;
use crate::env::Environment;

/// Length of a session-ephemeral peer id in hex characters.
const PEER_ID_LEN: usize = 16;

/// Session-ephemeral peer identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    /// Generate a fresh id from environment entropy.
    pub fn generate<E: Environment>(env: &E) -> Self {
        Self(env.random_hex(PEER_ID_LEN))
    }

    /// Wrap an id received from a peer.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A peer as seen during the current session.
///
/// Mutated only through the connection state machine and handshake
/// handling; `public_key` is set once the handshake verified it.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Session-ephemeral id.
    pub id: PeerId,
    /// Name the peer announced in its handshake.
    pub display_name: String,
    /// Transport address, once discovered.
    pub address: Option<String>,
    /// Exchange public key, once the handshake completed.
    pub public_key: Option<[u8; 32]>,
    /// Connection lifecycle state.
    pub state: PeerState,
    /// Last time any frame arrived from this peer.
    pub last_seen: Option<DateTime<Utc>>,
    /// Whether the peer was found on the local network rather than via
    /// a relay.
    pub is_local: bool,
}

impl Peer {
    /// A newly discovered, not yet connected peer.
    pub fn new(id: PeerId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            address: None,
            public_key: None,
            state: PeerState::Disconnected,
            last_seen: None,
            is_local: false,
        }
    }
}

/// A durably trusted contact.
///
/// Keyed by the peer's stable public tag so trust survives both restarts
/// and the peer's session-ephemeral id changing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedPeer {
    /// Stable public tag of the peer's identity.
    pub id: String,
    /// Display name at the time of trust.
    pub display_name: String,
    /// Optional user-chosen alias.
    pub alias: Option<String>,
    /// Exchange public key currently on record.
    pub public_key: [u8; 32],
    /// Key on record before the last rotation, if any.
    pub previous_public_key: Option<[u8; 32]>,
    /// When the key last changed.
    pub key_rotated_at: Option<DateTime<Utc>>,
    /// False while a key change awaits explicit user acknowledgement.
    pub key_change_acknowledged: bool,
    /// When this peer was first trusted.
    pub trusted_at: DateTime<Utc>,
}

impl TrustedPeer {
    /// Trust a peer with its current key.
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        public_key: [u8; 32],
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            alias: None,
            public_key,
            previous_public_key: None,
            key_rotated_at: None,
            key_change_acknowledged: true,
            trusted_at: now,
        }
    }

    /// Record the key observed in a fresh handshake.
    ///
    /// Returns `true` if the key differs from the one on record. On a
    /// change, the old key is retained in `previous_public_key`, the
    /// rotation is timestamped, and `key_change_acknowledged` drops to
    /// `false`. Only [`TrustedPeer::acknowledge_key_change`] restores the
    /// acknowledged state; re-observing any key never does.
    pub fn record_key(&mut self, observed: [u8; 32], now: DateTime<Utc>) -> bool {
        if observed == self.public_key {
            return false;
        }

        self.previous_public_key = Some(self.public_key);
        self.public_key = observed;
        self.key_rotated_at = Some(now);
        self.key_change_acknowledged = false;
        true
    }

    /// User confirmed the key change out of band.
    pub fn acknowledge_key_change(&mut self) {
        self.key_change_acknowledged = true;
    }

    /// Whether an unacknowledged key change is pending.
    pub fn has_pending_key_change(&self) -> bool {
        !self.key_change_acknowledged
    }
}
