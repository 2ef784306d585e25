//! Hushlink Domain Core
//!
//! Sans-IO core of the Hushlink peer-to-peer messenger: the peer model,
//! the per-peer connection state machine, causal clocks, the group sync
//! engine, and the persistence contract. Nothing here performs I/O —
//! state machines take events and time as input and return actions, and
//! all entropy comes from the [`env::Environment`] abstraction, so every
//! component is deterministic under test.
//!
//! The async driver layer lives in `hushlink-client`; cryptographic
//! primitives live in `hushlink-crypto`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod clock;
pub mod connection;
pub mod env;
mod error;
pub mod group;
pub mod peer;
pub mod storage;
pub mod sync;

pub use clock::{CausalClock, causal_order};
pub use connection::{ConnectAction, ConnectEvent, ConnectionConfig, PeerConnection, PeerState};
pub use env::Environment;
pub use error::{ConnectionError, SyncError};
pub use group::{Group, GroupMember, MAX_GROUP_MEMBERS};
pub use peer::{Peer, PeerId, TrustedPeer};
pub use storage::{MemoryMessageStore, MessageStore, MessageStatus, StorageError, StoredMessage};
pub use sync::{Applied, GroupMessage, GroupSync, sort_for_display};
