//! Hushlink Async Client
//!
//! Tokio driver layer around the sans-IO stack: [`ConnectionManager`]
//! owns the sessions, connection machines, and group engines from
//! `hushlink-core`/`hushlink-crypto` and executes their actions against
//! pluggable transports.
//!
//! # Architecture
//!
//! - [`transport::Dialer`] / [`transport::TransportChannel`]: how frames
//!   reach peers. [`transport::memory`] is the in-process implementation.
//! - [`relay::RendezvousRelay`]: token-addressed mailboxes for reaching
//!   trusted peers across networks without revealing who meets whom.
//! - [`manager::ConnectionManager`]: the driver. One task per channel,
//!   broadcast streams for state transitions and decoded events.
//!
//! Protocol logic lives below this crate; everything here is I/O,
//! locking, and task management.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod error;
pub mod events;
pub mod manager;
pub mod relay;
pub mod transport;

pub use error::ClientError;
pub use events::{ClientEvent, PeerTransition};
pub use manager::{ConnectionManager, ManagerConfig, SystemEnv};
pub use relay::{MemoryRelay, RelayError, RendezvousRelay};
pub use transport::{
    BoxedChannel, Dialer, TransportChannel, TransportError,
    memory::{MemoryChannel, MemoryNetwork},
};
