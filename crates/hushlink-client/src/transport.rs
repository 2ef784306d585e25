//! Transport abstraction.
//!
//! The connection manager speaks to the network through two traits:
//! [`Dialer`] locates peers and opens channels, [`TransportChannel`]
//! moves opaque frames. Frames are already sealed by the session layer,
//! so a transport never sees plaintext after the handshake.
//!
//! [`memory`] provides an in-process implementation used by tests and by
//! the local-loopback mode.

use async_trait::async_trait;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Peer could not be located.
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// Channel to a discovered address could not be opened.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The channel is closed.
    #[error("channel closed")]
    ChannelClosed,
}

/// A bidirectional frame channel to one peer.
///
/// Ordering within a channel is guaranteed by the transport; framing is
/// the transport's problem, the manager hands over complete frames.
#[async_trait]
pub trait TransportChannel: Send {
    /// Send one frame.
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Receive the next frame. `None` once the peer side is gone.
    async fn recv(&mut self) -> Option<Vec<u8>>;

    /// Close the channel.
    async fn close(&mut self);
}

/// Owned channel handle as stored by the manager.
pub type BoxedChannel = Box<dyn TransportChannel>;

/// Locates peers and opens channels to them.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Resolve a peer id to a transport address.
    async fn discover(&self, peer_id: &str) -> Result<String, TransportError>;

    /// Open a channel to a discovered address.
    async fn open(&self, address: &str) -> Result<BoxedChannel, TransportError>;
}

/// In-process transport over tokio channels.
pub mod memory {
    use std::collections::HashMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::{BoxedChannel, Dialer, TransportChannel, TransportError};

    const CHANNEL_DEPTH: usize = 64;

    /// One side of an in-process channel pair.
    pub struct MemoryChannel {
        tx: mpsc::Sender<Vec<u8>>,
        rx: mpsc::Receiver<Vec<u8>>,
    }

    #[async_trait]
    impl TransportChannel for MemoryChannel {
        async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
            self.tx.send(frame).await.map_err(|_| TransportError::ChannelClosed)
        }

        async fn recv(&mut self) -> Option<Vec<u8>> {
            self.rx.recv().await
        }

        async fn close(&mut self) {
            self.rx.close();
        }
    }

    #[derive(Default)]
    struct NetworkInner {
        /// peer id -> address
        directory: HashMap<String, String>,
        /// address -> acceptor
        listeners: HashMap<String, mpsc::Sender<MemoryChannel>>,
    }

    /// Shared in-process network: a peer directory plus per-address
    /// listeners. Cloning shares the network.
    #[derive(Clone, Default)]
    pub struct MemoryNetwork {
        inner: Arc<Mutex<NetworkInner>>,
    }

    impl MemoryNetwork {
        /// An empty network.
        pub fn new() -> Self {
            Self::default()
        }

        /// Make a peer discoverable at an address.
        pub fn register(&self, peer_id: impl Into<String>, address: impl Into<String>) {
            self.inner.lock().directory.insert(peer_id.into(), address.into());
        }

        /// Listen for incoming channels at an address.
        ///
        /// Replaces any previous listener for the address. Each accepted
        /// value is the remote end of a freshly opened channel pair.
        pub fn listen(&self, address: impl Into<String>) -> mpsc::Receiver<MemoryChannel> {
            let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
            self.inner.lock().listeners.insert(address.into(), tx);
            rx
        }
    }

    #[async_trait]
    impl Dialer for MemoryNetwork {
        async fn discover(&self, peer_id: &str) -> Result<String, TransportError> {
            self.inner
                .lock()
                .directory
                .get(peer_id)
                .cloned()
                .ok_or_else(|| TransportError::Discovery(format!("{peer_id} not registered")))
        }

        async fn open(&self, address: &str) -> Result<BoxedChannel, TransportError> {
            let acceptor = self
                .inner
                .lock()
                .listeners
                .get(address)
                .cloned()
                .ok_or_else(|| TransportError::Connect(format!("no listener at {address}")))?;

            let (near_tx, far_rx) = mpsc::channel(CHANNEL_DEPTH);
            let (far_tx, near_rx) = mpsc::channel(CHANNEL_DEPTH);
            let near = MemoryChannel { tx: near_tx, rx: near_rx };
            let far = MemoryChannel { tx: far_tx, rx: far_rx };

            acceptor
                .send(far)
                .await
                .map_err(|_| TransportError::Connect(format!("listener at {address} is gone")))?;
            Ok(Box::new(near))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn open_delivers_a_connected_pair() {
            let network = MemoryNetwork::new();
            let mut incoming = network.listen("mem:a");

            let mut near = network.open("mem:a").await.unwrap();
            let mut far = incoming.recv().await.unwrap();

            near.send(b"ping".to_vec()).await.unwrap();
            assert_eq!(far.recv().await.unwrap(), b"ping");
            far.send(b"pong".to_vec()).await.unwrap();
            assert_eq!(near.recv().await.unwrap(), b"pong");
        }

        #[tokio::test]
        async fn discover_resolves_registered_peers_only() {
            let network = MemoryNetwork::new();
            network.register("peer-a", "mem:a");

            assert_eq!(network.discover("peer-a").await.unwrap(), "mem:a");
            assert!(matches!(
                network.discover("peer-b").await,
                Err(TransportError::Discovery(_))
            ));
        }

        #[tokio::test]
        async fn open_without_listener_fails() {
            let network = MemoryNetwork::new();
            assert!(matches!(
                network.open("mem:missing").await,
                Err(TransportError::Connect(_))
            ));
        }

        #[tokio::test]
        async fn dropping_one_side_closes_the_other() {
            let network = MemoryNetwork::new();
            let mut incoming = network.listen("mem:a");

            let near = network.open("mem:a").await.unwrap();
            let mut far = incoming.recv().await.unwrap();

            drop(near);
            assert!(far.recv().await.is_none());
        }
    }
}
