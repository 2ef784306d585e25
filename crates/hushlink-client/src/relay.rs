//! Rendezvous relay abstraction.
//!
//! A relay stores sealed announce envelopes in mailboxes keyed by opaque
//! rendezvous tokens. Both sides of a pairing derive the same tokens
//! independently (see `hushlink_crypto::rendezvous`), so the relay learns
//! nothing about who is meeting whom: it sees only token strings and
//! ciphertext.
//!
//! Polling does not drain a mailbox; entries age out by relay policy and
//! receivers discard duplicates through the session replay guard.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

/// Entries kept per mailbox before the oldest is evicted.
const MAILBOX_DEPTH: usize = 8;

/// Relay errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The relay could not be reached or refused the request.
    #[error("relay unavailable: {0}")]
    Unavailable(String),
}

/// A mailbox relay addressed by rendezvous tokens.
#[async_trait]
pub trait RendezvousRelay: Send + Sync {
    /// Deposit a sealed envelope under a token.
    async fn publish(&self, token: &str, envelope: Vec<u8>) -> Result<(), RelayError>;

    /// Fetch the current envelopes under a token, without draining.
    async fn poll(&self, token: &str) -> Result<Vec<Vec<u8>>, RelayError>;
}

/// In-process relay for tests and local rendezvous.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    mailboxes: Arc<Mutex<HashMap<String, Vec<Vec<u8>>>>>,
}

impl MemoryRelay {
    /// An empty relay.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RendezvousRelay for MemoryRelay {
    async fn publish(&self, token: &str, envelope: Vec<u8>) -> Result<(), RelayError> {
        let mut mailboxes = self.mailboxes.lock();
        let mailbox = mailboxes.entry(token.to_owned()).or_default();
        if mailbox.len() >= MAILBOX_DEPTH {
            mailbox.remove(0);
        }
        mailbox.push(envelope);
        Ok(())
    }

    async fn poll(&self, token: &str) -> Result<Vec<Vec<u8>>, RelayError> {
        Ok(self.mailboxes.lock().get(token).cloned().unwrap_or_default())
    }
}
