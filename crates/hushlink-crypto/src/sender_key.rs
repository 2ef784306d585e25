//! Group sender-key encryption.
//!
//! Each member of a group holds one symmetric sender key per group and
//! seals its outgoing group messages under it. Receivers hold a copy of
//! every member's sender key (distributed over pairwise sessions) and
//! decrypt with the key of the claimed author. This keeps group traffic
//! O(1) to send regardless of group size.
//!
//! Sender keys never travel in the clear: distribution happens inside
//! pairwise session ciphertext, and this store only ever sees raw key
//! bytes handed to it by the caller.
//!
//! # Security
//!
//! - Decryption fails closed: a bad tag yields
//!   [`SenderKeyError::TamperedMessage`] and zero plaintext.
//! - Key material is zeroized on drop and never appears in `Debug`
//!   output.
//! - Removing a member from a group removes their key; forward secrecy
//!   against removed members requires the remaining members to rotate
//!   their own keys, which is the caller's responsibility.

use std::collections::{BTreeMap, HashMap};

use chacha20poly1305::aead::Aead as _;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit as _, Nonce};
use zeroize::Zeroizing;

use crate::error::SenderKeyError;
use crate::session::NONCE_SIZE;

/// Size of a sender key in bytes.
pub const SENDER_KEY_SIZE: usize = 32;

/// Sealed frame overhead: nonce plus Poly1305 tag.
const SEAL_OVERHEAD: usize = NONCE_SIZE + 16;

/// Holds the local device's own sender keys and the sender keys learned
/// from other group members.
///
/// Keys are indexed by `(group_id, device_id)`; the local device's own
/// keys live in a separate map keyed by group alone.
#[derive(Default)]
pub struct GroupKeyStore {
    own: HashMap<String, Zeroizing<[u8; SENDER_KEY_SIZE]>>,
    peers: HashMap<(String, String), Zeroizing<[u8; SENDER_KEY_SIZE]>>,
}

impl GroupKeyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the local device's sender key for a group.
    ///
    /// The key MUST come from a cryptographically secure source; the
    /// store never generates key material itself. Replaces any previous
    /// own key for the group (key rotation).
    pub fn set_own_key(&mut self, group_id: &str, key: [u8; SENDER_KEY_SIZE]) {
        self.own.insert(group_id.to_owned(), Zeroizing::new(key));
    }

    /// The local sender key for a group, for distribution to members.
    pub fn own_key(&self, group_id: &str) -> Option<[u8; SENDER_KEY_SIZE]> {
        self.own.get(group_id).map(|key| **key)
    }

    /// Install a peer member's sender key.
    ///
    /// # Errors
    ///
    /// Returns [`SenderKeyError::InvalidKeyLength`] if `key` is not
    /// exactly [`SENDER_KEY_SIZE`] bytes.
    pub fn install_peer_key(
        &mut self,
        group_id: &str,
        device_id: &str,
        key: &[u8],
    ) -> Result<(), SenderKeyError> {
        let key: [u8; SENDER_KEY_SIZE] = key.try_into().map_err(|_| {
            SenderKeyError::InvalidKeyLength { expected: SENDER_KEY_SIZE, actual: key.len() }
        })?;
        self.peers.insert((group_id.to_owned(), device_id.to_owned()), Zeroizing::new(key));
        Ok(())
    }

    /// Whether a sender key is held for the given group member.
    pub fn has_peer_key(&self, group_id: &str, device_id: &str) -> bool {
        self.peers.contains_key(&(group_id.to_owned(), device_id.to_owned()))
    }

    /// All peer sender keys known for a group, keyed by device id.
    ///
    /// Used when inviting a new member, who needs every existing
    /// member's key to read group history going forward.
    pub fn peer_keys(&self, group_id: &str) -> BTreeMap<String, [u8; SENDER_KEY_SIZE]> {
        self.peers
            .iter()
            .filter(|((group, _), _)| group == group_id)
            .map(|((_, device), key)| (device.clone(), **key))
            .collect()
    }

    /// Drop the key for a single group member.
    pub fn remove_peer_key(&mut self, group_id: &str, device_id: &str) {
        self.peers.remove(&(group_id.to_owned(), device_id.to_owned()));
    }

    /// Drop every key associated with a group, own key included.
    pub fn remove_group(&mut self, group_id: &str) {
        self.own.remove(group_id);
        self.peers.retain(|(group, _), _| group != group_id);
    }

    /// Seal a group payload under the local sender key.
    ///
    /// Output layout: `nonce ‖ ciphertext ‖ tag`. The nonce MUST be
    /// unique per key; callers provide it so randomness stays outside
    /// this crate.
    ///
    /// # Errors
    ///
    /// Returns [`SenderKeyError::NoSenderKey`] if no own key is
    /// installed for the group.
    pub fn seal(
        &self,
        group_id: &str,
        plaintext: &[u8],
        nonce: [u8; NONCE_SIZE],
    ) -> Result<Vec<u8>, SenderKeyError> {
        let key = self.own.get(group_id).ok_or_else(|| SenderKeyError::NoSenderKey {
            group_id: group_id.to_owned(),
            device_id: "local".to_owned(),
        })?;

        let cipher = ChaCha20Poly1305::new(key.as_ref().into());
        let Ok(ciphertext) = cipher.encrypt(Nonce::from_slice(&nonce), plaintext) else {
            unreachable!("ChaCha20-Poly1305 encryption is infallible for in-memory buffers");
        };

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open a sealed group payload with the claimed author's key.
    ///
    /// # Errors
    ///
    /// - [`SenderKeyError::NoSenderKey`] if no key is held for the
    ///   claimed author.
    /// - [`SenderKeyError::TamperedMessage`] if the frame is truncated
    ///   or fails authentication. No plaintext is released.
    pub fn open(
        &self,
        group_id: &str,
        device_id: &str,
        sealed: &[u8],
    ) -> Result<Vec<u8>, SenderKeyError> {
        let key = self
            .peers
            .get(&(group_id.to_owned(), device_id.to_owned()))
            .or_else(|| self.own.get(group_id))
            .ok_or_else(|| SenderKeyError::NoSenderKey {
                group_id: group_id.to_owned(),
                device_id: device_id.to_owned(),
            })?;

        if sealed.len() < SEAL_OVERHEAD {
            return Err(SenderKeyError::TamperedMessage {
                group_id: group_id.to_owned(),
                device_id: device_id.to_owned(),
            });
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        let cipher = ChaCha20Poly1305::new(key.as_ref().into());
        cipher.decrypt(Nonce::from_slice(nonce), ciphertext).map_err(|_| {
            SenderKeyError::TamperedMessage {
                group_id: group_id.to_owned(),
                device_id: device_id.to_owned(),
            }
        })
    }
}

impl std::fmt::Debug for GroupKeyStore {
    // Key material must never reach logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupKeyStore")
            .field("own_groups", &self.own.len())
            .field("peer_keys", &self.peers.len())
            .finish()
    }
}
