//! Pairwise session management.
//!
//! [`SessionManager`] owns the local identity and every established
//! pairwise session. It is the single mutation point for identity
//! rotation: regenerating identity keys destroys all sessions atomically
//! and bumps a generation counter that in-flight handshakes check before
//! completing.
//!
//! Wire format of a sealed frame: `nonce (12) ‖ ciphertext ‖ tag (16)`.
//! Callers provide the nonce so randomness stays outside this crate.
//!
//! # Invariants
//!
//! - A session exists only after an explicit `establish` against the
//!   current identity generation.
//! - Decryption fails closed: on any authentication failure no plaintext
//!   is released and the session state is unchanged.
//! - A nonce accepted once on a session is never accepted again
//!   (bounded-history replay guard).

use std::collections::{HashMap, HashSet};

use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead as _, KeyInit as _},
};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::PublicKey;
use zeroize::Zeroizing;

use crate::{error::SessionError, identity::IdentityKeys};

/// ChaCha20-Poly1305 nonce size in bytes.
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag size in bytes.
const TAG_SIZE: usize = 16;

/// HKDF info string for session key derivation (domain separation).
const SESSION_KEY_INFO: &[u8] = b"hushlink:session:v1";

/// Replay-guard history cap per session. Oldest half is evicted when
/// exceeded, trading perfect replay detection for bounded memory on
/// long-lived sessions.
const MAX_NONCE_HISTORY: usize = 10_000;

/// One established pairwise session.
struct Session {
    key: Zeroizing<[u8; 32]>,
    seen_nonces: HashSet<[u8; NONCE_SIZE]>,
}

/// Owns the local identity and all pairwise sessions.
pub struct SessionManager {
    identity: IdentityKeys,
    generation: u64,
    sessions: HashMap<String, Session>,
}

impl SessionManager {
    /// Create a manager around a fresh identity. Generation starts at 1.
    pub fn new(identity: IdentityKeys) -> Self {
        Self { identity, generation: 1, sessions: HashMap::new() }
    }

    /// The current identity.
    pub fn identity(&self) -> &IdentityKeys {
        &self.identity
    }

    /// Current identity generation. Bumped on every rotation.
    ///
    /// A handshake records the generation it started against and must be
    /// abandoned if the manager has moved past it.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Replace the identity keypair and destroy every session.
    ///
    /// This is atomic from the caller's perspective: after this returns,
    /// no session derived from the old identity exists and the generation
    /// counter has advanced, so handshakes started before the rotation
    /// cannot complete.
    pub fn regenerate_identity(&mut self, signing_seed: [u8; 32], exchange_seed: [u8; 32]) -> u64 {
        self.identity = IdentityKeys::from_seeds(signing_seed, exchange_seed);
        self.sessions.clear();
        self.generation += 1;
        self.generation
    }

    /// Tear down all sessions without rotating identity.
    pub fn clear_sessions(&mut self) {
        self.sessions.clear();
    }

    /// Drop the session for one peer, if any.
    pub fn remove_session(&mut self, peer_id: &str) {
        self.sessions.remove(peer_id);
    }

    /// Whether a completed handshake exists for this peer.
    pub fn has_session(&self, peer_id: &str) -> bool {
        self.sessions.contains_key(peer_id)
    }

    /// Copy of the pairwise session key, for derivations both peers can
    /// repeat (hourly rendezvous tokens). Key material: callers must not
    /// persist or log it.
    pub fn shared_secret(&self, peer_id: &str) -> Option<Zeroizing<[u8; 32]>> {
        self.sessions.get(peer_id).map(|session| session.key.clone())
    }

    /// Derive and install a session key from a peer's exchange public key.
    ///
    /// X25519 Diffie-Hellman followed by HKDF-SHA256 with the
    /// `hushlink:session:v1` info string. Re-establishing replaces any
    /// previous session and resets the replay guard.
    pub fn establish(&mut self, peer_id: &str, peer_public: &[u8]) -> Result<(), SessionError> {
        let public: [u8; 32] = peer_public.try_into().map_err(|_| {
            SessionError::InvalidPublicKey { expected: 32, actual: peer_public.len() }
        })?;

        let shared = self.identity.exchange_secret().diffie_hellman(&PublicKey::from(public));

        let mut key = Zeroizing::new([0u8; 32]);
        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let Ok(()) = hk.expand(SESSION_KEY_INFO, key.as_mut()) else {
            unreachable!("32-byte output is always valid for HKDF-SHA256");
        };

        self.sessions
            .insert(peer_id.to_string(), Session { key, seen_nonces: HashSet::new() });
        Ok(())
    }

    /// Seal plaintext for a peer.
    ///
    /// The caller provides the nonce; it MUST be fresh random bytes in
    /// production. Returns `nonce ‖ ciphertext ‖ tag`.
    ///
    /// # Errors
    ///
    /// - [`SessionError::SessionNotEstablished`] without a completed
    ///   handshake.
    pub fn seal(
        &self,
        peer_id: &str,
        plaintext: &[u8],
        nonce: [u8; NONCE_SIZE],
    ) -> Result<Vec<u8>, SessionError> {
        let session = self
            .sessions
            .get(peer_id)
            .ok_or_else(|| SessionError::SessionNotEstablished { peer_id: peer_id.to_string() })?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(session.key.as_ref()));
        let Ok(ciphertext) = cipher.encrypt(Nonce::from_slice(&nonce), plaintext) else {
            unreachable!("ChaCha20-Poly1305 encryption cannot fail with valid inputs");
        };

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open a sealed frame from a peer.
    ///
    /// # Errors
    ///
    /// - [`SessionError::SessionNotEstablished`] without a session.
    /// - [`SessionError::TamperedMessage`] on truncation or tag failure;
    ///   no plaintext is released.
    /// - [`SessionError::ReplayedNonce`] when the nonce was seen before.
    pub fn open(&mut self, peer_id: &str, sealed: &[u8]) -> Result<Vec<u8>, SessionError> {
        let session = self
            .sessions
            .get_mut(peer_id)
            .ok_or_else(|| SessionError::SessionNotEstablished { peer_id: peer_id.to_string() })?;

        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(SessionError::TamperedMessage { peer_id: peer_id.to_string() });
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&sealed[..NONCE_SIZE]);

        if session.seen_nonces.contains(&nonce) {
            return Err(SessionError::ReplayedNonce { peer_id: peer_id.to_string() });
        }

        let cipher = ChaCha20Poly1305::new(Key::from_slice(session.key.as_ref()));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), &sealed[NONCE_SIZE..])
            .map_err(|_| SessionError::TamperedMessage { peer_id: peer_id.to_string() })?;

        // Record only after successful authentication so a tampered frame
        // cannot poison the replay guard.
        session.seen_nonces.insert(nonce);
        if session.seen_nonces.len() > MAX_NONCE_HISTORY {
            let keep: Vec<_> =
                session.seen_nonces.iter().copied().skip(MAX_NONCE_HISTORY / 2).collect();
            session.seen_nonces = keep.into_iter().collect();
        }

        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build two managers with sessions established toward each other.
    fn paired_managers() -> (SessionManager, SessionManager) {
        let mut alice = SessionManager::new(IdentityKeys::from_seeds([0x11; 32], [0x11; 32]));
        let mut bob = SessionManager::new(IdentityKeys::from_seeds([0x22; 32], [0x22; 32]));

        let alice_pub = alice.identity().exchange_public();
        let bob_pub = bob.identity().exchange_public();
        alice.establish("bob", &bob_pub).unwrap();
        bob.establish("alice", &alice_pub).unwrap();
        (alice, bob)
    }

    #[test]
    fn session_key_reference_vector() {
        // Secrets 0x11*32 and 0x22*32, HKDF info "hushlink:session:v1".
        // Reference session key computed with an independent
        // implementation for cross-client interoperability.
        let mut alice = SessionManager::new(IdentityKeys::from_seeds([0; 32], [0x11; 32]));
        let bob = SessionManager::new(IdentityKeys::from_seeds([0; 32], [0x22; 32]));

        alice.establish("bob", &bob.identity().exchange_public()).unwrap();
        let session = alice.sessions.get("bob").unwrap();
        assert_eq!(
            hex::encode(session.key.as_ref()),
            "728b012132e61e15b9b314fbcc1e1798b8fcd23f13afbaae2ebda58694d2f6a8"
        );
    }

    #[test]
    fn seal_open_roundtrip() {
        let (alice, mut bob) = paired_managers();

        let sealed = alice.seal("bob", b"hello bob", [7; NONCE_SIZE]).unwrap();
        assert_eq!(bob.open("alice", &sealed).unwrap(), b"hello bob");
    }

    #[test]
    fn empty_payload_roundtrip() {
        let (alice, mut bob) = paired_managers();

        let sealed = alice.seal("bob", b"", [1; NONCE_SIZE]).unwrap();
        assert_eq!(bob.open("alice", &sealed).unwrap(), b"");
    }

    #[test]
    fn flipped_bit_is_tampered_not_garbage() {
        let (alice, mut bob) = paired_managers();

        let mut sealed = alice.seal("bob", b"payload", [2; NONCE_SIZE]).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        assert!(matches!(
            bob.open("alice", &sealed),
            Err(SessionError::TamperedMessage { .. })
        ));
    }

    #[test]
    fn truncated_frame_is_tampered() {
        let (_, mut bob) = paired_managers();
        assert!(matches!(
            bob.open("alice", &[0u8; NONCE_SIZE]),
            Err(SessionError::TamperedMessage { .. })
        ));
    }

    #[test]
    fn seal_without_session_fails() {
        let alice = SessionManager::new(IdentityKeys::from_seeds([1; 32], [1; 32]));
        assert!(matches!(
            alice.seal("stranger", b"hi", [0; NONCE_SIZE]),
            Err(SessionError::SessionNotEstablished { .. })
        ));
    }

    #[test]
    fn replayed_nonce_rejected() {
        let (alice, mut bob) = paired_managers();

        let sealed = alice.seal("bob", b"once", [9; NONCE_SIZE]).unwrap();
        assert!(bob.open("alice", &sealed).is_ok());
        assert!(matches!(bob.open("alice", &sealed), Err(SessionError::ReplayedNonce { .. })));
    }

    #[test]
    fn paired_sessions_share_the_same_secret() {
        let (alice, bob) = paired_managers();
        let ours = alice.shared_secret("bob").unwrap();
        let theirs = bob.shared_secret("alice").unwrap();
        assert_eq!(*ours, *theirs);
        assert!(alice.shared_secret("stranger").is_none());
    }

    #[test]
    fn regenerate_destroys_sessions_and_bumps_generation() {
        let (mut alice, _) = paired_managers();
        assert!(alice.has_session("bob"));
        assert_eq!(alice.generation(), 1);

        let generation = alice.regenerate_identity([0x33; 32], [0x44; 32]);

        assert_eq!(generation, 2);
        assert!(!alice.has_session("bob"));
        assert!(matches!(
            alice.seal("bob", b"hi", [0; NONCE_SIZE]),
            Err(SessionError::SessionNotEstablished { .. })
        ));
    }

    #[test]
    fn clear_sessions_keeps_identity() {
        let (mut alice, _) = paired_managers();
        let tag = alice.identity().public_tag();

        alice.clear_sessions();

        assert!(!alice.has_session("bob"));
        assert_eq!(alice.identity().public_tag(), tag);
        assert_eq!(alice.generation(), 1);
    }

    #[test]
    fn reestablish_resets_replay_guard() {
        let (alice, mut bob) = paired_managers();

        let sealed = alice.seal("bob", b"m", [5; NONCE_SIZE]).unwrap();
        assert!(bob.open("alice", &sealed).is_ok());

        bob.establish("alice", &alice.identity().exchange_public()).unwrap();
        assert!(bob.open("alice", &sealed).is_ok());
    }

    #[test]
    fn invalid_public_key_length_rejected() {
        let mut alice = SessionManager::new(IdentityKeys::from_seeds([1; 32], [1; 32]));
        assert!(matches!(
            alice.establish("bob", &[0u8; 31]),
            Err(SessionError::InvalidPublicKey { expected: 32, actual: 31 })
        ));
    }
}
