//! Hushlink Cryptographic Primitives
//!
//! Cryptographic building blocks for Hushlink. Pure functions with
//! deterministic outputs. Callers provide random bytes (seeds, nonces) for
//! deterministic testing.
//!
//! # Key Lifecycle
//!
//! The local device owns one long-term identity (an Ed25519 signing pair
//! plus an X25519 exchange pair). Every pairwise connection derives a
//! session key from a fresh handshake:
//!
//! ```text
//! X25519 identity keys (A, B)
//!         │
//!         ▼
//! Diffie-Hellman shared secret
//!         │
//!         ▼
//! HKDF-SHA256 → 32-byte session key
//!         │
//!         ▼
//! ChaCha20-Poly1305 AEAD → pairwise ciphertext
//! ```
//!
//! Group traffic is sealed under per-(group, author) sender keys
//! distributed over pairwise sessions; see [`GroupKeyStore`].
//!
//! # Security
//!
//! - Identity rotation destroys every pairwise session atomically; a
//!   generation counter lets in-flight handshakes detect rotation.
//! - Decryption fails closed: an authentication failure yields an error
//!   and zero plaintext.
//! - Rendezvous tokens reveal nothing about the pair to the relay; both
//!   sides derive them independently from sorted identity material and a
//!   UTC period marker.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod error;
pub mod identity;
pub mod rendezvous;
pub mod sender_key;
pub mod session;

pub use error::{SenderKeyError, SessionError};
pub use identity::IdentityKeys;
pub use sender_key::{GroupKeyStore, SENDER_KEY_SIZE};
pub use session::{NONCE_SIZE, SessionManager};
