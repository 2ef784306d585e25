//! Long-term device identity.
//!
//! An identity couples an Ed25519 signing pair (authentication) with an
//! X25519 exchange pair (session key agreement). Both are built from
//! caller-provided 32-byte seeds so entropy sourcing stays outside this
//! crate.

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use sha2::{Digest as _, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

/// Number of uppercase hex characters in a public tag.
const TAG_LEN: usize = 16;

/// The local device's long-term keypair.
pub struct IdentityKeys {
    signing: SigningKey,
    exchange: StaticSecret,
}

impl IdentityKeys {
    /// Build an identity from two independent 32-byte seeds.
    ///
    /// Seeds MUST come from a cryptographically secure source in
    /// production; deterministic seeds are for tests only.
    pub fn from_seeds(signing_seed: [u8; 32], exchange_seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&signing_seed),
            exchange: StaticSecret::from(exchange_seed),
        }
    }

    /// Ed25519 verifying key for this identity.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// X25519 exchange public key bytes.
    pub fn exchange_public(&self) -> [u8; 32] {
        PublicKey::from(&self.exchange).to_bytes()
    }

    /// Borrow the exchange secret for Diffie-Hellman.
    pub(crate) fn exchange_secret(&self) -> &StaticSecret {
        &self.exchange
    }

    /// Sign a message with the identity signing key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    /// Verify a signature against a peer's verifying key.
    pub fn verify(
        public: &VerifyingKey,
        message: &[u8],
        signature: &Signature,
    ) -> Result<(), ed25519_dalek::SignatureError> {
        public.verify(message, signature)
    }

    /// Short public tag of this identity's exchange key.
    ///
    /// First 16 uppercase hex characters of SHA-256 over the raw public
    /// key bytes. Used as the durable peer identifier in contact storage
    /// and in id-derived rendezvous tokens.
    pub fn public_tag(&self) -> String {
        Self::tag_for_public(&self.exchange_public())
    }

    /// Derive the public tag for an arbitrary exchange public key.
    pub fn tag_for_public(public: &[u8; 32]) -> String {
        let digest = Sha256::digest(public);
        let mut tag = hex::encode(digest);
        tag.truncate(TAG_LEN);
        tag.to_ascii_uppercase()
    }
}

impl std::fmt::Debug for IdentityKeys {
    // Key material must never reach logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeys").field("tag", &self.public_tag()).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_identity() -> IdentityKeys {
        IdentityKeys::from_seeds([0x11; 32], [0x22; 32])
    }

    #[test]
    fn tag_reference_vector() {
        // SHA-256 of bytes 0x00..0x1f, hex upper, first 16 chars.
        let mut public = [0u8; 32];
        for (i, byte) in public.iter_mut().enumerate() {
            *byte = i as u8;
        }
        assert_eq!(IdentityKeys::tag_for_public(&public), "630DCD2966C43366");
    }

    #[test]
    fn tag_is_16_uppercase_hex_chars() {
        let tag = test_identity().public_tag();
        assert_eq!(tag.len(), 16);
        assert!(tag.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn sign_verify_roundtrip() {
        let id = test_identity();
        let sig = id.sign(b"handshake transcript");
        assert!(IdentityKeys::verify(&id.verifying_key(), b"handshake transcript", &sig).is_ok());
    }

    #[test]
    fn verify_rejects_wrong_message() {
        let id = test_identity();
        let sig = id.sign(b"original");
        assert!(IdentityKeys::verify(&id.verifying_key(), b"forged", &sig).is_err());
    }

    #[test]
    fn different_seeds_produce_different_identities() {
        let a = IdentityKeys::from_seeds([1; 32], [2; 32]);
        let b = IdentityKeys::from_seeds([3; 32], [4; 32]);
        assert_ne!(a.exchange_public(), b.exchange_public());
        assert_ne!(a.public_tag(), b.public_tag());
    }

    #[test]
    fn debug_does_not_leak_key_material() {
        let id = test_identity();
        let rendered = format!("{id:?}");
        assert!(rendered.contains(&id.public_tag()));
        assert!(!rendered.contains(&hex::encode(id.exchange_public())));
    }
}
