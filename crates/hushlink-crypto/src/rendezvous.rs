//! Rendezvous token derivation.
//!
//! Two peers that know each other derive the same short-lived tokens
//! independently and use them as meeting points on an untrusted relay.
//! The relay sees only the tokens — never identities.
//!
//! Two families exist:
//!
//! - **Daily** tokens derive from the pair's identity material (exchange
//!   public keys, or stable tags after a key rotation) plus a UTC day
//!   marker. No shared secret required.
//! - **Hourly** tokens derive from an established shared secret plus a
//!   UTC hour marker, for finer-grained presence between peers that have
//!   already paired.
//!
//! Every derivation returns three tokens centered on "now" — previous,
//! current, and next period — so peers whose clocks disagree by up to one
//! period still meet: the "tomorrow" token of a device that is behind
//! equals the "today" token of one that is ahead.
//!
//! All period arithmetic is UTC; local time would break the overlap
//! property across daylight-saving transitions.
//!
//! # Invariants
//!
//! - Derivation is symmetric: `tokens(a, b) == tokens(b, a)`. Identity
//!   inputs are sorted lexicographically before hashing.
//! - Key-derived and id-derived tokens use distinct salts and prefixes,
//!   so the two families can never collide for the same logical pair.
//! - Token strings are fixed reference vectors for interoperability with
//!   non-Rust clients; see the tests.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac as _};
use sha2::{Digest as _, Sha256};

/// Salt for daily tokens derived from exchange public keys.
const DAILY_KEY_SALT: &str = "hushlink:daily:key:";

/// Salt for daily tokens derived from stable identity tags.
const DAILY_ID_SALT: &str = "hushlink:daily:id:";

/// Salt for hourly tokens derived from a shared secret.
const HOURLY_SALT: &str = "hushlink:hourly:";

/// Prefix marking a key-derived daily token.
pub const DAILY_KEY_PREFIX: &str = "day_";

/// Prefix marking an id-derived daily token.
pub const DAILY_ID_PREFIX: &str = "did_";

/// Prefix marking an hourly token.
pub const HOURLY_PREFIX: &str = "hr_";

/// Encoded digest characters kept per token.
const TOKEN_LEN: usize = 22;

/// Period offsets for the skew window: previous, current, next.
const WINDOW: [i64; 3] = [-1, 0, 1];

fn encode_token(prefix: &str, digest: &[u8]) -> String {
    let mut encoded = URL_SAFE_NO_PAD.encode(digest);
    encoded.truncate(TOKEN_LEN);
    format!("{prefix}{encoded}")
}

/// Daily tokens for a pair of X25519 exchange public keys.
///
/// Returns `[previous, current, next]` UTC-day tokens. Symmetric in the
/// key arguments.
pub fn daily_tokens_for_keys(
    ours: &[u8; 32],
    theirs: &[u8; 32],
    now: DateTime<Utc>,
) -> [String; 3] {
    let (lo, hi) = if ours <= theirs { (ours, theirs) } else { (theirs, ours) };

    WINDOW.map(|offset| {
        let day = (now + Duration::days(offset)).format("%Y-%m-%d").to_string();
        let mut hasher = Sha256::new();
        hasher.update(lo);
        hasher.update(hi);
        hasher.update(DAILY_KEY_SALT.as_bytes());
        hasher.update(day.as_bytes());
        encode_token(DAILY_KEY_PREFIX, &hasher.finalize())
    })
}

/// Daily tokens for a pair of stable identity tags.
///
/// Tags survive key rotation, so this family lets a trusted contact be
/// found again after the peer regenerated its keys. Uses a derivation
/// domain distinct from [`daily_tokens_for_keys`].
pub fn daily_tokens_for_ids(ours: &str, theirs: &str, now: DateTime<Utc>) -> [String; 3] {
    let (lo, hi) = if ours <= theirs { (ours, theirs) } else { (theirs, ours) };

    WINDOW.map(|offset| {
        let day = (now + Duration::days(offset)).format("%Y-%m-%d").to_string();
        let mut hasher = Sha256::new();
        hasher.update(lo.as_bytes());
        hasher.update(hi.as_bytes());
        hasher.update(DAILY_ID_SALT.as_bytes());
        hasher.update(day.as_bytes());
        encode_token(DAILY_ID_PREFIX, &hasher.finalize())
    })
}

/// Hourly tokens for an established shared secret.
///
/// Returns `[previous, current, next]` UTC-hour tokens. Requires a
/// secret both sides already hold (e.g. the pairwise session key), so
/// only paired peers can compute this finer-grained family.
pub fn hourly_tokens(secret: &[u8], now: DateTime<Utc>) -> [String; 3] {
    WINDOW.map(|offset| {
        let hour = (now + Duration::hours(offset)).format("%Y-%m-%dT%H").to_string();
        let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret) else {
            unreachable!("HMAC-SHA256 accepts keys of any length");
        };
        mac.update(HOURLY_SALT.as_bytes());
        mac.update(hour.as_bytes());
        encode_token(HOURLY_PREFIX, &mac.finalize().into_bytes())
    })
}
