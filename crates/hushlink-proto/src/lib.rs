//! Hushlink Wire Protocol
//!
//! Text-level multiplexing and JSON control messages exchanged over an
//! established pairwise channel. Framing is owned by the transport; this
//! crate only decides what a decrypted text frame *is*.
//!
//! # Multiplexing
//!
//! After session decryption, a frame is classified by exact, case-sensitive
//! prefix match before falling back to plain chat text:
//!
//! ```text
//! ginv:  group invitation control message
//! gmsg:  group data envelope
//! gsyn:  group sync control (clock summary / gap repair / sender keys)
//! typ:   typing indicator (payload "1" / "0")
//! rcpt:  delivery receipt (payload "d" / "r")
//! else   plain chat text
//! ```
//!
//! These prefixes are interop-critical: other client implementations match
//! them bit-for-bit. Changing one is a protocol break.
//!
//! # Invariants
//!
//! - A matched prefix never falls through to chat, even with a malformed
//!   payload (malformed payloads are errors, not chat).
//! - Round-trip encoding of every control message produces an equal value.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod error;
mod messages;
mod wire;

pub use error::ProtocolError;
pub use messages::{
    ClockSummary, GapRepairRequest, GroupControl, GroupEnvelope, GroupInvite, Handshake,
    SenderKeyDistribution, WireMember,
};
pub use wire::{
    GROUP_DATA_PREFIX, GROUP_INVITE_PREFIX, GROUP_SYNC_PREFIX, RECEIPT_PREFIX, ReceiptKind,
    TYPING_PREFIX, WireText, classify, receipt_frame, typing_frame,
};
