//! JSON control messages.
//!
//! Every message has an explicit wire encoder pairing it with its prefix
//! (where it travels inside the multiplexed text channel) and a decoder for
//! the payload text handed back by [`crate::classify`].
//!
//! Binary fields (keys, ciphertexts) travel base64-encoded so the whole
//! frame stays valid UTF-8 text.

use std::collections::BTreeMap;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};

use crate::{
    error::ProtocolError,
    wire::{GROUP_DATA_PREFIX, GROUP_INVITE_PREFIX, GROUP_SYNC_PREFIX},
};

/// Key-exchange handshake, sent as the first frame after channel open.
///
/// This is the only message exchanged before a session exists, so it is
/// plain JSON rather than a prefixed encrypted frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// X25519 exchange public key, base64.
    pub public_key: String,
    /// Sender's stable identity tag (survives key rotation).
    pub stable_id: String,
    /// Sender's display name.
    pub display_name: String,
    /// Sender's identity generation at send time. A handshake completed
    /// against an older generation must be rejected.
    pub generation: u64,
}

impl Handshake {
    /// Encode to a JSON frame.
    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from a JSON frame.
    pub fn from_frame(frame: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(frame)?)
    }
}

/// A group member as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMember {
    /// Stable device identifier.
    pub device_id: String,
    /// Display name.
    pub display_name: String,
    /// X25519 exchange public key, base64.
    pub public_key: String,
}

/// Group invitation, sent behind `ginv:` over the pairwise session.
///
/// Carries the full roster plus the current sender key of every member so
/// the invitee can decrypt group traffic from the moment it joins. History
/// sealed before the invitation remains unreadable (keys only, no
/// retroactive access).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInvite {
    /// Group identifier.
    pub group_id: String,
    /// Group display name.
    pub name: String,
    /// Current members, including the inviter.
    pub members: Vec<WireMember>,
    /// `device_id -> base64 sender key` for all current members.
    pub sender_keys: BTreeMap<String, String>,
}

impl GroupInvite {
    /// Encode to a prefixed wire frame.
    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        Ok(format!("{GROUP_INVITE_PREFIX}{}", serde_json::to_string(self)?))
    }

    /// Decode from the payload text after the `ginv:` prefix.
    pub fn from_payload(payload: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// Group data envelope, sent behind `gmsg:`.
///
/// The payload is sealed under the author's sender key; the envelope
/// itself travels over pairwise sessions between connected members and may
/// be relayed along multiple paths, so receivers must apply it
/// idempotently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEnvelope {
    /// Group identifier.
    pub group_id: String,
    /// Author device id (selects the sender key for opening).
    pub author_device_id: String,
    /// Author-assigned sequence number, strictly increasing per author.
    pub sequence_number: u64,
    /// Author's causal clock at send time, for gap detection.
    pub clock: BTreeMap<String, u64>,
    /// Sender-key ciphertext, base64.
    pub payload: String,
}

impl GroupEnvelope {
    /// Build an envelope from sealed bytes.
    pub fn new(
        group_id: String,
        author_device_id: String,
        sequence_number: u64,
        clock: BTreeMap<String, u64>,
        sealed: &[u8],
    ) -> Self {
        Self {
            group_id,
            author_device_id,
            sequence_number,
            clock,
            payload: BASE64.encode(sealed),
        }
    }

    /// The sealed bytes carried by this envelope.
    pub fn sealed_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(BASE64.decode(&self.payload)?)
    }

    /// Encode to a prefixed wire frame.
    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        Ok(format!("{GROUP_DATA_PREFIX}{}", serde_json::to_string(self)?))
    }

    /// Decode from the payload text after the `gmsg:` prefix.
    pub fn from_payload(payload: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// Sender-key distribution to a newly added member.
///
/// Sealed under the pairwise session to that member; never sent in the
/// clear and never broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyDistribution {
    /// Group the keys belong to.
    pub group_id: String,
    /// The member these keys are for.
    pub member_id: String,
    /// `device_id -> base64 sender key` for all current members.
    pub sender_keys: BTreeMap<String, String>,
}

/// A peer's view of a group clock, exchanged on reconnect to drive sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockSummary {
    /// Group identifier.
    pub group_id: String,
    /// `device_id -> highest sequence seen`.
    pub clock: BTreeMap<String, u64>,
}

/// Request for messages the sender is missing, per author device.
///
/// Ranges are inclusive `(from, to)` pairs. Sequence 0 is never valid and
/// ranges beyond what the serving peer has itself seen are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapRepairRequest {
    /// Group identifier.
    pub group_id: String,
    /// `device_id -> (first missing, last missing)`, both inclusive.
    pub ranges: BTreeMap<String, (u64, u64)>,
}

/// Group sync control message, sent behind `gsyn:`.
///
/// Exchanged between members over pairwise sessions: a clock summary
/// advertises what the sender has seen, a repair request asks for the
/// messages the sender is missing, and a key distribution carries sender
/// keys (a new member announces its own key this way).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GroupControl {
    /// The sender's current clock for a group.
    Summary(ClockSummary),
    /// Messages the sender wants re-sent.
    Repair(GapRepairRequest),
    /// Sender keys for group members.
    Keys(SenderKeyDistribution),
}

impl GroupControl {
    /// Encode to a prefixed wire frame.
    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        Ok(format!("{GROUP_SYNC_PREFIX}{}", serde_json::to_string(self)?))
    }

    /// Decode from the payload text after the `gsyn:` prefix.
    pub fn from_payload(payload: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(payload)?)
    }
}
