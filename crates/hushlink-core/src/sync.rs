//! Per-group synchronization engine.
//!
//! [`GroupSync`] combines the group roster, a causal clock, and the
//! sender-key store into one engine: outgoing messages are stamped and
//! sealed, incoming envelopes are applied idempotently, and clock
//! summaries exchanged on reconnect drive gap repair.
//!
//! Envelopes may arrive over multiple pairwise paths (every connected
//! member relays), so duplicate application must be a silent no-op, never
//! an error.
//!
//! # Invariants
//!
//! - The local sequence number advances exactly once per sent message.
//! - Duplicate detection is per `(author, sequence)` against the
//!   envelope cache: a cached envelope is a silent no-op, an unseen one
//!   always applies, even when it arrives out of order.
//! - Applying an envelope advances only the author's clock entry. A
//!   relayed envelope clock claims the author saw other members'
//!   messages; it proves nothing about what the local device holds.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use hushlink_crypto::{GroupKeyStore, NONCE_SIZE, SENDER_KEY_SIZE};
use hushlink_proto::{
    ClockSummary, GapRepairRequest, GroupEnvelope, GroupInvite, SenderKeyDistribution, WireMember,
};

use crate::clock::CausalClock;
use crate::error::SyncError;
use crate::group::{Group, GroupMember};

/// A decrypted, clock-stamped group message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMessage {
    /// Group the message belongs to.
    pub group_id: String,
    /// Authoring device.
    pub author_device_id: String,
    /// Author-assigned sequence number.
    pub sequence_number: u64,
    /// Author's clock at send time; used for display ordering.
    pub clock: CausalClock,
    /// Decrypted payload.
    pub content: Vec<u8>,
}

/// Outcome of applying an incoming envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// First delivery; the decrypted message.
    New(GroupMessage),
    /// Already in the envelope cache. Nothing changed.
    Duplicate,
}

/// Synchronization engine for one group.
pub struct GroupSync {
    group: Group,
    clock: CausalClock,
    keys: GroupKeyStore,
    /// Envelopes sent or applied, kept to serve gap repair.
    envelopes: std::collections::BTreeMap<(String, u64), GroupEnvelope>,
}

impl GroupSync {
    /// Engine for a group the local device created or already belongs
    /// to, with a fresh own sender key.
    pub fn new(group: Group, own_key: [u8; SENDER_KEY_SIZE]) -> Self {
        let mut keys = GroupKeyStore::new();
        keys.set_own_key(&group.id, own_key);
        Self {
            group,
            clock: CausalClock::new(),
            keys,
            envelopes: std::collections::BTreeMap::new(),
        }
    }

    /// Engine built from a received invitation.
    ///
    /// Installs every distributed sender key. The invitee must appear in
    /// the invitation roster; history sealed before the invitation stays
    /// unreadable.
    ///
    /// # Errors
    ///
    /// - [`SyncError::UnknownMember`] if `self_device_id` is not in the
    ///   roster.
    /// - [`SyncError::Protocol`] on undecodable key material.
    pub fn from_invite(
        invite: &GroupInvite,
        self_device_id: &str,
        own_key: [u8; SENDER_KEY_SIZE],
        now: DateTime<Utc>,
    ) -> Result<Self, SyncError> {
        if !invite.members.iter().any(|m| m.device_id == self_device_id) {
            return Err(SyncError::UnknownMember {
                group_id: invite.group_id.clone(),
                device_id: self_device_id.to_owned(),
            });
        }

        let members = invite
            .members
            .iter()
            .map(|m| {
                let public_key = decode_public_key(&m.public_key)?;
                Ok(GroupMember {
                    device_id: m.device_id.clone(),
                    display_name: m.display_name.clone(),
                    public_key,
                    joined_at: now,
                })
            })
            .collect::<Result<Vec<_>, SyncError>>()?;

        let group = Group {
            id: invite.group_id.clone(),
            name: invite.name.clone(),
            self_device_id: self_device_id.to_owned(),
            members,
            created_at: now,
            created_by: String::new(),
        };

        let mut sync = Self::new(group, own_key);
        for (device_id, encoded) in &invite.sender_keys {
            if device_id == self_device_id {
                continue;
            }
            let key = BASE64.decode(encoded).map_err(hushlink_proto::ProtocolError::from)?;
            sync.keys.install_peer_key(&sync.group.id, device_id, &key)?;
        }
        Ok(sync)
    }

    /// The group roster.
    pub fn group(&self) -> &Group {
        &self.group
    }

    /// The local clock: highest sequence sent or received per author.
    pub fn clock(&self) -> &CausalClock {
        &self.clock
    }

    /// Stamp, seal, and envelope an outgoing message.
    ///
    /// Returns the wire envelope plus the plaintext record for local
    /// display and storage.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SenderKey`] if the own key is missing.
    pub fn send(
        &mut self,
        content: &[u8],
        nonce: [u8; NONCE_SIZE],
    ) -> Result<(GroupEnvelope, GroupMessage), SyncError> {
        let author = self.group.self_device_id.clone();
        let sealed = self.keys.seal(&self.group.id, content, nonce)?;

        self.clock = self.clock.increment(&author);
        let sequence_number = self.clock.get(&author);

        let envelope = GroupEnvelope::new(
            self.group.id.clone(),
            author.clone(),
            sequence_number,
            self.clock.entries().clone(),
            &sealed,
        );
        let message = GroupMessage {
            group_id: self.group.id.clone(),
            author_device_id: author.clone(),
            sequence_number,
            clock: self.clock.clone(),
            content: content.to_vec(),
        };
        self.envelopes.insert((author, sequence_number), envelope.clone());
        Ok((envelope, message))
    }

    /// Apply an incoming envelope.
    ///
    /// Idempotent: an `(author, sequence)` pair already in the envelope
    /// cache returns [`Applied::Duplicate`] without touching any state.
    /// An unseen pair always applies, even below the author's current
    /// clock entry, so out-of-order and relayed deliveries never lose a
    /// message. Only the author's clock entry advances.
    ///
    /// # Errors
    ///
    /// - [`SyncError::UnknownMember`] for authors outside the roster.
    /// - [`SyncError::OutOfRangeSequence`] for sequence 0.
    /// - [`SyncError::SenderKey`] on missing keys or tampering; a
    ///   tampered envelope changes nothing.
    pub fn apply(&mut self, envelope: &GroupEnvelope) -> Result<Applied, SyncError> {
        let author = &envelope.author_device_id;
        if !self.group.has_member(author) {
            return Err(SyncError::UnknownMember {
                group_id: self.group.id.clone(),
                device_id: author.clone(),
            });
        }
        if envelope.sequence_number == 0 {
            return Err(SyncError::OutOfRangeSequence {
                device_id: author.clone(),
                from: 0,
                to: 0,
                max: self.clock.get(author),
            });
        }

        if self.envelopes.contains_key(&(author.clone(), envelope.sequence_number)) {
            return Ok(Applied::Duplicate);
        }

        let sealed = envelope.sealed_bytes()?;
        let content = self.keys.open(&self.group.id, author, &sealed)?;

        let observed = CausalClock::from_entries(
            [(author.clone(), envelope.sequence_number)].into_iter().collect(),
        );
        self.clock = self.clock.merge(&observed);

        // Display clock keeps the author's full view, floored at its own
        // sequence in case a sparse envelope clock omitted it.
        let mut remote = CausalClock::from_entries(envelope.clock.clone());
        if remote.get(author) < envelope.sequence_number {
            remote = remote.merge(&observed);
        }
        self.envelopes.insert((author.clone(), envelope.sequence_number), envelope.clone());

        Ok(Applied::New(GroupMessage {
            group_id: envelope.group_id.clone(),
            author_device_id: author.clone(),
            sequence_number: envelope.sequence_number,
            clock: remote,
            content,
        }))
    }

    /// Add a member and produce the key distribution for it.
    ///
    /// The distribution carries every current sender key (own included)
    /// and must be sealed by the caller over the pairwise session to the
    /// new member. Adding an existing member returns `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::GroupFull`] at the member cap.
    pub fn add_member(
        &mut self,
        member: GroupMember,
    ) -> Result<Option<SenderKeyDistribution>, SyncError> {
        let member_id = member.device_id.clone();
        if !self.group.add_member(member)? {
            return Ok(None);
        }
        Ok(Some(SenderKeyDistribution {
            group_id: self.group.id.clone(),
            member_id,
            sender_keys: self.encoded_keys(),
        }))
    }

    /// Install a member's sender key received via invite or distribution.
    ///
    /// # Errors
    ///
    /// - [`SyncError::UnknownMember`] for devices outside the roster.
    /// - [`SyncError::SenderKey`] on a wrong-length key.
    pub fn install_member_key(&mut self, device_id: &str, key: &[u8]) -> Result<(), SyncError> {
        if !self.group.has_member(device_id) {
            return Err(SyncError::UnknownMember {
                group_id: self.group.id.clone(),
                device_id: device_id.to_owned(),
            });
        }
        self.keys.install_peer_key(&self.group.id, device_id, key)?;
        Ok(())
    }

    /// Build the invitation frame payload for a prospective member.
    ///
    /// Call after [`GroupSync::add_member`] so the roster already
    /// contains the invitee.
    pub fn invite(&self) -> GroupInvite {
        GroupInvite {
            group_id: self.group.id.clone(),
            name: self.group.name.clone(),
            members: self
                .group
                .members
                .iter()
                .map(|m| WireMember {
                    device_id: m.device_id.clone(),
                    display_name: m.display_name.clone(),
                    public_key: m.public_key.map(|k| BASE64.encode(k)).unwrap_or_default(),
                })
                .collect(),
            sender_keys: self.encoded_keys(),
        }
    }

    /// The local clock as a wire summary, exchanged on reconnect.
    pub fn clock_summary(&self) -> ClockSummary {
        ClockSummary { group_id: self.group.id.clone(), clock: self.clock.entries().clone() }
    }

    /// Compute a repair request from a peer's clock summary.
    ///
    /// Ranges come from the envelope cache, not the clock: an author the
    /// local clock covers may still have holes below its entry when
    /// envelopes arrived out of order. Returns `None` when the cache
    /// holds everything the summary claims.
    pub fn gap_request(&self, remote: &ClockSummary) -> Option<GapRepairRequest> {
        let mut ranges = std::collections::BTreeMap::new();
        for (device_id, remote_seq) in &remote.clock {
            if device_id == &self.group.self_device_id || *remote_seq == 0 {
                continue;
            }
            if let Some(from) = self.first_missing(device_id, *remote_seq) {
                ranges.insert(device_id.clone(), (from, *remote_seq));
            }
        }
        if ranges.is_empty() {
            return None;
        }
        Some(GapRepairRequest { group_id: self.group.id.clone(), ranges })
    }

    /// Lowest sequence in `1..=upto` absent from the envelope cache.
    fn first_missing(&self, device_id: &str, upto: u64) -> Option<u64> {
        let mut expected = 1;
        let range = (device_id.to_owned(), 1)..=(device_id.to_owned(), upto);
        for (_, sequence) in self.envelopes.range(range).map(|(key, _)| key) {
            if *sequence != expected {
                break;
            }
            expected += 1;
        }
        (expected <= upto).then_some(expected)
    }

    /// Validate an incoming repair request against the local clock.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::OutOfRangeSequence`] for sequence 0, inverted
    /// ranges, or ranges beyond what the local clock has seen. A peer
    /// asking for messages nobody sent is either buggy or probing.
    pub fn validate_gap_request(&self, request: &GapRepairRequest) -> Result<(), SyncError> {
        for (device_id, (from, to)) in &request.ranges {
            let max = self.clock.get(device_id);
            if *from == 0 || to < from || *to > max {
                return Err(SyncError::OutOfRangeSequence {
                    device_id: device_id.clone(),
                    from: *from,
                    to: *to,
                    max,
                });
            }
        }
        Ok(())
    }

    /// Serve a validated repair request from the envelope cache.
    ///
    /// Envelopes the cache no longer holds are silently skipped; the
    /// requester repeats the request against another member.
    ///
    /// # Errors
    ///
    /// Same validation as [`GroupSync::validate_gap_request`].
    pub fn serve_gap_request(
        &self,
        request: &GapRepairRequest,
    ) -> Result<Vec<GroupEnvelope>, SyncError> {
        self.validate_gap_request(request)?;

        let mut served = Vec::new();
        for (device_id, (from, to)) in &request.ranges {
            for sequence in *from..=*to {
                if let Some(envelope) = self.envelopes.get(&(device_id.clone(), sequence)) {
                    served.push(envelope.clone());
                }
            }
        }
        Ok(served)
    }

    fn encoded_keys(&self) -> std::collections::BTreeMap<String, String> {
        let mut keys: std::collections::BTreeMap<String, String> = self
            .keys
            .peer_keys(&self.group.id)
            .into_iter()
            .map(|(device, key)| (device, BASE64.encode(key)))
            .collect();
        if let Some(own) = self.keys.own_key(&self.group.id) {
            keys.insert(self.group.self_device_id.clone(), BASE64.encode(own));
        }
        keys
    }
}

fn decode_public_key(encoded: &str) -> Result<Option<[u8; 32]>, SyncError> {
    if encoded.is_empty() {
        return Ok(None);
    }
    let bytes = BASE64.decode(encoded).map_err(hushlink_proto::ProtocolError::from)?;
    let key: [u8; 32] = bytes
        .try_into()
        .map_err(|_| SyncError::Protocol("member public key must be 32 bytes".to_owned()))?;
    Ok(Some(key))
}

/// Sort messages into deterministic display order.
///
/// Causal order where clocks are comparable; concurrent messages break
/// ties by author device id, then sequence number, so every member
/// renders the same transcript.
pub fn sort_for_display(messages: &mut [GroupMessage]) {
    messages.sort_by(|a, b| {
        crate::clock::causal_order(&a.clock, &a.author_device_id, &b.clock, &b.author_device_id)
            .then(a.sequence_number.cmp(&b.sequence_number))
    });
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    const NONCE: [u8; NONCE_SIZE] = [3; NONCE_SIZE];

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).single().unwrap()
    }

    fn member(device_id: &str) -> GroupMember {
        GroupMember {
            device_id: device_id.to_owned(),
            display_name: device_id.to_owned(),
            public_key: Some([9; 32]),
            joined_at: now(),
        }
    }

    /// Two engines for the same group, keys exchanged.
    fn paired_engines() -> (GroupSync, GroupSync) {
        let mut alice =
            GroupSync::new(Group::new("g1", "lounge", "dev-alice", "alice", now()), [0xA1; 32]);
        let mut bob =
            GroupSync::new(Group::new("g1", "lounge", "dev-bob", "bob", now()), [0xB2; 32]);

        alice.add_member(member("dev-bob")).unwrap();
        bob.add_member(member("dev-alice")).unwrap();
        alice.install_member_key("dev-bob", &[0xB2; 32]).unwrap();
        bob.install_member_key("dev-alice", &[0xA1; 32]).unwrap();
        (alice, bob)
    }

    #[test]
    fn send_stamps_increasing_sequence_numbers() {
        let (mut alice, _) = paired_engines();

        let (env1, msg1) = alice.send(b"one", NONCE).unwrap();
        let (env2, msg2) = alice.send(b"two", [4; NONCE_SIZE]).unwrap();

        assert_eq!(env1.sequence_number, 1);
        assert_eq!(env2.sequence_number, 2);
        assert_eq!(msg1.content, b"one");
        assert_eq!(msg2.clock.get("dev-alice"), 2);
    }

    #[test]
    fn apply_decrypts_and_advances_author_clock() {
        let (mut alice, mut bob) = paired_engines();

        let (envelope, _) = alice.send(b"hello group", NONCE).unwrap();
        let Applied::New(message) = bob.apply(&envelope).unwrap() else {
            panic!("expected first delivery");
        };

        assert_eq!(message.content, b"hello group");
        assert_eq!(message.author_device_id, "dev-alice");
        assert_eq!(bob.clock().get("dev-alice"), 1);
    }

    #[test]
    fn duplicate_envelope_is_a_noop() {
        let (mut alice, mut bob) = paired_engines();

        let (envelope, _) = alice.send(b"once", NONCE).unwrap();
        assert!(matches!(bob.apply(&envelope).unwrap(), Applied::New(_)));

        // Same envelope again, as if relayed along a second path.
        let clock_before = bob.clock().clone();
        assert_eq!(bob.apply(&envelope).unwrap(), Applied::Duplicate);
        assert_eq!(bob.clock(), &clock_before);
    }

    #[test]
    fn own_envelope_comes_back_as_duplicate() {
        let (mut alice, _) = paired_engines();
        let (envelope, _) = alice.send(b"mine", NONCE).unwrap();
        assert_eq!(alice.apply(&envelope).unwrap(), Applied::Duplicate);
    }

    #[test]
    fn envelope_from_non_member_is_rejected() {
        let (mut alice, _) = paired_engines();
        let envelope = GroupEnvelope::new(
            "g1".to_owned(),
            "dev-mallory".to_owned(),
            1,
            std::collections::BTreeMap::new(),
            b"x",
        );
        assert!(matches!(alice.apply(&envelope), Err(SyncError::UnknownMember { .. })));
    }

    #[test]
    fn sequence_zero_is_rejected() {
        let (mut alice, _) = paired_engines();
        let envelope = GroupEnvelope::new(
            "g1".to_owned(),
            "dev-bob".to_owned(),
            0,
            std::collections::BTreeMap::new(),
            b"x",
        );
        assert!(matches!(alice.apply(&envelope), Err(SyncError::OutOfRangeSequence { .. })));
    }

    #[test]
    fn tampered_envelope_leaves_clock_untouched() {
        let (mut alice, mut bob) = paired_engines();
        let (envelope, _) = alice.send(b"intact", NONCE).unwrap();

        let sealed = envelope.sealed_bytes().unwrap();
        let mut corrupted = sealed.clone();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0x01;
        let forged = GroupEnvelope::new(
            envelope.group_id.clone(),
            envelope.author_device_id.clone(),
            envelope.sequence_number,
            envelope.clock.clone(),
            &corrupted,
        );

        let err = bob.apply(&forged).unwrap_err();
        assert!(err.is_security_relevant());
        assert_eq!(bob.clock().get("dev-alice"), 0);

        // The genuine envelope still applies.
        assert!(matches!(bob.apply(&envelope).unwrap(), Applied::New(_)));
    }

    #[test]
    fn invite_roundtrip_lets_new_member_decrypt() {
        let (mut alice, _) = paired_engines();
        alice.add_member(member("dev-carol")).unwrap();
        let invite = alice.invite();

        let mut carol = GroupSync::from_invite(&invite, "dev-carol", [0xC3; 32], now()).unwrap();

        let (envelope, _) = alice.send(b"welcome carol", NONCE).unwrap();
        let Applied::New(message) = carol.apply(&envelope).unwrap() else {
            panic!("expected first delivery");
        };
        assert_eq!(message.content, b"welcome carol");
    }

    #[test]
    fn invite_without_self_in_roster_is_rejected() {
        let (alice, _) = paired_engines();
        let invite = alice.invite();
        assert!(matches!(
            GroupSync::from_invite(&invite, "dev-outsider", [0; 32], now()),
            Err(SyncError::UnknownMember { .. })
        ));
    }

    #[test]
    fn add_member_produces_distribution_once() {
        let (mut alice, _) = paired_engines();

        let dist = alice.add_member(member("dev-carol")).unwrap().unwrap();
        assert_eq!(dist.member_id, "dev-carol");
        assert!(dist.sender_keys.contains_key("dev-alice"));
        assert!(dist.sender_keys.contains_key("dev-bob"));

        // Re-adding is idempotent and distributes nothing.
        assert!(alice.add_member(member("dev-carol")).unwrap().is_none());
    }

    #[test]
    fn gap_request_covers_exactly_the_missing_ranges() {
        let (mut alice, mut bob) = paired_engines();

        // Alice sends three, bob sees only the first.
        let (e1, _) = alice.send(b"1", [1; NONCE_SIZE]).unwrap();
        let (_e2, _) = alice.send(b"2", [2; NONCE_SIZE]).unwrap();
        let (_e3, _) = alice.send(b"3", [3; NONCE_SIZE]).unwrap();
        bob.apply(&e1).unwrap();

        let request = bob.gap_request(&alice.clock_summary()).unwrap();
        assert_eq!(request.ranges.get("dev-alice"), Some(&(2, 3)));

        // Alice can serve the request.
        alice.validate_gap_request(&request).unwrap();
    }

    #[test]
    fn served_envelopes_repair_the_gap() {
        let (mut alice, mut bob) = paired_engines();

        let (e1, _) = alice.send(b"1", [1; NONCE_SIZE]).unwrap();
        alice.send(b"2", [2; NONCE_SIZE]).unwrap();
        alice.send(b"3", [3; NONCE_SIZE]).unwrap();
        bob.apply(&e1).unwrap();

        let request = bob.gap_request(&alice.clock_summary()).unwrap();
        let served = alice.serve_gap_request(&request).unwrap();
        assert_eq!(served.len(), 2);

        for envelope in &served {
            assert!(matches!(bob.apply(envelope).unwrap(), Applied::New(_)));
        }
        assert_eq!(bob.clock().get("dev-alice"), 3);
        assert!(bob.gap_request(&alice.clock_summary()).is_none());
    }

    /// Three engines for the same group, all keys exchanged.
    fn trio_engines() -> (GroupSync, GroupSync, GroupSync) {
        let mut alice =
            GroupSync::new(Group::new("g1", "lounge", "dev-alice", "alice", now()), [0xA1; 32]);
        let mut bob =
            GroupSync::new(Group::new("g1", "lounge", "dev-bob", "bob", now()), [0xB2; 32]);
        let mut carol =
            GroupSync::new(Group::new("g1", "lounge", "dev-carol", "carol", now()), [0xC3; 32]);

        let keys = [("dev-alice", [0xA1; 32]), ("dev-bob", [0xB2; 32]), ("dev-carol", [0xC3; 32])];
        for (engine, self_id) in
            [(&mut alice, "dev-alice"), (&mut bob, "dev-bob"), (&mut carol, "dev-carol")]
        {
            for &(device_id, key) in &keys {
                if device_id == self_id {
                    continue;
                }
                engine.add_member(member(device_id)).unwrap();
                engine.install_member_key(device_id, &key).unwrap();
            }
        }
        (alice, bob, carol)
    }

    #[test]
    fn out_of_order_arrival_still_delivers_the_earlier_message() {
        let (mut alice, mut bob) = paired_engines();
        let (e1, _) = alice.send(b"first", [1; NONCE_SIZE]).unwrap();
        let (e2, _) = alice.send(b"second", [2; NONCE_SIZE]).unwrap();

        assert!(matches!(bob.apply(&e2).unwrap(), Applied::New(_)));
        let Applied::New(message) = bob.apply(&e1).unwrap() else {
            panic!("expected first delivery");
        };
        assert_eq!(message.content, b"first");
        assert_eq!(bob.clock().get("dev-alice"), 2);
    }

    #[test]
    fn reordered_delivery_leaves_the_hole_visible_to_gap_repair() {
        let (mut alice, mut bob) = paired_engines();
        alice.send(b"first", [1; NONCE_SIZE]).unwrap();
        let (e2, _) = alice.send(b"second", [2; NONCE_SIZE]).unwrap();

        // Only the second message arrived; the clock covers sequence 2
        // but the cache has a hole at 1.
        bob.apply(&e2).unwrap();
        let request = bob.gap_request(&alice.clock_summary()).unwrap();
        assert_eq!(request.ranges.get("dev-alice"), Some(&(1, 2)));

        let served = alice.serve_gap_request(&request).unwrap();
        let outcomes: Vec<_> =
            served.iter().map(|envelope| bob.apply(envelope).unwrap()).collect();
        assert!(outcomes.iter().any(|o| matches!(o, Applied::New(_))));
        assert!(bob.gap_request(&alice.clock_summary()).is_none());
    }

    #[test]
    fn relayed_clock_entries_do_not_mask_missing_messages() {
        let (mut alice, mut bob, mut carol) = trio_engines();

        let (e1, _) = alice.send(b"one", [1; NONCE_SIZE]).unwrap();
        let (e2, _) = alice.send(b"two", [2; NONCE_SIZE]).unwrap();
        carol.apply(&e1).unwrap();
        carol.apply(&e2).unwrap();
        let (e3, _) = carol.send(b"three", [3; NONCE_SIZE]).unwrap();

        // Bob hears only carol; her envelope clock references alice's
        // messages he never received.
        assert!(matches!(bob.apply(&e3).unwrap(), Applied::New(_)));
        assert_eq!(bob.clock().get("dev-alice"), 0);

        // A direct relay of alice's first message still delivers.
        assert!(matches!(bob.apply(&e1).unwrap(), Applied::New(_)));

        // Gap repair against carol covers the rest.
        let request = bob.gap_request(&carol.clock_summary()).unwrap();
        assert_eq!(request.ranges.get("dev-alice"), Some(&(2, 2)));
        for envelope in carol.serve_gap_request(&request).unwrap() {
            bob.apply(&envelope).unwrap();
        }
        assert_eq!(bob.clock().get("dev-alice"), 2);
        assert!(bob.gap_request(&carol.clock_summary()).is_none());
    }

    #[test]
    fn relayed_envelopes_can_be_served_onward() {
        let (mut alice, mut bob) = paired_engines();

        // Bob caches what he applies and can serve it to a third path.
        let (envelope, _) = alice.send(b"relay me", NONCE).unwrap();
        bob.apply(&envelope).unwrap();

        let request = GapRepairRequest {
            group_id: "g1".to_owned(),
            ranges: [("dev-alice".to_owned(), (1, 1))].into_iter().collect(),
        };
        let served = bob.serve_gap_request(&request).unwrap();
        assert_eq!(served, vec![envelope]);
    }

    #[test]
    fn gap_request_is_none_when_caught_up() {
        let (mut alice, mut bob) = paired_engines();
        let (envelope, _) = alice.send(b"only", NONCE).unwrap();
        bob.apply(&envelope).unwrap();

        assert!(bob.gap_request(&alice.clock_summary()).is_none());
    }

    #[test]
    fn gap_request_beyond_local_clock_is_rejected() {
        let (mut alice, _) = paired_engines();
        alice.send(b"one", NONCE).unwrap();

        let request = GapRepairRequest {
            group_id: "g1".to_owned(),
            ranges: [("dev-alice".to_owned(), (1, 9))].into_iter().collect(),
        };
        assert!(matches!(
            alice.validate_gap_request(&request),
            Err(SyncError::OutOfRangeSequence { max: 1, .. })
        ));
    }

    #[test]
    fn gap_request_with_sequence_zero_is_rejected() {
        let (alice, _) = paired_engines();
        let request = GapRepairRequest {
            group_id: "g1".to_owned(),
            ranges: [("dev-alice".to_owned(), (0, 1))].into_iter().collect(),
        };
        assert!(matches!(
            alice.validate_gap_request(&request),
            Err(SyncError::OutOfRangeSequence { from: 0, .. })
        ));
    }

    #[test]
    fn concurrent_messages_display_in_author_order() {
        let (mut alice, mut bob) = paired_engines();

        // Both send without seeing each other: concurrent clocks.
        let (_, alice_msg) = alice.send(b"from alice", [1; NONCE_SIZE]).unwrap();
        let (_, bob_msg) = bob.send(b"from bob", [2; NONCE_SIZE]).unwrap();

        let mut transcript = vec![bob_msg.clone(), alice_msg.clone()];
        sort_for_display(&mut transcript);
        assert_eq!(transcript[0].author_device_id, "dev-alice");
        assert_eq!(transcript[1].author_device_id, "dev-bob");
    }

    #[test]
    fn causal_messages_display_in_causal_order() {
        let (mut alice, mut bob) = paired_engines();

        let (envelope, alice_msg) = alice.send(b"first", [1; NONCE_SIZE]).unwrap();
        bob.apply(&envelope).unwrap();
        // Bob replies after seeing alice's message.
        let (_, bob_msg) = bob.send(b"reply", [2; NONCE_SIZE]).unwrap();

        let mut transcript = vec![bob_msg, alice_msg];
        sort_for_display(&mut transcript);
        assert_eq!(transcript[0].content, b"first");
        assert_eq!(transcript[1].content, b"reply");
    }
}
