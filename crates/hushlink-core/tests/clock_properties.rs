//! Property-based tests for causal clocks and group sync.
//!
//! These tests verify the fundamental invariants:
//!
//! 1. **Merge laws**: merge is commutative, associative, idempotent, and
//!    entry-wise non-decreasing
//! 2. **Gap soundness**: `missing_from` never emits sequence 0 and its
//!    ranges always fit inside the ahead clock
//! 3. **Sync idempotence**: re-applying any envelope is a no-op

use std::collections::BTreeMap;

use chrono::{TimeZone as _, Utc};
use hushlink_core::clock::CausalClock;
use hushlink_core::group::Group;
use hushlink_core::sync::{Applied, GroupSync};
use proptest::prelude::*;

fn arb_clock() -> impl Strategy<Value = CausalClock> {
    prop::collection::btree_map("[a-d]", 0u64..50, 0..4)
        .prop_map(|entries: BTreeMap<String, u64>| CausalClock::from_entries(entries))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_merge_commutative(a in arb_clock(), b in arb_clock()) {
        prop_assert_eq!(a.merge(&b), b.merge(&a));
    }

    #[test]
    fn prop_merge_associative(a in arb_clock(), b in arb_clock(), c in arb_clock()) {
        prop_assert_eq!(a.merge(&b).merge(&c), a.merge(&b.merge(&c)));
    }

    #[test]
    fn prop_merge_idempotent(a in arb_clock()) {
        prop_assert_eq!(a.merge(&a), a);
    }

    #[test]
    fn prop_merge_never_decreases(a in arb_clock(), b in arb_clock()) {
        let merged = a.merge(&b);
        prop_assert!(a.is_before_or_equal(&merged));
        prop_assert!(b.is_before_or_equal(&merged));
    }

    #[test]
    fn prop_increment_strictly_advances(a in arb_clock(), device in "[a-d]") {
        let advanced = a.increment(&device);
        prop_assert_eq!(advanced.get(&device), a.get(&device) + 1);
        prop_assert!(a.is_before_or_equal(&advanced));
        prop_assert!(!advanced.is_before_or_equal(&a));
    }

    #[test]
    fn prop_missing_ranges_are_sound(a in arb_clock(), b in arb_clock()) {
        for (device, (from, to)) in a.missing_from(&b) {
            prop_assert!(from >= 1);
            prop_assert!(from <= to);
            prop_assert_eq!(from, b.get(&device) + 1);
            prop_assert_eq!(to, a.get(&device));
        }
    }

    #[test]
    fn prop_no_gaps_between_comparable_clocks(a in arb_clock(), b in arb_clock()) {
        if a.is_before_or_equal(&b) {
            prop_assert!(a.missing_from(&b).is_empty());
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_reapplying_envelopes_is_idempotent(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..50), 1..10),
        replay_index in any::<prop::sample::Index>(),
    ) {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).single().unwrap();
        let mut sender =
            GroupSync::new(Group::new("g", "grp", "dev-s", "s", now), [1; 32]);
        let mut receiver =
            GroupSync::new(Group::new("g", "grp", "dev-r", "r", now), [2; 32]);

        sender.add_member(hushlink_core::GroupMember {
            device_id: "dev-r".to_owned(),
            display_name: "r".to_owned(),
            public_key: None,
            joined_at: now,
        }).unwrap();
        receiver.add_member(hushlink_core::GroupMember {
            device_id: "dev-s".to_owned(),
            display_name: "s".to_owned(),
            public_key: None,
            joined_at: now,
        }).unwrap();
        receiver.install_member_key("dev-s", &[1; 32]).unwrap();

        let mut envelopes = Vec::new();
        for (i, payload) in payloads.iter().enumerate() {
            let mut nonce = [0u8; 12];
            nonce[..8].copy_from_slice(&(i as u64).to_be_bytes());
            let (envelope, _) = sender.send(payload, nonce).unwrap();
            envelopes.push(envelope);
        }

        for envelope in &envelopes {
            prop_assert!(matches!(receiver.apply(envelope).unwrap(), Applied::New(_)));
        }

        // Any envelope delivered a second time changes nothing.
        let replay = &envelopes[replay_index.index(envelopes.len())];
        let clock_before = receiver.clock().clone();
        prop_assert_eq!(receiver.apply(replay).unwrap(), Applied::Duplicate);
        prop_assert_eq!(receiver.clock(), &clock_before);
    }
}
