//! Causal clocks for group message ordering.
//!
//! Each group member stamps outgoing messages with a vector of per-device
//! sequence counters. Comparing clocks establishes causal order without a
//! central sequencer: a message is "before" another exactly when its
//! clock is pointwise dominated. Messages whose clocks are incomparable
//! are concurrent, and display order breaks that tie deterministically by
//! author device id.
//!
//! # Invariants
//!
//! - Merge is pointwise max: commutative, idempotent, and entry-wise
//!   non-decreasing. All clock growth goes through [`CausalClock::merge`]
//!   or [`CausalClock::increment`].
//! - Sequence numbers start at 1; a device absent from the clock is at 0.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Immutable per-device sequence vector.
///
/// Operations return new clocks rather than mutating, so a clock captured
/// in a message record can never change under the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CausalClock {
    entries: BTreeMap<String, u64>,
}

impl CausalClock {
    /// The empty clock (every device at 0).
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a clock from explicit entries, e.g. a wire clock summary.
    ///
    /// Zero entries are dropped; absence already means 0.
    pub fn from_entries(entries: BTreeMap<String, u64>) -> Self {
        Self { entries: entries.into_iter().filter(|(_, seq)| *seq > 0).collect() }
    }

    /// Current sequence number for a device (0 when never seen).
    pub fn get(&self, device_id: &str) -> u64 {
        self.entries.get(device_id).copied().unwrap_or(0)
    }

    /// Borrow the raw entries, for wire serialization.
    pub fn entries(&self) -> &BTreeMap<String, u64> {
        &self.entries
    }

    /// New clock with one device's counter advanced by one.
    #[must_use]
    pub fn increment(&self, device_id: &str) -> Self {
        let mut entries = self.entries.clone();
        *entries.entry(device_id.to_owned()).or_insert(0) += 1;
        Self { entries }
    }

    /// Pointwise maximum of two clocks.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let mut entries = self.entries.clone();
        for (device, seq) in &other.entries {
            let entry = entries.entry(device.clone()).or_insert(0);
            *entry = (*entry).max(*seq);
        }
        Self { entries }
    }

    /// Whether every entry of `self` is ≤ the matching entry of `other`.
    ///
    /// This is the causal "happened before or equal" relation.
    pub fn is_before_or_equal(&self, other: &Self) -> bool {
        self.entries.iter().all(|(device, seq)| *seq <= other.get(device))
    }

    /// Whether neither clock dominates the other.
    pub fn is_concurrent_with(&self, other: &Self) -> bool {
        !self.is_before_or_equal(other) && !other.is_before_or_equal(self)
    }

    /// Per-device inclusive sequence ranges that `other` has not reached.
    ///
    /// For each device where `self` is ahead, yields
    /// `(other.get(d) + 1, self.get(d))`. Never yields sequence 0 and
    /// never a range `self` itself has not surpassed, so the result is
    /// directly usable as a gap-repair request.
    pub fn missing_from(&self, other: &Self) -> BTreeMap<String, (u64, u64)> {
        self.entries
            .iter()
            .filter(|(device, seq)| **seq > other.get(device))
            .map(|(device, seq)| (device.clone(), (other.get(device) + 1, *seq)))
            .collect()
    }
}

/// Deterministic display order for two stamped messages.
///
/// Causal order where it exists; concurrent messages order by author
/// device id so every member renders the same transcript.
pub fn causal_order(
    a_clock: &CausalClock,
    a_author: &str,
    b_clock: &CausalClock,
    b_author: &str,
) -> Ordering {
    if a_clock == b_clock {
        return a_author.cmp(b_author);
    }
    if a_clock.is_before_or_equal(b_clock) {
        return Ordering::Less;
    }
    if b_clock.is_before_or_equal(a_clock) {
        return Ordering::Greater;
    }
    a_author.cmp(b_author)
}
