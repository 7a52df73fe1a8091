//! A mapping of `device_id -> monotonic counter`. Missing components read
//! as 0. Used both by the server (one global clock, bumped on every
//! accepted mutation) and by each client (bumped on every outbound
//! mutation).

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Result of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ordering {
	Before,
	After,
	Concurrent,
	Equal,
}

/// Per-device logical counter map.
///
/// Serializes as a plain `device_id -> integer` JSON object; `BTreeMap` is
/// used (rather than `HashMap`) so that map serialization and `Debug`
/// output are deterministic, which matters for the snapshot sent in
/// `full_sync` payloads and for tests that assert on serialized form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
	counters: BTreeMap<String, u64>,
}

impl VectorClock {
	pub fn new() -> Self {
		Self::default()
	}

	/// Read a single device's counter; missing components read as 0.
	pub fn get(&self, device_id: &str) -> u64 {
		self.counters.get(device_id).copied().unwrap_or(0)
	}

	/// Increment this clock's own slot for `device_id`.
	pub fn bump(&mut self, device_id: &str) -> u64 {
		let entry = self.counters.entry(device_id.to_string()).or_insert(0);
		*entry += 1;
		*entry
	}

	/// Component-wise max merge of `other` into `self`.
	pub fn merge(&mut self, other: &VectorClock) {
		for (device_id, &count) in &other.counters {
			let entry = self.counters.entry(device_id.clone()).or_insert(0);
			if count > *entry {
				*entry = count;
			}
		}
	}

	/// Compare two clocks under the usual partial order: `a < b` iff every
	/// component of `a` is `<=` the corresponding component of `b` and at
	/// least one is strictly `<`; otherwise, if no component of `a` exceeds
	/// the corresponding component of `b` and vice versa fails too, the
	/// clocks are concurrent.
	pub fn compare(a: &VectorClock, b: &VectorClock) -> Ordering {
		let mut a_less = false;
		let mut b_less = false;

		for device_id in a.device_ids().chain(b.device_ids()) {
			match a.get(device_id).cmp(&b.get(device_id)) {
				CmpOrdering::Less => a_less = true,
				CmpOrdering::Greater => b_less = true,
				CmpOrdering::Equal => {}
			}
		}

		match (a_less, b_less) {
			(false, false) => Ordering::Equal,
			(true, false) => Ordering::Before,
			(false, true) => Ordering::After,
			(true, true) => Ordering::Concurrent,
		}
	}

	/// Whether `self` causally dominates `other` (`other` happened-before or
	/// equal to `self`). Used for resurrection suppression.
	pub fn dominates(&self, other: &VectorClock) -> bool {
		matches!(Self::compare(other, self), Ordering::Before | Ordering::Equal)
	}

	fn device_ids(&self) -> impl Iterator<Item = &str> {
		self.counters.keys().map(|s| s.as_str())
	}
}
