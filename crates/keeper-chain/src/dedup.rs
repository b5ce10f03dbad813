use alloy::primitives::B256;
use std::collections::{BTreeMap, HashSet};

/// Remembers which block hashes have been walked for each block number.
///
/// Only the `capacity` highest block numbers are kept. Once the window is
/// full, a block number below it is ignored.
#[derive(Debug)]
pub struct BlockDedupIndex {
	capacity: usize,
	seen: BTreeMap<u64, HashSet<B256>>,
}

impl BlockDedupIndex {
	pub fn new(capacity: usize) -> Self {
		Self {
			capacity: capacity.max(1),
			seen: BTreeMap::new(),
		}
	}

	/// Records a block and returns true if it should trigger a walk.
	///
	/// A walk is triggered for an unseen number and for a known number with
	/// a new hash (re-org). A repeated (number, hash) pair is ignored.
	pub fn observe(&mut self, number: u64, hash: B256) -> bool {
		if self.seen.len() >= self.capacity
			&& self.seen.first_key_value().is_some_and(|(lowest, _)| number < *lowest)
		{
			return false;
		}

		let inserted = self.seen.entry(number).or_default().insert(hash);

		while self.seen.len() > self.capacity {
			self.seen.pop_first();
		}

		inserted
	}

	/// Number of block numbers currently remembered.
	pub fn len(&self) -> usize {
		self.seen.len()
	}

	pub fn is_empty(&self) -> bool {
		self.seen.is_empty()
	}
}
