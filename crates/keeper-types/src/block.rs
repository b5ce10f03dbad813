//! Block types observed from the chain.
//!
//! A `BlockObservation` is produced for every header notification and is
//! discarded once the block has been walked. `ChainState` caches the latest
//! observation for gas decisions and status reporting.

use alloy::primitives::B256;
use serde::{Deserialize, Serialize};

/// Metadata of a single fetched block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockObservation {
	/// Block number.
	pub number: u64,
	/// Block hash. Two observations with the same number and different
	/// hashes indicate a re-org.
	pub hash: B256,
	/// Block timestamp in unix seconds.
	pub timestamp: u64,
	/// Base fee per gas in wei, absent on pre-London chains.
	pub base_fee: Option<u128>,
	/// Number of transactions included in the block.
	pub tx_count: usize,
}

/// Latest chain metadata cached by a connector.
///
/// Written only by the block handler of its network, read by the queues
/// and the status reporter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
	pub chain_id: u64,
	pub latest_block_number: u64,
	pub latest_block_timestamp: u64,
	pub base_fee: u128,
}

impl ChainState {
	/// Overwrites the cached values with the given block.
	pub fn apply(&mut self, block: &BlockObservation) {
		self.latest_block_number = block.number;
		self.latest_block_timestamp = block.timestamp;
		self.base_fee = block.base_fee.unwrap_or_default();
	}
}
