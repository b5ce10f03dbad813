//! Network configuration types for multi-network keeper operations.
//!
//! This module defines the per-network settings: the streaming RPC endpoint,
//! block cadence, the aggregator contract used for resolver checks, the
//! agents whose workers submit transactions and the static jobs wired up by
//! the binary.

use crate::SecretString;
use alloy::primitives::{address, Address, Bytes};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

/// Canonical Multicall3 deployment, identical on every supported chain.
pub const DEFAULT_MULTICALL_ADDRESS: Address = address!("cA11bde05977b3631167028862bE2a173976CA11");

/// Block time assumed for networks without a known default.
const FALLBACK_AVERAGE_BLOCK_TIME: u64 = 12;

/// Returns the average block time in seconds for a well-known network name.
pub fn default_average_block_time(network_name: &str) -> u64 {
	match network_name {
		"mainnet" | "goerli" => 13,
		"bsc" => 3,
		"polygon" => 2,
		"gnosis" => 5,
		"arbitrum" => 1,
		"sepolia" => 12,
		_ => FALLBACK_AVERAGE_BLOCK_TIME,
	}
}

/// Networks section of the configuration.
///
/// Only networks listed in `enabled` are started; `details` may hold
/// settings for more networks than are currently enabled.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NetworksConfig {
	#[serde(default)]
	pub enabled: Vec<String>,
	#[serde(default)]
	pub details: HashMap<String, NetworkConfig>,
}

/// Configuration for a single blockchain network.
///
/// # Fields
///
/// * `rpc` - WebSocket endpoint used for the block subscription and all calls
/// * `average_block_time` - Block time in seconds, defaults per network name
/// * `multicall` - Aggregator contract, defaults to Multicall3
/// * `max_priority_fee_per_gas` - Optional cap applied to the node's suggestion, in wei
/// * `agents` - Agents keyed by their on-chain agent address
/// * `jobs` - Static jobs keyed by job key
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
	pub rpc: String,
	#[serde(default)]
	pub average_block_time: Option<u64>,
	#[serde(default)]
	pub multicall: Option<Address>,
	#[serde(default)]
	pub max_priority_fee_per_gas: Option<u64>,
	#[serde(default)]
	pub agents: BTreeMap<String, AgentConfig>,
	#[serde(default)]
	pub jobs: BTreeMap<String, StaticJobConfig>,
}

impl NetworkConfig {
	/// Average block time of the network, falling back to the per-name default.
	pub fn average_block_time_seconds(&self, network_name: &str) -> u64 {
		self.average_block_time
			.unwrap_or_else(|| default_average_block_time(network_name))
	}

	pub fn multicall_address(&self) -> Address {
		self.multicall.unwrap_or(DEFAULT_MULTICALL_ADDRESS)
	}

	/// Parses the agent keys into addresses, keeping their configured order.
	pub fn agents_by_address(&self) -> Result<Vec<(Address, &AgentConfig)>, String> {
		self.agents
			.iter()
			.map(|(key, agent)| {
				Address::from_str(key)
					.map(|address| (address, agent))
					.map_err(|e| format!("Invalid agent address '{}': {}", key, e))
			})
			.collect()
	}
}

/// Transaction executor flavour of an agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorType {
	/// Public mempool, priority gas auction.
	#[default]
	Pga,
}

/// Configuration of one agent on a network.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
	/// Address of the worker account that signs and pays for job transactions.
	pub keeper_worker_address: Address,
	/// Private key of the worker account.
	pub private_key: SecretString,
	#[serde(default)]
	pub executor: ExecutorType,
}

/// A job declared directly in the configuration.
///
/// Exactly one trigger must be set: `interval_seconds` for a job that runs
/// periodically with `calldata`, or `resolver_address` + `resolver_calldata`
/// for a job whose resolver payload becomes the calldata sent to `target`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StaticJobConfig {
	/// Agent whose queue executes the job.
	pub agent: Address,
	/// Contract receiving the job transaction.
	pub target: Address,
	#[serde(default)]
	pub calldata: Option<Bytes>,
	#[serde(default)]
	pub interval_seconds: Option<u64>,
	#[serde(default)]
	pub resolver_address: Option<Address>,
	#[serde(default)]
	pub resolver_calldata: Option<Bytes>,
}

impl StaticJobConfig {
	pub fn is_interval(&self) -> bool {
		self.interval_seconds.is_some()
	}

	pub fn is_resolver(&self) -> bool {
		self.resolver_address.is_some() || self.resolver_calldata.is_some()
	}
}
