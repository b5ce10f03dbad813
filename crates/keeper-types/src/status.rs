//! Status snapshot types.
//!
//! Snapshots are assembled on demand from the live components and never
//! mutate them. They are serialized as-is by the HTTP status API.

use crate::networks::ExecutorType;
use alloy::primitives::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Status of one network and everything registered on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
	pub name: String,
	pub rpc: String,
	pub initialized: bool,
	pub chain_id: u64,
	pub base_fee: u128,
	pub latest_block_number: u64,
	pub latest_block_timestamp: u64,
	pub average_block_time_seconds: u64,
	pub agents: Vec<AgentStatus>,
	pub timeout_callbacks: BTreeMap<String, TimeoutCallbackStatus>,
	pub resolver_callbacks: BTreeMap<String, ResolverCallbackStatus>,
}

/// Status of one agent and its execution queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
	pub address: Address,
	pub worker_address: Address,
	pub executor: ExecutorType,
	pub queue: QueueStatus,
}

/// Trigger time of an interval registration.
///
/// `callback_in` is relative to the moment the snapshot was taken and is
/// negative once the trigger time has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutCallbackStatus {
	pub callback_at: u64,
	pub callback_in: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverCallbackStatus {
	pub target: Address,
	pub calldata: Bytes,
}

/// Snapshot of a single-flight execution queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
	pub current_tx_key: Option<String>,
	pub current_tx_envelope: Option<EnvelopeSummary>,
	pub queue: Vec<QueuedEnvelope>,
	pub queue_handler_lock: bool,
}

/// Serializable view of a transaction envelope without its callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeSummary {
	pub job_key: String,
	pub to: Option<Address>,
	pub data: Option<Bytes>,
	pub value: Option<U256>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedEnvelope {
	pub key: String,
	pub envelope: EnvelopeSummary,
}
