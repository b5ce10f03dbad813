//! Common types module for the keeper system.
//!
//! This module defines the data types shared by the chain connector, the job
//! scheduler, the execution queues and the status API. Keeping them in one
//! crate lets the service layer talk about blocks, jobs and transactions
//! without depending on the concrete chain implementation.

/// Block observations and cached chain state.
pub mod block;
/// Events broadcast between keeper components.
pub mod events;
/// Job keys, resolvers and aggregated call types.
pub mod jobs;
/// Network, agent and static job configuration types.
pub mod networks;
/// Secure string type for private keys.
pub mod secret_string;
/// Read-only status snapshots exposed by networks and queues.
pub mod status;
/// Transaction outcome and gas escalation types.
pub mod transaction;
/// Utility functions for formatting and timestamps.
pub mod utils;

pub use alloy::primitives::{Address, Bytes, B256, U256};

pub use block::*;
pub use events::*;
pub use jobs::*;
pub use networks::{
	default_average_block_time, AgentConfig, ExecutorType, NetworkConfig, NetworksConfig,
	StaticJobConfig, DEFAULT_MULTICALL_ADDRESS,
};
pub use secret_string::SecretString;
pub use status::*;
pub use transaction::*;
pub use utils::{current_timestamp, is_streaming_endpoint, truncate_id};
