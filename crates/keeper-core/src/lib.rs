//! Core keeper engine.
//!
//! This crate wires the chain connector of every network to its job registry,
//! block scheduler and per-agent execution queues, and provides the engine
//! and builder used by the service binary to run all configured networks.

use thiserror::Error;

pub mod builder;
pub mod engine;
pub mod executor;
pub mod network;
pub mod registry;
pub mod scheduler;

pub use builder::{BuilderError, KeeperBuilder};
pub use engine::{EngineError, KeeperEngine};
pub use executor::{
	CompletionHandle, DefaultCallbacks, ExecutionQueue, ExecutorCallbacks, QueueContext,
	QueueError, TransactionEnvelope,
};
pub use network::{Agent, Network, NetworkError, NetworkSettings};
pub use registry::{
	interval_callback, resolver_callback, IntervalCallback, JobRegistry, RegistryError,
	ResolverCallback,
};
pub use scheduler::{BlockScheduler, WalkSummary};

/// Error returned by a job callback.
///
/// Callback errors are logged by the scheduler and never stop the block loop.
#[derive(Debug, Error)]
pub enum CallbackError {
	#[error("Callback failed: {0}")]
	Failed(String),
	#[error(transparent)]
	Queue(#[from] QueueError),
}
