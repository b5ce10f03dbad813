//! A monitored network.
//!
//! Owns the chain connector, the job registry, the block scheduler and one
//! execution queue per agent. Accepted blocks flow from the connector's
//! listener to a single walker task, so two walks of the same network never
//! overlap.

use crate::executor::{compute_fees, ExecutionQueue, QueueContext};
use crate::registry::{IntervalCallback, JobRegistry, RegistryError, ResolverCallback};
use crate::scheduler::BlockScheduler;
use keeper_chain::{ChainConnector, ChainError, ChainInterface};
use keeper_types::{
	current_timestamp, Address, AgentStatus, BlockObservation, ExecutorType, NetworkConfig,
	NetworkStatus, Resolver,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Errors raised while setting up or starting a network.
#[derive(Debug, Error)]
pub enum NetworkError {
	#[error("Network '{0}' is already initialized")]
	AlreadyInitialized(String),
	#[error("Failed to initialize network '{network}' ({rpc}): {reason}")]
	Init {
		network: String,
		rpc: String,
		reason: String,
	},
	#[error(transparent)]
	Chain(#[from] ChainError),
}

/// Keeper-wide limits applied to every network.
#[derive(Debug, Clone, Copy)]
pub struct NetworkSettings {
	/// Number of recent block numbers remembered for de-duplication.
	pub block_history_size: usize,
	pub max_concurrent_callbacks: usize,
}

impl Default for NetworkSettings {
	fn default() -> Self {
		Self {
			block_history_size: 256,
			max_concurrent_callbacks: 64,
		}
	}
}

/// An agent of the network and the queue of its worker account.
pub struct Agent {
	pub address: Address,
	pub worker_address: Address,
	pub executor: ExecutorType,
	pub queue: Arc<ExecutionQueue>,
}

pub struct Network {
	name: String,
	average_block_time: u64,
	max_priority_fee_cap: Option<u128>,
	connector: ChainConnector,
	registry: Arc<JobRegistry>,
	scheduler: Arc<BlockScheduler>,
	agents: Vec<Agent>,
	/// Set by the first `init` call, agents or not.
	init_requested: AtomicBool,
	initialized: AtomicBool,
	walker: Mutex<Option<JoinHandle<()>>>,
}

impl Network {
	pub fn new(
		name: impl Into<String>,
		config: &NetworkConfig,
		chain: Arc<dyn ChainInterface>,
		settings: NetworkSettings,
	) -> Result<Self, NetworkError> {
		let name = name.into();
		let max_priority_fee_cap = config.max_priority_fee_per_gas.map(u128::from);
		let connector = ChainConnector::new(&name, &config.rpc, chain.clone(), settings.block_history_size);
		let registry = Arc::new(JobRegistry::new());
		let scheduler = Arc::new(BlockScheduler::new(
			&name,
			chain.clone(),
			config.multicall_address(),
			registry.clone(),
			settings.max_concurrent_callbacks,
		));

		let agents = config
			.agents_by_address()
			.map_err(|reason| NetworkError::Init {
				network: name.clone(),
				rpc: config.rpc.clone(),
				reason,
			})?
			.into_iter()
			.map(|(address, agent)| {
				let queue = ExecutionQueue::new(QueueContext {
					name: name.clone(),
					chain: chain.clone(),
					worker_address: agent.keeper_worker_address,
					chain_state: connector.state_handle(),
					new_blocks: connector.new_block_sender(),
					stream_closed: connector.stream_closed(),
					max_priority_fee_cap,
				});
				Agent {
					address,
					worker_address: agent.keeper_worker_address,
					executor: agent.executor,
					queue: Arc::new(queue),
				}
			})
			.collect();

		Ok(Self {
			average_block_time: config.average_block_time_seconds(&name),
			name,
			max_priority_fee_cap,
			connector,
			registry,
			scheduler,
			agents,
			init_requested: AtomicBool::new(false),
			initialized: AtomicBool::new(false),
			walker: Mutex::new(None),
		})
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn is_initialized(&self) -> bool {
		self.initialized.load(Ordering::SeqCst)
	}

	pub fn agents(&self) -> &[Agent] {
		&self.agents
	}

	pub fn agent(&self, address: Address) -> Option<&Agent> {
		self.agents.iter().find(|agent| agent.address == address)
	}

	pub fn registry(&self) -> &Arc<JobRegistry> {
		&self.registry
	}

	pub fn connector(&self) -> &ChainConnector {
		&self.connector
	}

	/// Connects the network: caches the chain id and latest block, starts the
	/// walker and the block subscription, then the agent queues.
	///
	/// A network without agents is left uninitialized. Either way a second
	/// call is rejected.
	pub async fn init(&self) -> Result<(), NetworkError> {
		if self.init_requested.swap(true, Ordering::SeqCst) {
			return Err(NetworkError::AlreadyInitialized(self.name.clone()));
		}
		if self.agents.is_empty() {
			tracing::warn!(network = %self.name, "No agents configured, network not initialized");
			return Ok(());
		}
		self.initialized.store(true, Ordering::SeqCst);

		match self.start().await {
			Ok(latest_block_number) => {
				tracing::info!(
					"The network '{}' has been initialized. The last block number: {}",
					self.name,
					latest_block_number
				);
				Ok(())
			},
			Err(e) => {
				self.initialized.store(false, Ordering::SeqCst);
				self.init_requested.store(false, Ordering::SeqCst);
				Err(NetworkError::Init {
					network: self.name.clone(),
					rpc: self.connector.rpc().to_string(),
					reason: e.to_string(),
				})
			},
		}
	}

	async fn start(&self) -> Result<u64, ChainError> {
		let state = self.connector.init().await?;

		let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
		let handle = tokio::spawn(Self::walk_blocks(self.name.clone(), self.scheduler.clone(), accepted_rx));
		*self.walker.lock().await = Some(handle);

		if let Err(e) = self.connector.start(accepted_tx).await {
			if let Some(handle) = self.walker.lock().await.take() {
				handle.abort();
			}
			return Err(e);
		}

		for agent in &self.agents {
			agent.queue.init().await;
		}
		Ok(state.latest_block_number)
	}

	async fn walk_blocks(
		network: String,
		scheduler: Arc<BlockScheduler>,
		mut accepted: mpsc::UnboundedReceiver<BlockObservation>,
	) {
		while let Some(block) = accepted.recv().await {
			let summary = scheduler.walk(&block).await;
			tracing::debug!(
				network = %network,
				block_number = block.number,
				intervals_triggered = summary.intervals_triggered,
				resolvers_called = summary.resolvers_called,
				jobs_to_execute = summary.jobs_to_execute,
				"Block walked"
			);
		}
	}

	/// Stops the subscription, the walker and every agent queue.
	pub async fn stop(&self) {
		self.connector.stop().await;
		if let Some(handle) = self.walker.lock().await.take() {
			handle.abort();
			let _ = handle.await;
		}
		for agent in &self.agents {
			agent.queue.stop().await;
		}
		self.init_requested.store(false, Ordering::SeqCst);
		if self.initialized.swap(false, Ordering::SeqCst) {
			tracing::info!(network = %self.name, "Network stopped");
		}
	}

	pub async fn register_timeout(
		&self,
		key: &str,
		trigger_after: u64,
		callback: Arc<dyn IntervalCallback>,
	) -> Result<(), RegistryError> {
		self.registry.register_timeout(key, trigger_after, callback).await?;
		tracing::info!(network = %self.name, job_key = %key, trigger_after, "Interval callback registered");
		Ok(())
	}

	pub async fn unregister_timeout(&self, key: &str) -> Result<(), RegistryError> {
		self.registry.unregister_timeout(key).await?;
		tracing::debug!(network = %self.name, job_key = %key, "Interval callback unregistered");
		Ok(())
	}

	pub async fn register_resolver(
		&self,
		key: &str,
		resolver: Resolver,
		callback: Arc<dyn ResolverCallback>,
	) -> Result<(), RegistryError> {
		let target = resolver.target;
		self.registry.register_resolver(key, resolver, callback).await?;
		tracing::info!(network = %self.name, job_key = %key, resolver = %target, "Resolver callback registered");
		Ok(())
	}

	pub async fn unregister_resolver(&self, key: &str) -> Result<(), RegistryError> {
		self.registry.unregister_resolver(key).await?;
		tracing::debug!(network = %self.name, job_key = %key, "Resolver callback unregistered");
		Ok(())
	}

	pub async fn query_gas_price(&self) -> Result<u128, ChainError> {
		self.connector.chain().get_gas_price().await
	}

	/// Node's priority fee suggestion, capped by the configured maximum.
	pub async fn query_max_priority_fee(&self) -> Result<u128, ChainError> {
		let suggested = self.connector.chain().get_max_priority_fee().await?;
		Ok(compute_fees(0, suggested, self.max_priority_fee_cap).max_priority_fee_per_gas)
	}

	/// Base fee of the last fetched block.
	pub async fn latest_base_fee(&self) -> u128 {
		self.connector.state().await.base_fee
	}

	pub async fn status(&self) -> NetworkStatus {
		let state = self.connector.state().await;

		let mut agents = Vec::with_capacity(self.agents.len());
		for agent in &self.agents {
			agents.push(AgentStatus {
				address: agent.address,
				worker_address: agent.worker_address,
				executor: agent.executor,
				queue: agent.queue.status().await,
			});
		}

		NetworkStatus {
			name: self.name.clone(),
			rpc: self.connector.rpc().to_string(),
			initialized: self.is_initialized(),
			chain_id: state.chain_id,
			base_fee: state.base_fee,
			latest_block_number: state.latest_block_number,
			latest_block_timestamp: state.latest_block_timestamp,
			average_block_time_seconds: self.average_block_time,
			agents,
			timeout_callbacks: self.registry.timeout_statuses(current_timestamp()).await,
			resolver_callbacks: self.registry.resolver_statuses().await,
		}
	}
}
