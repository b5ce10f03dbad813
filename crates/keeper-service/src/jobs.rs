//! Jobs declared in the configuration file.
//!
//! Interval jobs send fixed calldata to their target and re-arm once their
//! transaction is mined. Resolver jobs send the resolver's payload as
//! calldata to their target. Both push into the queue of the agent named by
//! the job; a trigger arriving while the previous transaction of the same job
//! is still queued or in flight is skipped.

use alloy::rpc::types::TransactionRequest;
use async_trait::async_trait;
use keeper_core::{
	CallbackError, CompletionHandle, ExecutionQueue, IntervalCallback, Network, QueueError,
	RegistryError, ResolverCallback, TransactionEnvelope,
};
use keeper_types::{current_timestamp, Address, Bytes, Resolver, StaticJobConfig};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StaticJobError {
	#[error("Job '{key}' on network '{network}' references unknown agent {agent}")]
	UnknownAgent {
		network: String,
		key: String,
		agent: Address,
	},
	#[error(transparent)]
	Registry(#[from] RegistryError),
}

/// Pushes an envelope, treating a job that is already queued as a skip.
///
/// Returns `None` when skipped.
async fn push_job(
	queue: &ExecutionQueue,
	key: &str,
	tx: TransactionRequest,
) -> Result<Option<CompletionHandle>, CallbackError> {
	match queue.push(key, TransactionEnvelope::new(key, tx)).await {
		Ok(handle) => Ok(Some(handle)),
		Err(QueueError::DuplicateJob(_)) => {
			tracing::debug!(job_key = %key, "Job transaction still pending, skipping trigger");
			Ok(None)
		},
		Err(e) => Err(e.into()),
	}
}

struct IntervalJob {
	this: Weak<IntervalJob>,
	network: Weak<Network>,
	key: String,
	queue: Arc<ExecutionQueue>,
	tx: TransactionRequest,
	interval_seconds: u64,
	/// Held from the push until the job is re-armed or its transaction is
	/// given up on.
	in_flight: AtomicBool,
}

impl IntervalJob {
	/// Moves the trigger time `interval_seconds` past the latest block.
	async fn rearm(&self) -> Result<(), RegistryError> {
		let (Some(network), Some(this)) = (self.network.upgrade(), self.this.upgrade()) else {
			return Ok(());
		};
		let latest = network.connector().state().await.latest_block_timestamp;
		let next = latest.saturating_add(self.interval_seconds);

		network.unregister_timeout(&self.key).await?;
		network.register_timeout(&self.key, next, this).await
	}
}

#[async_trait]
impl IntervalCallback for IntervalJob {
	async fn on_interval(&self, block_number: u64, _block_timestamp: u64) -> Result<(), CallbackError> {
		if self.in_flight.swap(true, Ordering::SeqCst) {
			tracing::debug!(job_key = %self.key, block_number, "Previous run not re-armed yet, skipping trigger");
			return Ok(());
		}

		let handle = match push_job(&self.queue, &self.key, self.tx.clone()).await {
			Ok(Some(handle)) => handle,
			Ok(None) => {
				self.in_flight.store(false, Ordering::SeqCst);
				return Ok(());
			},
			Err(e) => {
				self.in_flight.store(false, Ordering::SeqCst);
				return Err(e);
			},
		};
		tracing::debug!(job_key = %self.key, block_number, "Interval job triggered");

		let Some(this) = self.this.upgrade() else {
			return Ok(());
		};
		tokio::spawn(async move {
			match handle.wait().await {
				Ok(outcome) if outcome.is_mined() => {
					if let Err(e) = this.rearm().await {
						tracing::warn!(job_key = %this.key, "Failed to re-arm interval job: {}", e);
					}
				},
				Ok(outcome) => {
					tracing::warn!(job_key = %this.key, ?outcome, "Interval job not executed, retrying on the next block");
				},
				Err(e) => tracing::debug!(job_key = %this.key, "{}", e),
			}
			// Released only after the re-arm, so a walk in between cannot push again.
			this.in_flight.store(false, Ordering::SeqCst);
		});
		Ok(())
	}
}

struct ResolverJob {
	key: String,
	queue: Arc<ExecutionQueue>,
	target: Address,
}

#[async_trait]
impl ResolverCallback for ResolverJob {
	async fn on_resolved(&self, block_number: u64, payload: Bytes) -> Result<(), CallbackError> {
		let tx = TransactionRequest::default().to(self.target).input(payload.into());
		if push_job(&self.queue, &self.key, tx).await?.is_some() {
			tracing::debug!(job_key = %self.key, block_number, "Resolver job matched");
		}
		Ok(())
	}
}

/// Registers the configured jobs of a network. Returns how many were registered.
pub async fn register_static_jobs(
	network: &Arc<Network>,
	jobs: &BTreeMap<String, StaticJobConfig>,
) -> Result<usize, StaticJobError> {
	let mut registered = 0;
	for (key, job) in jobs {
		let queue = network
			.agent(job.agent)
			.map(|agent| agent.queue.clone())
			.ok_or_else(|| StaticJobError::UnknownAgent {
				network: network.name().to_string(),
				key: key.clone(),
				agent: job.agent,
			})?;

		match (job.interval_seconds, job.resolver_address, job.resolver_calldata.clone()) {
			(Some(interval_seconds), _, _) => {
				let mut tx = TransactionRequest::default().to(job.target);
				if let Some(calldata) = job.calldata.clone() {
					tx = tx.input(calldata.into());
				}
				let callback = Arc::new_cyclic(|this| IntervalJob {
					this: this.clone(),
					network: Arc::downgrade(network),
					key: key.clone(),
					queue,
					tx,
					interval_seconds,
					in_flight: AtomicBool::new(false),
				});
				network.register_timeout(key, current_timestamp(), callback).await?;
			},
			(None, Some(target), Some(calldata)) => {
				let callback = Arc::new(ResolverJob {
					key: key.clone(),
					queue,
					target: job.target,
				});
				network
					.register_resolver(key, Resolver { target, calldata }, callback)
					.await?;
			},
			_ => {
				tracing::warn!(network = %network.name(), job_key = %key, "Job has no trigger, skipping");
				continue;
			},
		}
		registered += 1;
	}

	Ok(registered)
}

#[cfg(test)]
mod tests {
	use super::*;
	use keeper_chain::MockChainInterface;
	use keeper_core::NetworkSettings;
	use keeper_types::{
		AgentConfig, BlockObservation, ExecutorType, NetworkConfig, NewBlockEvent, SecretString,
		TransactionReceipt, B256,
	};
	use std::sync::atomic::AtomicUsize;
	use std::time::Duration;

	const AGENT: &str = "0x00000000000000000000000000000000000000aa";

	fn network(chain: MockChainInterface) -> Arc<Network> {
		let mut agents = BTreeMap::new();
		agents.insert(
			AGENT.to_string(),
			AgentConfig {
				keeper_worker_address: Address::repeat_byte(0xbb),
				private_key: SecretString::from("0x01"),
				executor: ExecutorType::Pga,
			},
		);
		let config = NetworkConfig {
			rpc: "ws://localhost:8546".to_string(),
			average_block_time: None,
			multicall: None,
			max_priority_fee_per_gas: None,
			agents,
			jobs: BTreeMap::new(),
		};
		Arc::new(Network::new("sepolia", &config, Arc::new(chain), NetworkSettings::default()).unwrap())
	}

	fn interval_job(interval_seconds: u64) -> StaticJobConfig {
		StaticJobConfig {
			agent: AGENT.parse().unwrap(),
			target: Address::with_last_byte(0x10),
			calldata: Some(Bytes::from(vec![0x12, 0x34])),
			interval_seconds: Some(interval_seconds),
			resolver_address: None,
			resolver_calldata: None,
		}
	}

	fn resolver_job() -> StaticJobConfig {
		StaticJobConfig {
			agent: AGENT.parse().unwrap(),
			target: Address::with_last_byte(0x20),
			calldata: None,
			interval_seconds: None,
			resolver_address: Some(Address::with_last_byte(0x30)),
			resolver_calldata: Some(Bytes::from(vec![0xab])),
		}
	}

	#[tokio::test]
	async fn test_unknown_agent_rejected() {
		let network = network(MockChainInterface::new());
		let mut job = interval_job(60);
		job.agent = Address::ZERO;
		let jobs = BTreeMap::from([("stray".to_string(), job)]);

		let err = register_static_jobs(&network, &jobs).await.unwrap_err();
		assert!(matches!(err, StaticJobError::UnknownAgent { ref key, .. } if key == "stray"));
	}

	#[tokio::test]
	async fn test_resolver_payload_becomes_calldata() {
		let network = network(MockChainInterface::new());
		let jobs = BTreeMap::from([("harvest".to_string(), resolver_job())]);
		assert_eq!(register_static_jobs(&network, &jobs).await.unwrap(), 1);

		let status = network.status().await;
		assert_eq!(status.resolver_callbacks["harvest"].target, Address::with_last_byte(0x30));

		let entry = network.registry().resolver_entries().await.remove(0);
		entry.callback.on_resolved(10, Bytes::from(vec![0xde, 0xad])).await.unwrap();
		// A second match while the first is still queued is skipped.
		entry.callback.on_resolved(11, Bytes::from(vec![0xbe, 0xef])).await.unwrap();

		let queue = network.status().await.agents.remove(0).queue;
		assert_eq!(queue.queue.len(), 1);
		assert_eq!(queue.queue[0].envelope.to, Some(Address::with_last_byte(0x20)));
		assert_eq!(queue.queue[0].envelope.data, Some(Bytes::from(vec![0xde, 0xad])));
	}

	#[tokio::test]
	async fn test_interval_job_rearms_after_mined() {
		let latest_timestamp = current_timestamp() + 1_000;
		let sent = Arc::new(AtomicUsize::new(0));
		let polls = Arc::new(AtomicUsize::new(0));

		let mut chain = MockChainInterface::new();
		chain.expect_get_block().returning(move |number| {
			Ok(Some(BlockObservation {
				number: number.unwrap_or(1),
				hash: B256::repeat_byte(1),
				timestamp: latest_timestamp,
				base_fee: Some(1),
				tx_count: 0,
			}))
		});
		chain.expect_estimate_gas().returning(|_| Ok(30_000));
		chain.expect_get_nonce().returning(|_| Ok(0));
		chain.expect_get_max_priority_fee().returning(|| Ok(1));
		let sent_clone = sent.clone();
		chain.expect_send_transaction().returning(move |_| {
			sent_clone.fetch_add(1, Ordering::SeqCst);
			Ok(B256::repeat_byte(1))
		});
		let polls_clone = polls.clone();
		chain.expect_get_receipt().returning(move |hash| {
			// Pending for a few blocks before inclusion.
			if polls_clone.fetch_add(1, Ordering::SeqCst) < 3 {
				return Ok(None);
			}
			Ok(Some(TransactionReceipt {
				hash,
				block_number: 2,
				success: true,
				gas_used: 30_000,
			}))
		});
		let network = network(chain);
		let jobs = BTreeMap::from([("rebalance".to_string(), interval_job(60))]);
		register_static_jobs(&network, &jobs).await.unwrap();
		network.connector().handle_block_number(1).await.unwrap();
		network.agents()[0].queue.init().await;

		// One second before the re-armed trigger time.
		let now = latest_timestamp + 59;
		let blocks = network.connector().new_block_sender();
		let rearmed = tokio::time::timeout(Duration::from_secs(5), async {
			loop {
				// Fire every due interval job as a block walk would.
				for entry in network.registry().due_intervals(now).await {
					entry.callback.on_interval(2, now).await.unwrap();
				}
				let _ = blocks.send(NewBlockEvent { number: 2, timestamp: now });
				let statuses = network.registry().timeout_statuses(now).await;
				if statuses.get("rebalance").map(|s| s.callback_at) == Some(latest_timestamp + 60) {
					break;
				}
				tokio::time::sleep(Duration::from_millis(5)).await;
			}
		})
		.await;
		assert!(rearmed.is_ok());
		assert!(polls.load(Ordering::SeqCst) >= 4);
		assert_eq!(sent.load(Ordering::SeqCst), 1);
		assert!(network.registry().due_intervals(now).await.is_empty());
		network.stop().await;
	}
}
