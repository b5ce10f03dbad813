//! Per-block job evaluation.
//!
//! Each accepted block is walked once: due interval jobs are dispatched
//! first, then all resolvers are checked with a single aggregated call and
//! the matching ones are dispatched in registration order. Callbacks run on
//! their own tasks, bounded by a per-network semaphore.

use crate::registry::JobRegistry;
use crate::CallbackError;
use keeper_chain::{decode_resolver_output, ChainInterface};
use keeper_types::{AggregateCall, Address, BlockObservation};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Counters of a single block walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkSummary {
	pub intervals_triggered: usize,
	pub resolvers_called: usize,
	pub jobs_to_execute: usize,
}

/// Evaluates the registered jobs of one network against new blocks.
pub struct BlockScheduler {
	network: String,
	chain: Arc<dyn ChainInterface>,
	multicall: Address,
	registry: Arc<JobRegistry>,
	permits: Arc<Semaphore>,
}

impl BlockScheduler {
	pub fn new(
		network: impl Into<String>,
		chain: Arc<dyn ChainInterface>,
		multicall: Address,
		registry: Arc<JobRegistry>,
		max_concurrent_callbacks: usize,
	) -> Self {
		Self {
			network: network.into(),
			chain,
			multicall,
			registry,
			permits: Arc::new(Semaphore::new(max_concurrent_callbacks.max(1))),
		}
	}

	/// Walks all jobs for a block.
	pub async fn walk(&self, block: &BlockObservation) -> WalkSummary {
		let intervals_triggered = self
			.trigger_interval_callbacks(block.number, block.timestamp)
			.await;
		let (resolvers_called, jobs_to_execute) = self.call_resolvers_and_trigger_callbacks(block.number).await;

		WalkSummary {
			intervals_triggered,
			resolvers_called,
			jobs_to_execute,
		}
	}

	async fn trigger_interval_callbacks(&self, block_number: u64, block_timestamp: u64) -> usize {
		let due = self.registry.due_intervals(block_timestamp).await;
		let triggered = due.len();

		for job in due {
			let callback = job.callback;
			self.dispatch(job.key, async move {
				callback.on_interval(block_number, block_timestamp).await
			})
			.await;
		}

		tracing::debug!(
			network = %self.network,
			block_number,
			"Interval callbacks triggered: {}",
			triggered
		);
		triggered
	}

	async fn call_resolvers_and_trigger_callbacks(&self, block_number: u64) -> (usize, usize) {
		let entries = self.registry.resolver_entries().await;
		if entries.is_empty() {
			return (0, 0);
		}

		let calls: Vec<AggregateCall> = entries
			.iter()
			.map(|entry| AggregateCall::from(&entry.resolver))
			.collect();
		let results = match self.chain.aggregate(self.multicall, false, calls).await {
			Ok(results) => results,
			Err(e) => {
				tracing::error!(
					network = %self.network,
					block_number,
					"Aggregated resolver call failed: {}",
					e
				);
				return (entries.len(), 0);
			},
		};

		if results.len() != entries.len() {
			tracing::warn!(
				network = %self.network,
				block_number,
				expected = entries.len(),
				received = results.len(),
				"Aggregated resolver call returned an unexpected number of results"
			);
		}

		let resolvers_called = entries.len();
		let mut jobs_to_execute = 0;
		for (entry, result) in entries.into_iter().zip(results) {
			if !result.success {
				continue;
			}
			match decode_resolver_output(&result.return_data) {
				Ok((true, payload)) => {
					jobs_to_execute += 1;
					let callback = entry.callback;
					self.dispatch(entry.key, async move {
						callback.on_resolved(block_number, payload).await
					})
					.await;
				},
				Ok((false, _)) => {},
				Err(e) => {
					tracing::warn!(
						network = %self.network,
						job_key = %entry.key,
						"Failed to decode resolver result: {}",
						e
					);
				},
			}
		}

		tracing::debug!(
			network = %self.network,
			block_number,
			"Resolver callbacks: resolvers called {}, jobs to execute {}",
			resolvers_called,
			jobs_to_execute
		);
		(resolvers_called, jobs_to_execute)
	}

	/// Runs a callback on its own task once a permit is available.
	async fn dispatch<Fut>(&self, job_key: String, callback: Fut)
	where
		Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
	{
		match self.permits.clone().acquire_owned().await {
			Ok(permit) => {
				let network = self.network.clone();
				tokio::spawn(async move {
					let _permit = permit;
					if let Err(e) = callback.await {
						tracing::error!(network = %network, job_key = %job_key, "Job callback failed: {}", e);
					}
				});
			},
			Err(e) => {
				tracing::error!(network = %self.network, job_key = %job_key, "Failed to acquire callback permit: {}", e);
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::registry::{interval_callback, resolver_callback};
	use alloy::sol_types::SolValue;
	use keeper_chain::{ChainError, MockChainInterface};
	use keeper_types::{AggregateResult, Bytes, Resolver, B256};
	use std::time::Duration;
	use tokio::sync::mpsc;

	fn multicall() -> Address {
		Address::repeat_byte(0xca)
	}

	fn block(number: u64, timestamp: u64) -> BlockObservation {
		BlockObservation {
			number,
			hash: B256::repeat_byte(number as u8),
			timestamp,
			base_fee: Some(7),
			tx_count: 0,
		}
	}

	fn resolver(byte: u8) -> Resolver {
		Resolver {
			target: Address::with_last_byte(byte),
			calldata: Bytes::from(vec![0xf0, byte]),
		}
	}

	fn resolver_output(matched: bool, payload: &[u8]) -> Bytes {
		(matched, Bytes::copy_from_slice(payload)).abi_encode_params().into()
	}

	async fn drain(rx: &mut mpsc::UnboundedReceiver<(String, u64, Bytes)>) -> Vec<(String, u64, Bytes)> {
		let mut received = Vec::new();
		while let Ok(Some(item)) = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await {
			received.push(item);
		}
		received
	}

	#[tokio::test]
	async fn test_interval_jobs_fire_continuously() {
		let registry = Arc::new(JobRegistry::new());
		let (tx, mut rx) = mpsc::unbounded_channel();
		registry
			.register_timeout(
				"tick",
				1_000,
				interval_callback(move |number, timestamp| {
					let tx = tx.clone();
					async move {
						let _ = tx.send((number, timestamp));
						Ok(())
					}
				}),
			)
			.await
			.unwrap();

		// No resolvers registered, so the chain must not be called at all.
		let scheduler = BlockScheduler::new("test", Arc::new(MockChainInterface::new()), multicall(), registry, 4);

		assert_eq!(scheduler.walk(&block(1, 999)).await.intervals_triggered, 0);
		assert_eq!(scheduler.walk(&block(2, 1_000)).await.intervals_triggered, 1);
		assert_eq!(scheduler.walk(&block(3, 1_012)).await.intervals_triggered, 1);

		let first = rx.recv().await.unwrap();
		let second = rx.recv().await.unwrap();
		let mut fired = vec![first, second];
		fired.sort();
		assert_eq!(fired, vec![(2, 1_000), (3, 1_012)]);
	}

	#[tokio::test]
	async fn test_resolvers_batched_in_registration_order() {
		let registry = Arc::new(JobRegistry::new());
		let (tx, mut rx) = mpsc::unbounded_channel();
		for (key, byte) in [("first", 1u8), ("second", 2), ("third", 3)] {
			let tx = tx.clone();
			registry
				.register_resolver(
					key,
					resolver(byte),
					resolver_callback(move |number, payload| {
						let tx = tx.clone();
						async move {
							let _ = tx.send((key.to_string(), number, payload));
							Ok(())
						}
					}),
				)
				.await
				.unwrap();
		}

		let mut chain = MockChainInterface::new();
		chain
			.expect_aggregate()
			.times(1)
			.withf(|multicall, require_success, calls| {
				*multicall == Address::repeat_byte(0xca)
					&& !*require_success
					&& calls.len() == 3
					&& calls[0].target == Address::with_last_byte(1)
					&& calls[1].target == Address::with_last_byte(2)
					&& calls[2].target == Address::with_last_byte(3)
					&& calls[2].calldata == Bytes::from(vec![0xf0, 3])
			})
			.returning(|_, _, _| {
				Ok(vec![
					// Leg failed inside the aggregator.
					AggregateResult {
						success: false,
						return_data: resolver_output(true, &[0x01]),
					},
					// Succeeded but nothing to do.
					AggregateResult {
						success: true,
						return_data: resolver_output(false, &[0x02]),
					},
					AggregateResult {
						success: true,
						return_data: resolver_output(true, &[0x03]),
					},
				])
			});

		let scheduler = BlockScheduler::new("test", Arc::new(chain), multicall(), registry, 4);
		let summary = scheduler.walk(&block(9, 100)).await;

		assert_eq!(
			summary,
			WalkSummary {
				intervals_triggered: 0,
				resolvers_called: 3,
				jobs_to_execute: 1,
			}
		);
		let fired = drain(&mut rx).await;
		assert_eq!(fired, vec![("third".to_string(), 9, Bytes::from(vec![0x03]))]);
	}

	#[tokio::test]
	async fn test_end_to_end_resolver_fires_with_payload() {
		let registry = Arc::new(JobRegistry::new());
		let (tx, mut rx) = mpsc::unbounded_channel();
		registry
			.register_resolver(
				"foo",
				resolver(1),
				resolver_callback(move |number, payload| {
					let tx = tx.clone();
					async move {
						let _ = tx.send(("foo".to_string(), number, payload));
						Ok(())
					}
				}),
			)
			.await
			.unwrap();

		let mut chain = MockChainInterface::new();
		chain.expect_aggregate().times(1).returning(|_, _, _| {
			Ok(vec![AggregateResult {
				success: true,
				return_data: resolver_output(true, &[0xde, 0xad]),
			}])
		});

		let scheduler = BlockScheduler::new("test", Arc::new(chain), multicall(), registry, 4);
		scheduler.walk(&block(10, 120)).await;

		let fired = drain(&mut rx).await;
		assert_eq!(fired, vec![("foo".to_string(), 10, Bytes::from(vec![0xde, 0xad]))]);
	}

	#[tokio::test]
	async fn test_intervals_dispatched_before_resolvers() {
		let registry = Arc::new(JobRegistry::new());
		let order = Arc::new(std::sync::Mutex::new(Vec::new()));

		// Registered first so registration order cannot explain the result.
		let resolver_order = order.clone();
		registry
			.register_resolver(
				"resolve",
				resolver(1),
				resolver_callback(move |_, _| {
					let order = resolver_order.clone();
					async move {
						order.lock().unwrap().push("resolver");
						Ok(())
					}
				}),
			)
			.await
			.unwrap();
		let interval_order = order.clone();
		registry
			.register_timeout(
				"interval",
				0,
				interval_callback(move |_, _| {
					let order = interval_order.clone();
					async move {
						// Still first even when it yields.
						tokio::time::sleep(Duration::from_millis(20)).await;
						order.lock().unwrap().push("interval");
						Ok(())
					}
				}),
			)
			.await
			.unwrap();

		let mut chain = MockChainInterface::new();
		chain.expect_aggregate().times(1).returning(|_, _, _| {
			Ok(vec![AggregateResult {
				success: true,
				return_data: resolver_output(true, &[0x01]),
			}])
		});

		// A single permit makes each callback finish before the next starts.
		let scheduler = BlockScheduler::new("test", Arc::new(chain), multicall(), registry, 1);
		let summary = scheduler.walk(&block(13, 156)).await;
		assert_eq!(summary.intervals_triggered, 1);
		assert_eq!(summary.jobs_to_execute, 1);

		tokio::time::timeout(Duration::from_secs(1), async {
			while order.lock().unwrap().len() < 2 {
				tokio::time::sleep(Duration::from_millis(5)).await;
			}
		})
		.await
		.unwrap();
		assert_eq!(*order.lock().unwrap(), vec!["interval", "resolver"]);
	}

	#[tokio::test]
	async fn test_failures_are_isolated() {
		let registry = Arc::new(JobRegistry::new());
		let (tx, mut rx) = mpsc::unbounded_channel();

		registry
			.register_timeout(
				"broken",
				0,
				interval_callback(|_, _| async { Err(CallbackError::Failed("boom".to_string())) }),
			)
			.await
			.unwrap();
		for (key, byte) in [("garbage", 1u8), ("healthy", 2)] {
			let tx = tx.clone();
			registry
				.register_resolver(
					key,
					resolver(byte),
					resolver_callback(move |number, payload| {
						let tx = tx.clone();
						async move {
							let _ = tx.send((key.to_string(), number, payload));
							Ok(())
						}
					}),
				)
				.await
				.unwrap();
		}

		let mut chain = MockChainInterface::new();
		chain.expect_aggregate().returning(|_, _, _| {
			Ok(vec![
				AggregateResult {
					success: true,
					return_data: Bytes::from(vec![0xff; 3]),
				},
				AggregateResult {
					success: true,
					return_data: resolver_output(true, &[0x42]),
				},
			])
		});

		let scheduler = BlockScheduler::new("test", Arc::new(chain), multicall(), registry, 1);
		let summary = scheduler.walk(&block(11, 132)).await;

		assert_eq!(summary.intervals_triggered, 1);
		assert_eq!(summary.jobs_to_execute, 1);
		let fired = drain(&mut rx).await;
		assert_eq!(fired, vec![("healthy".to_string(), 11, Bytes::from(vec![0x42]))]);
	}

	#[tokio::test]
	async fn test_aggregate_error_skips_resolvers() {
		let registry = Arc::new(JobRegistry::new());
		registry
			.register_resolver(
				"foo",
				resolver(1),
				resolver_callback(|_, _| async { Err(CallbackError::Failed("must not run".to_string())) }),
			)
			.await
			.unwrap();

		let mut chain = MockChainInterface::new();
		chain
			.expect_aggregate()
			.returning(|_, _, _| Err(ChainError::Rpc("execution reverted".to_string())));

		let scheduler = BlockScheduler::new("test", Arc::new(chain), multicall(), registry, 4);
		let summary = scheduler.walk(&block(12, 144)).await;
		assert_eq!(summary.resolvers_called, 1);
		assert_eq!(summary.jobs_to_execute, 0);
	}
}
