//! Single-flight transaction execution queue of an agent.
//!
//! Envelopes pushed by job callbacks are processed strictly in order by one
//! worker task: estimate, submit, monitor block by block until inclusion,
//! then resolve the envelope's completion handle. Stalled transactions are
//! handled by the envelope's callbacks, which may replace or cancel them at
//! the same nonce.

pub mod pga;

use alloy::primitives::{Address, B256, U256};
use alloy::rpc::types::TransactionRequest;
use async_trait::async_trait;
use keeper_chain::{ChainError, ChainInterface};
use keeper_types::{
	truncate_id, ChainState, EnvelopeSummary, GasAction, GasUpdateDecision, NewBlockEvent,
	QueueStatus, QueuedEnvelope, TransactionOutcome,
};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::instrument;

pub use pga::{compute_fees, PgaFees};

/// Gas limit of the zero-value self-transfer used to cancel a transaction.
const CANCEL_GAS_LIMIT: u64 = 21_000;

/// Errors returned by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
	#[error("Job '{0}' already has a queued or active transaction")]
	DuplicateJob(String),
	#[error("Queue closed before job '{0}' completed")]
	Closed(String),
}

/// Hooks invoked while an envelope is processed.
///
/// Every method has a default, so implementors only override what they need.
#[async_trait]
pub trait ExecutorCallbacks: Send + Sync {
	async fn on_estimation_failed(&self, _error: &ChainError) {}

	async fn on_execution_failed(&self, _error: &ChainError) {}

	/// Asked on every block the transaction is still pending.
	async fn on_not_mined_in_block(&self, _tx: &TransactionRequest) -> GasUpdateDecision {
		GasUpdateDecision::ignore()
	}
}

/// Callbacks that only rely on the defaults: failures are dropped and a
/// pending transaction is left alone.
pub struct DefaultCallbacks;

impl ExecutorCallbacks for DefaultCallbacks {}

/// Unsigned transaction of a job together with its callbacks.
#[derive(Clone)]
pub struct TransactionEnvelope {
	pub job_key: String,
	pub tx: TransactionRequest,
	pub callbacks: Arc<dyn ExecutorCallbacks>,
}

impl TransactionEnvelope {
	pub fn new(job_key: impl Into<String>, tx: TransactionRequest) -> Self {
		Self {
			job_key: job_key.into(),
			tx,
			callbacks: Arc::new(DefaultCallbacks),
		}
	}

	pub fn with_callbacks(mut self, callbacks: Arc<dyn ExecutorCallbacks>) -> Self {
		self.callbacks = callbacks;
		self
	}

	pub fn summary(&self) -> EnvelopeSummary {
		EnvelopeSummary {
			job_key: self.job_key.clone(),
			to: self.tx.to.and_then(|kind| kind.to().copied()),
			data: self.tx.input.input().cloned(),
			value: self.tx.value,
		}
	}
}

/// Resolves once the pushed envelope reaches a terminal state.
pub struct CompletionHandle {
	key: String,
	receiver: oneshot::Receiver<TransactionOutcome>,
}

impl CompletionHandle {
	pub fn key(&self) -> &str {
		&self.key
	}

	pub async fn wait(self) -> Result<TransactionOutcome, QueueError> {
		self.receiver.await.map_err(|_| QueueError::Closed(self.key))
	}
}

/// Everything the worker needs from its network.
#[derive(Clone)]
pub struct QueueContext {
	pub name: String,
	pub chain: Arc<dyn ChainInterface>,
	pub worker_address: Address,
	pub chain_state: Arc<RwLock<ChainState>>,
	pub new_blocks: broadcast::Sender<NewBlockEvent>,
	/// Raised when the node ends the block subscription.
	pub stream_closed: watch::Receiver<bool>,
	pub max_priority_fee_cap: Option<u128>,
}

struct QueueEntry {
	key: String,
	envelope: TransactionEnvelope,
	done: oneshot::Sender<TransactionOutcome>,
}

#[derive(Default)]
struct QueueState {
	current: Option<(String, EnvelopeSummary)>,
	pending: VecDeque<QueueEntry>,
	processing: bool,
}

impl QueueState {
	fn has_job(&self, key: &str) -> bool {
		self.current.as_ref().is_some_and(|(current, _)| current == key)
			|| self.pending.iter().any(|entry| entry.key == key)
	}
}

/// FIFO transaction queue with one in-flight transaction at a time.
pub struct ExecutionQueue {
	context: Arc<QueueContext>,
	state: Arc<Mutex<QueueState>>,
	wakeup: Arc<Notify>,
	worker: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionQueue {
	pub fn new(context: QueueContext) -> Self {
		Self {
			context: Arc::new(context),
			state: Arc::new(Mutex::new(QueueState::default())),
			wakeup: Arc::new(Notify::new()),
			worker: Mutex::new(None),
		}
	}

	pub fn worker_address(&self) -> Address {
		self.context.worker_address
	}

	/// Starts the worker task. Calling it again is a no-op.
	pub async fn init(&self) {
		let mut worker = self.worker.lock().await;
		if worker.is_some() {
			return;
		}

		let context = self.context.clone();
		let state = self.state.clone();
		let wakeup = self.wakeup.clone();
		*worker = Some(tokio::spawn(async move {
			Self::worker_loop(context, state, wakeup).await;
		}));
	}

	/// Appends an envelope. Fails if `key` is already queued or in flight.
	pub async fn push(
		&self,
		key: impl Into<String>,
		envelope: TransactionEnvelope,
	) -> Result<CompletionHandle, QueueError> {
		let key = key.into();
		let mut state = self.state.lock().await;
		if state.has_job(&key) {
			return Err(QueueError::DuplicateJob(key));
		}

		let (done, receiver) = oneshot::channel();
		state.pending.push_back(QueueEntry {
			key: key.clone(),
			envelope,
			done,
		});
		drop(state);
		self.wakeup.notify_one();

		tracing::debug!(network = %self.context.name, job_key = %key, "Transaction queued");
		Ok(CompletionHandle { key, receiver })
	}

	pub async fn status(&self) -> QueueStatus {
		let state = self.state.lock().await;
		QueueStatus {
			current_tx_key: state.current.as_ref().map(|(key, _)| key.clone()),
			current_tx_envelope: state.current.as_ref().map(|(_, summary)| summary.clone()),
			queue: state
				.pending
				.iter()
				.map(|entry| QueuedEnvelope {
					key: entry.key.clone(),
					envelope: entry.envelope.summary(),
				})
				.collect(),
			queue_handler_lock: state.processing,
		}
	}

	/// Aborts the worker. Handles of unfinished envelopes resolve to
	/// [`QueueError::Closed`].
	pub async fn stop(&self) {
		if let Some(handle) = self.worker.lock().await.take() {
			handle.abort();
			let _ = handle.await;
		}
		let mut state = self.state.lock().await;
		state.pending.clear();
		state.current = None;
		state.processing = false;
	}

	async fn worker_loop(context: Arc<QueueContext>, state: Arc<Mutex<QueueState>>, wakeup: Arc<Notify>) {
		loop {
			let next = {
				let mut state = state.lock().await;
				let next = state.pending.pop_front();
				if let Some(entry) = &next {
					state.current = Some((entry.key.clone(), entry.envelope.summary()));
					state.processing = true;
				}
				next
			};

			let Some(entry) = next else {
				wakeup.notified().await;
				continue;
			};

			let outcome = process_envelope(&context, &entry.key, &entry.envelope).await;

			{
				let mut state = state.lock().await;
				state.current = None;
				state.processing = false;
			}
			// The pusher may have dropped its handle.
			let _ = entry.done.send(outcome);
		}
	}
}

#[instrument(skip_all, fields(network = %context.name, job_key = %key))]
async fn process_envelope(context: &QueueContext, key: &str, envelope: &TransactionEnvelope) -> TransactionOutcome {
	let chain = &context.chain;
	let mut tx = envelope.tx.clone();
	tx.from = Some(context.worker_address);

	let gas = match chain.estimate_gas(tx.clone()).await {
		Ok(gas) => gas,
		Err(e) => {
			tracing::warn!(error = %e, "Gas estimation failed");
			envelope.callbacks.on_estimation_failed(&e).await;
			return TransactionOutcome::EstimationFailed { reason: e.to_string() };
		},
	};
	tx.gas = Some(gas);

	if let Err(e) = apply_nonce_and_fees(context, &mut tx).await {
		tracing::warn!(error = %e, "Failed to prepare transaction");
		envelope.callbacks.on_execution_failed(&e).await;
		return TransactionOutcome::ExecutionFailed { reason: e.to_string() };
	}

	// Blocks seen before the first submission do not count as missed.
	let blocks = context.new_blocks.subscribe();
	let hash = match chain.send_transaction(tx.clone()).await {
		Ok(hash) => hash,
		Err(e) => {
			tracing::warn!(error = %e, "Transaction submission failed");
			envelope.callbacks.on_execution_failed(&e).await;
			return TransactionOutcome::ExecutionFailed { reason: e.to_string() };
		},
	};
	tracing::info!(
		tx_hash = %truncate_id(&hash.to_string()),
		nonce = tx.nonce.unwrap_or_default(),
		gas,
		"Transaction sent"
	);

	monitor(context, envelope, tx, hash, blocks).await
}

async fn apply_nonce_and_fees(context: &QueueContext, tx: &mut TransactionRequest) -> Result<(), ChainError> {
	tx.nonce = Some(context.chain.get_nonce(context.worker_address).await?);

	if tx.max_fee_per_gas.is_none() {
		let suggested = context.chain.get_max_priority_fee().await?;
		let base_fee = context.chain_state.read().await.base_fee;
		let fees = compute_fees(base_fee, suggested, context.max_priority_fee_cap);
		tx.max_fee_per_gas = Some(fees.max_fee_per_gas);
		tx.max_priority_fee_per_gas = Some(fees.max_priority_fee_per_gas);
	}
	Ok(())
}

struct Attempt {
	hash: B256,
	cancellation: bool,
}

/// Waits block by block until one of the submitted attempts is included.
async fn monitor(
	context: &QueueContext,
	envelope: &TransactionEnvelope,
	mut tx: TransactionRequest,
	hash: B256,
	mut blocks: broadcast::Receiver<NewBlockEvent>,
) -> TransactionOutcome {
	let chain = &context.chain;
	let mut attempts = vec![Attempt {
		hash,
		cancellation: false,
	}];

	let mut stream_closed = context.stream_closed.clone();

	loop {
		let next = tokio::select! {
			received = blocks.recv() => match received {
				Ok(event) => Some(event.number),
				Err(RecvError::Lagged(skipped)) => {
					tracing::debug!(skipped, "Missed new block announcements");
					Some(context.chain_state.read().await.latest_block_number)
				},
				Err(RecvError::Closed) => None,
			},
			_ = wait_stream_closed(&mut stream_closed) => None,
		};
		let Some(block_number) = next else {
			let e = ChainError::Connection(format!("Block stream of {} closed", context.name));
			tracing::warn!(error = %e, "Stopped monitoring transaction");
			envelope.callbacks.on_execution_failed(&e).await;
			return TransactionOutcome::ExecutionFailed { reason: e.to_string() };
		};

		// A replacement can only be mined instead of what it replaced, so the
		// newest attempt is the likeliest.
		for attempt in attempts.iter().rev() {
			match chain.get_receipt(attempt.hash).await {
				Ok(Some(receipt)) => {
					if attempt.cancellation {
						tracing::info!(tx_hash = %truncate_id(&receipt.hash.to_string()), "Transaction cancelled");
						return TransactionOutcome::Cancelled { receipt };
					}
					if receipt.success {
						tracing::info!(
							tx_hash = %truncate_id(&receipt.hash.to_string()),
							block_number = receipt.block_number,
							gas_used = receipt.gas_used,
							"Transaction mined"
						);
					} else {
						tracing::warn!(
							tx_hash = %truncate_id(&receipt.hash.to_string()),
							block_number = receipt.block_number,
							"Transaction mined but reverted"
						);
					}
					return TransactionOutcome::Mined { receipt };
				},
				Ok(None) => {},
				Err(e) => {
					tracing::warn!(tx_hash = %truncate_id(&attempt.hash.to_string()), error = %e, "Failed to get receipt");
				},
			}
		}

		if attempts.iter().any(|attempt| attempt.cancellation) {
			continue;
		}

		let decision = envelope.callbacks.on_not_mined_in_block(&tx).await;
		match decision.action {
			GasAction::Ignore => {
				tracing::debug!(block_number, "Transaction not mined yet");
			},
			GasAction::Replace => {
				tx.max_fee_per_gas = Some(decision.new_max_fee);
				tx.max_priority_fee_per_gas = Some(decision.new_priority_fee);
				match chain.send_transaction(tx.clone()).await {
					Ok(hash) => {
						tracing::info!(
							tx_hash = %truncate_id(&hash.to_string()),
							max_fee = decision.new_max_fee,
							priority_fee = decision.new_priority_fee,
							"Transaction replaced"
						);
						attempts.push(Attempt {
							hash,
							cancellation: false,
						});
					},
					Err(e) => tracing::warn!(error = %e, "Replacement submission failed"),
				}
			},
			GasAction::Cancel => {
				let cancel = cancellation_request(context.worker_address, &tx, &decision);
				match chain.send_transaction(cancel).await {
					Ok(hash) => {
						tracing::info!(tx_hash = %truncate_id(&hash.to_string()), "Cancellation sent");
						attempts.push(Attempt {
							hash,
							cancellation: true,
						});
					},
					Err(e) => tracing::warn!(error = %e, "Cancellation submission failed"),
				}
			},
		}
	}
}

/// Resolves once the flag is raised or its connector is gone.
async fn wait_stream_closed(closed: &mut watch::Receiver<bool>) {
	let _ = closed.wait_for(|closed| *closed).await;
}

/// Zero-value self-transfer taking the nonce of `tx`.
///
/// Zero fees in the decision fall back to the fees of `tx`.
fn cancellation_request(worker: Address, tx: &TransactionRequest, decision: &GasUpdateDecision) -> TransactionRequest {
	let pick = |new: u128, current: Option<u128>| if new == 0 { current.unwrap_or_default() } else { new };

	let mut cancel = TransactionRequest::default()
		.from(worker)
		.to(worker)
		.value(U256::ZERO)
		.gas_limit(CANCEL_GAS_LIMIT)
		.max_fee_per_gas(pick(decision.new_max_fee, tx.max_fee_per_gas))
		.max_priority_fee_per_gas(pick(decision.new_priority_fee, tx.max_priority_fee_per_gas));
	cancel.nonce = tx.nonce;
	cancel
}
