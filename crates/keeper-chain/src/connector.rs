//! Per-network block subscription.
//!
//! The connector turns pushed block numbers into fetched block observations,
//! keeps the cached chain state current, announces every block to the
//! execution queues and forwards only unseen blocks to the scheduler.

use crate::{BlockDedupIndex, BlockStream, ChainError, ChainInterface};
use futures::StreamExt;
use keeper_types::{
	current_timestamp, truncate_id, BlockObservation, ChainState, NewBlockEvent,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Capacity of the new-block broadcast. Receivers further behind lose the
/// oldest announcements.
const NEW_BLOCK_CHANNEL_CAPACITY: usize = 64;

/// Shared block handling state, used by the connector and its listener task.
struct BlockTracker {
	network: String,
	chain: Arc<dyn ChainInterface>,
	state: Arc<RwLock<ChainState>>,
	dedup: Mutex<BlockDedupIndex>,
	new_blocks: broadcast::Sender<NewBlockEvent>,
	/// Set once the node ends the block subscription.
	stream_closed: watch::Sender<bool>,
}

impl BlockTracker {
	/// Fetches the block, updates the cache, announces it and returns it if
	/// it should be walked.
	async fn on_block_number(&self, number: u64) -> Result<Option<BlockObservation>, ChainError> {
		let started = Instant::now();
		let block = self
			.chain
			.get_block(Some(number))
			.await?
			.ok_or_else(|| ChainError::Rpc(format!("Block {} not found", number)))?;

		self.state.write().await.apply(&block);

		// Fails only when nobody is listening.
		let _ = self.new_blocks.send(NewBlockEvent {
			number: block.number,
			timestamp: block.timestamp,
		});

		tracing::info!(
			network = %self.network,
			block_number = block.number,
			timestamp = block.timestamp,
			hash = %truncate_id(&block.hash.to_string()),
			tx_count = block.tx_count,
			base_fee = block.base_fee.unwrap_or_default(),
			fetch_ms = started.elapsed().as_millis() as u64,
			delay_secs = current_timestamp().saturating_sub(block.timestamp),
			"New block"
		);

		let unseen = self.dedup.lock().await.observe(block.number, block.hash);
		if !unseen {
			tracing::debug!(
				network = %self.network,
				block_number = block.number,
				"Block already walked, skipping"
			);
		}
		Ok(unseen.then_some(block))
	}
}

/// Live connection of one network to its chain.
pub struct ChainConnector {
	rpc: String,
	tracker: Arc<BlockTracker>,
	is_listening: AtomicBool,
	stop_signal: Mutex<Option<mpsc::Sender<()>>>,
	listener: Mutex<Option<JoinHandle<()>>>,
}

impl ChainConnector {
	/// Creates a connector remembering the last `block_history_size` block numbers.
	pub fn new(
		network: impl Into<String>,
		rpc: impl Into<String>,
		chain: Arc<dyn ChainInterface>,
		block_history_size: usize,
	) -> Self {
		let (new_blocks, _) = broadcast::channel(NEW_BLOCK_CHANNEL_CAPACITY);
		let (stream_closed, _) = watch::channel(false);
		Self {
			rpc: rpc.into(),
			tracker: Arc::new(BlockTracker {
				network: network.into(),
				chain,
				state: Arc::new(RwLock::new(ChainState::default())),
				dedup: Mutex::new(BlockDedupIndex::new(block_history_size)),
				new_blocks,
				stream_closed,
			}),
			is_listening: AtomicBool::new(false),
			stop_signal: Mutex::new(None),
			listener: Mutex::new(None),
		}
	}

	pub fn rpc(&self) -> &str {
		&self.rpc
	}

	pub fn chain(&self) -> &Arc<dyn ChainInterface> {
		&self.tracker.chain
	}

	/// Queries the chain id and the latest block and caches them.
	pub async fn init(&self) -> Result<ChainState, ChainError> {
		let chain_id = self.tracker.chain.get_chain_id().await?;
		let latest = self
			.tracker
			.chain
			.get_block(None)
			.await?
			.ok_or_else(|| ChainError::Rpc("Latest block not found".to_string()))?;

		let mut state = self.tracker.state.write().await;
		state.chain_id = chain_id;
		state.apply(&latest);
		Ok(state.clone())
	}

	/// Opens the block subscription and forwards walkable blocks to `accepted`.
	pub async fn start(&self, accepted: mpsc::UnboundedSender<BlockObservation>) -> Result<(), ChainError> {
		if self.is_listening.swap(true, Ordering::SeqCst) {
			return Err(ChainError::AlreadyStarted);
		}

		let stream = match self.tracker.chain.subscribe_blocks().await {
			Ok(stream) => stream,
			Err(e) => {
				self.is_listening.store(false, Ordering::SeqCst);
				return Err(e);
			},
		};

		let (stop_tx, stop_rx) = mpsc::channel(1);
		*self.stop_signal.lock().await = Some(stop_tx);
		self.tracker.stream_closed.send_replace(false);

		let tracker = self.tracker.clone();
		let handle = tokio::spawn(async move {
			Self::listening_loop(tracker, stream, accepted, stop_rx).await;
		});
		*self.listener.lock().await = Some(handle);

		Ok(())
	}

	/// Tears down the subscription. Calling it again is a no-op.
	pub async fn stop(&self) {
		if !self.is_listening.swap(false, Ordering::SeqCst) {
			return;
		}

		if let Some(stop_tx) = self.stop_signal.lock().await.take() {
			let _ = stop_tx.send(()).await;
		}
		if let Some(handle) = self.listener.lock().await.take() {
			if let Err(e) = handle.await {
				tracing::warn!(network = %self.tracker.network, "Block listener ended abnormally: {}", e);
			}
		}
	}

	pub fn is_listening(&self) -> bool {
		self.is_listening.load(Ordering::SeqCst)
	}

	/// Handles one pushed block number as the listener would.
	///
	/// Returns the observation if it triggers a walk.
	pub async fn handle_block_number(&self, number: u64) -> Result<Option<BlockObservation>, ChainError> {
		self.tracker.on_block_number(number).await
	}

	/// Receiver of every fetched block, walked or not.
	pub fn subscribe_new_blocks(&self) -> broadcast::Receiver<NewBlockEvent> {
		self.tracker.new_blocks.subscribe()
	}

	pub fn new_block_sender(&self) -> broadcast::Sender<NewBlockEvent> {
		self.tracker.new_blocks.clone()
	}

	/// Flag raised when the node ends the block subscription.
	///
	/// The new-block broadcast itself stays open for the lifetime of the
	/// connector, so waiters on announcements must also watch this flag.
	pub fn stream_closed(&self) -> watch::Receiver<bool> {
		self.tracker.stream_closed.subscribe()
	}

	/// Snapshot of the cached chain state.
	pub async fn state(&self) -> ChainState {
		self.tracker.state.read().await.clone()
	}

	/// Shared handle on the cached chain state.
	pub fn state_handle(&self) -> Arc<RwLock<ChainState>> {
		self.tracker.state.clone()
	}

	async fn listening_loop(
		tracker: Arc<BlockTracker>,
		mut stream: BlockStream,
		accepted: mpsc::UnboundedSender<BlockObservation>,
		mut stop_rx: mpsc::Receiver<()>,
	) {
		loop {
			tokio::select! {
				next = stream.next() => {
					let Some(number) = next else {
						tracing::warn!(network = %tracker.network, "Block subscription closed by the node");
						tracker.stream_closed.send_replace(true);
						break;
					};
					match tracker.on_block_number(number).await {
						Ok(Some(block)) => {
							if accepted.send(block).is_err() {
								tracing::debug!(network = %tracker.network, "Block consumer dropped, stopping listener");
								tracker.stream_closed.send_replace(true);
								break;
							}
						}
						Ok(None) => {}
						Err(e) => {
							tracing::warn!(network = %tracker.network, block_number = number, "Failed to process block: {}", e);
						}
					}
				}
				_ = stop_rx.recv() => {
					break;
				}
			}
		}
	}
}
