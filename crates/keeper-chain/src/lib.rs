//! Chain access module for the keeper.
//!
//! This module abstracts everything the keeper reads from or sends to an EVM
//! node behind the [`ChainInterface`] trait, and builds the per-network
//! [`ChainConnector`] on top of it: the streaming block subscription, the
//! cached chain state, block de-duplication and the new-block broadcast.

use alloy::primitives::{Address, Bytes, B256};
use alloy::rpc::types::TransactionRequest;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use keeper_types::{AggregateCall, AggregateResult, BlockObservation, SecretString, TransactionReceipt};
use std::sync::Arc;
use thiserror::Error;

mod connector;
mod dedup;
pub mod multicall;

/// Concrete chain implementations.
pub mod implementations {
	pub mod detached;
	pub mod evm;
}

pub use connector::ChainConnector;
pub use dedup::BlockDedupIndex;
pub use keeper_types::is_streaming_endpoint;
pub use multicall::decode_resolver_output;

/// Errors that can occur while talking to a chain.
#[derive(Debug, Error)]
pub enum ChainError {
	/// The connection could not be established or was lost.
	#[error("Connection error: {0}")]
	Connection(String),
	/// A request was rejected or failed on the node.
	#[error("RPC error: {0}")]
	Rpc(String),
	/// Returned data did not have the expected shape.
	#[error("Decode error: {0}")]
	Decode(String),
	/// The endpoint cannot push new block headers.
	#[error("Unsupported endpoint '{0}': a ws:// or wss:// endpoint is required")]
	UnsupportedEndpoint(String),
	/// The block subscription is already running.
	#[error("Block subscription already started")]
	AlreadyStarted,
}

/// Stream of block numbers pushed by the node.
pub type BlockStream = BoxStream<'static, u64>;

/// Trait defining the node operations the keeper depends on.
///
/// Implementations sign transactions for every worker key they were created
/// with; the `from` field of a request selects the signer.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ChainInterface: Send + Sync {
	/// Opens a push subscription to new block headers.
	async fn subscribe_blocks(&self) -> Result<BlockStream, ChainError>;

	/// Fetches a block by number, or the latest block when `number` is `None`.
	async fn get_block(&self, number: Option<u64>) -> Result<Option<BlockObservation>, ChainError>;

	async fn get_chain_id(&self) -> Result<u64, ChainError>;

	/// Executes one static call through the aggregator at `multicall`.
	///
	/// With `require_success` unset, a failing leg is reported as
	/// `success = false` instead of failing the whole call. Results are
	/// positional: entry `i` belongs to `calls[i]`.
	async fn aggregate(
		&self,
		multicall: Address,
		require_success: bool,
		calls: Vec<AggregateCall>,
	) -> Result<Vec<AggregateResult>, ChainError>;

	/// Generic read-only call.
	async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ChainError>;

	/// Current legacy gas price in wei.
	async fn get_gas_price(&self) -> Result<u128, ChainError>;

	/// Priority fee suggested by the node, in wei.
	async fn get_max_priority_fee(&self) -> Result<u128, ChainError>;

	async fn estimate_gas(&self, tx: TransactionRequest) -> Result<u64, ChainError>;

	/// Pending nonce of an account.
	async fn get_nonce(&self, address: Address) -> Result<u64, ChainError>;

	/// Signs and broadcasts a transaction, returning its hash.
	async fn send_transaction(&self, tx: TransactionRequest) -> Result<B256, ChainError>;

	/// Returns the receipt if the transaction has been included.
	async fn get_receipt(&self, hash: B256) -> Result<Option<TransactionReceipt>, ChainError>;
}

/// Type alias for chain factory functions.
///
/// Takes the endpoint and the worker keys the chain must be able to sign
/// for, and connects asynchronously.
pub type ChainFactory =
	fn(String, Vec<SecretString>) -> BoxFuture<'static, Result<Arc<dyn ChainInterface>, ChainError>>;

