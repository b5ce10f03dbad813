//! Chain of a network that was never connected.
//!
//! Networks without agents have nothing to execute, so the builder does not
//! open a connection for them. Every call on this chain fails.

use crate::{BlockStream, ChainError, ChainInterface};
use alloy::primitives::{Address, Bytes, B256};
use alloy::rpc::types::TransactionRequest;
use async_trait::async_trait;
use keeper_types::{AggregateCall, AggregateResult, BlockObservation, TransactionReceipt};

pub struct DetachedChain {
	network: String,
}

impl DetachedChain {
	pub fn new(network: impl Into<String>) -> Self {
		Self { network: network.into() }
	}

	fn refuse<T>(&self) -> Result<T, ChainError> {
		Err(ChainError::Connection(format!(
			"Network '{}' has no agents and is not connected",
			self.network
		)))
	}
}

#[async_trait]
impl ChainInterface for DetachedChain {
	async fn subscribe_blocks(&self) -> Result<BlockStream, ChainError> {
		self.refuse()
	}

	async fn get_block(&self, _number: Option<u64>) -> Result<Option<BlockObservation>, ChainError> {
		self.refuse()
	}

	async fn get_chain_id(&self) -> Result<u64, ChainError> {
		self.refuse()
	}

	async fn aggregate(
		&self,
		_multicall: Address,
		_require_success: bool,
		_calls: Vec<AggregateCall>,
	) -> Result<Vec<AggregateResult>, ChainError> {
		self.refuse()
	}

	async fn call(&self, _to: Address, _data: Bytes) -> Result<Bytes, ChainError> {
		self.refuse()
	}

	async fn get_gas_price(&self) -> Result<u128, ChainError> {
		self.refuse()
	}

	async fn get_max_priority_fee(&self) -> Result<u128, ChainError> {
		self.refuse()
	}

	async fn estimate_gas(&self, _tx: TransactionRequest) -> Result<u64, ChainError> {
		self.refuse()
	}

	async fn get_nonce(&self, _address: Address) -> Result<u64, ChainError> {
		self.refuse()
	}

	async fn send_transaction(&self, _tx: TransactionRequest) -> Result<B256, ChainError> {
		self.refuse()
	}

	async fn get_receipt(&self, _hash: B256) -> Result<Option<TransactionReceipt>, ChainError> {
		self.refuse()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_every_call_names_network() {
		let chain = DetachedChain::new("gnosis");
		let err = chain.get_chain_id().await.unwrap_err();
		assert!(matches!(err, ChainError::Connection(ref message) if message.contains("'gnosis'")));
		assert!(chain.subscribe_blocks().await.is_err());
		assert!(chain.get_receipt(B256::ZERO).await.is_err());
	}
}
