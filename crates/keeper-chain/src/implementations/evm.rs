//! Alloy-based EVM chain implementation.
//!
//! One WebSocket provider per network serves the block subscription, the
//! reads and the worker transactions. The wallet holds every worker key of
//! the network and signs with the key matching the request's `from`.

use crate::{is_streaming_endpoint, multicall, BlockStream, ChainError, ChainInterface};
use alloy::eips::BlockNumberOrTag;
use alloy::network::EthereumWallet;
use alloy::primitives::{Address, Bytes, B256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use keeper_types::{
	AggregateCall, AggregateResult, BlockObservation, SecretString, TransactionReceipt,
};
use std::sync::Arc;

/// Alloy WebSocket chain client.
pub struct AlloyChain {
	provider: DynProvider,
}

impl AlloyChain {
	/// Connects to `rpc` and registers a signer for each worker key.
	pub async fn connect(rpc: &str, worker_keys: &[SecretString]) -> Result<Self, ChainError> {
		if !is_streaming_endpoint(rpc) {
			return Err(ChainError::UnsupportedEndpoint(rpc.to_string()));
		}

		let mut signers = worker_keys.iter().map(parse_signer);

		let ws = WsConnect::new(rpc);
		let provider = match signers.next().transpose()? {
			Some(first) => {
				let mut wallet = EthereumWallet::new(first);
				for signer in signers {
					wallet.register_signer(signer?);
				}
				ProviderBuilder::new()
					.wallet(wallet)
					.connect_ws(ws)
					.await
					.map_err(|e| ChainError::Connection(format!("Failed to connect to {}: {}", rpc, e)))?
					.erased()
			},
			None => ProviderBuilder::new()
				.connect_ws(ws)
				.await
				.map_err(|e| ChainError::Connection(format!("Failed to connect to {}: {}", rpc, e)))?
				.erased(),
		};

		Ok(Self { provider })
	}
}

fn parse_signer(key: &SecretString) -> Result<PrivateKeySigner, ChainError> {
	key.expose_secret()
		.parse::<PrivateKeySigner>()
		.map_err(|e| ChainError::Connection(format!("Invalid worker private key: {}", e)))
}

fn rpc_error(context: &str, error: impl std::fmt::Display) -> ChainError {
	ChainError::Rpc(format!("{}: {}", context, error))
}

#[async_trait]
impl ChainInterface for AlloyChain {
	async fn subscribe_blocks(&self) -> Result<BlockStream, ChainError> {
		let subscription = self
			.provider
			.subscribe_blocks()
			.await
			.map_err(|e| ChainError::Connection(format!("Failed to subscribe to new blocks: {}", e)))?;

		Ok(subscription.into_stream().map(|header| header.number).boxed())
	}

	async fn get_block(&self, number: Option<u64>) -> Result<Option<BlockObservation>, ChainError> {
		let tag = number.map_or(BlockNumberOrTag::Latest, BlockNumberOrTag::Number);
		let block = self
			.provider
			.get_block_by_number(tag)
			.await
			.map_err(|e| rpc_error("Failed to get block", e))?;

		Ok(block.map(|block| BlockObservation {
			number: block.header.number,
			hash: block.header.hash,
			timestamp: block.header.timestamp,
			base_fee: block.header.base_fee_per_gas.map(u128::from),
			tx_count: block.transactions.len(),
		}))
	}

	async fn get_chain_id(&self) -> Result<u64, ChainError> {
		self.provider
			.get_chain_id()
			.await
			.map_err(|e| rpc_error("Failed to get chain id", e))
	}

	async fn aggregate(
		&self,
		multicall: Address,
		require_success: bool,
		calls: Vec<AggregateCall>,
	) -> Result<Vec<AggregateResult>, ChainError> {
		let data = multicall::encode_try_aggregate(require_success, &calls);
		let response = self.call(multicall, data).await?;
		multicall::decode_try_aggregate(&response)
	}

	async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ChainError> {
		let request = TransactionRequest::default().to(to).input(data.into());
		self.provider
			.call(request)
			.await
			.map_err(|e| rpc_error("Call failed", e))
	}

	async fn get_gas_price(&self) -> Result<u128, ChainError> {
		self.provider
			.get_gas_price()
			.await
			.map_err(|e| rpc_error("Failed to get gas price", e))
	}

	async fn get_max_priority_fee(&self) -> Result<u128, ChainError> {
		self.provider
			.get_max_priority_fee_per_gas()
			.await
			.map_err(|e| rpc_error("Failed to get max priority fee", e))
	}

	async fn estimate_gas(&self, tx: TransactionRequest) -> Result<u64, ChainError> {
		self.provider
			.estimate_gas(tx)
			.await
			.map_err(|e| rpc_error("Gas estimation failed", e))
	}

	async fn get_nonce(&self, address: Address) -> Result<u64, ChainError> {
		self.provider
			.get_transaction_count(address)
			.pending()
			.await
			.map_err(|e| rpc_error("Failed to get nonce", e))
	}

	async fn send_transaction(&self, tx: TransactionRequest) -> Result<B256, ChainError> {
		let pending = self
			.provider
			.send_transaction(tx)
			.await
			.map_err(|e| rpc_error("Failed to send transaction", e))?;
		Ok(*pending.tx_hash())
	}

	async fn get_receipt(&self, hash: B256) -> Result<Option<TransactionReceipt>, ChainError> {
		let receipt = self
			.provider
			.get_transaction_receipt(hash)
			.await
			.map_err(|e| rpc_error("Failed to get receipt", e))?;

		Ok(receipt.map(|receipt| TransactionReceipt {
			hash: receipt.transaction_hash,
			block_number: receipt.block_number.unwrap_or_default(),
			success: receipt.status(),
			gas_used: receipt.gas_used,
		}))
	}
}

/// Factory function connecting an [`AlloyChain`] for a network.
pub fn create_ws_chain(
	rpc: String,
	worker_keys: Vec<SecretString>,
) -> BoxFuture<'static, Result<Arc<dyn ChainInterface>, ChainError>> {
	async move {
		let chain = AlloyChain::connect(&rpc, &worker_keys).await?;
		tracing::info!(component = "chain", implementation = "alloy_ws", rpc = %rpc, "Connected");
		Ok(Arc::new(chain) as Arc<dyn ChainInterface>)
	}
	.boxed()
}
