//! ABI helpers for aggregated resolver checks.
//!
//! Resolver checks are batched through `tryAggregate(bool,(address,bytes)[])`
//! which both Multicall2 and Multicall3 expose. Each resolver returns an
//! ABI-encoded `(bool, bytes)` tuple.

use crate::ChainError;
use alloy::primitives::Bytes;
use alloy::sol;
use alloy::sol_types::{SolCall, SolValue};
use keeper_types::{AggregateCall, AggregateResult};

sol! {
	struct MulticallCall {
		address target;
		bytes callData;
	}

	struct MulticallResult {
		bool success;
		bytes returnData;
	}

	function tryAggregate(bool requireSuccess, MulticallCall[] calls)
		external
		returns (MulticallResult[] returnData);
}

/// Encodes the calldata of an aggregated read call.
pub fn encode_try_aggregate(require_success: bool, calls: &[AggregateCall]) -> Bytes {
	let calls = calls
		.iter()
		.map(|call| MulticallCall {
			target: call.target,
			callData: call.calldata.clone(),
		})
		.collect();

	tryAggregateCall {
		requireSuccess: require_success,
		calls,
	}
	.abi_encode()
	.into()
}

/// Decodes the return data of an aggregated read call.
pub fn decode_try_aggregate(data: &[u8]) -> Result<Vec<AggregateResult>, ChainError> {
	let results = tryAggregateCall::abi_decode_returns(data)
		.map_err(|e| ChainError::Decode(format!("Invalid tryAggregate response: {}", e)))?;

	Ok(results
		.into_iter()
		.map(|result| AggregateResult {
			success: result.success,
			return_data: result.returnData,
		})
		.collect())
}

/// Decodes a resolver response as a strict `(bool matched, bytes payload)` tuple.
pub fn decode_resolver_output(data: &[u8]) -> Result<(bool, Bytes), ChainError> {
	<(bool, Bytes)>::abi_decode_params(data)
		.map_err(|e| ChainError::Decode(format!("Invalid resolver response: {}", e)))
}
