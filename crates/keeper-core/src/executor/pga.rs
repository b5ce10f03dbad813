//! Priority gas auction fee policy.

/// EIP-1559 fees for a worker transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgaFees {
	pub max_fee_per_gas: u128,
	pub max_priority_fee_per_gas: u128,
}

/// Computes fees from the latest base fee and the node's priority fee
/// suggestion.
///
/// The priority fee is the suggestion capped by `priority_fee_cap`; the max
/// fee leaves room for two full base fee increases on top of it.
pub fn compute_fees(base_fee: u128, suggested_priority_fee: u128, priority_fee_cap: Option<u128>) -> PgaFees {
	let priority = match priority_fee_cap {
		Some(cap) => suggested_priority_fee.min(cap),
		None => suggested_priority_fee,
	};
	PgaFees {
		max_fee_per_gas: base_fee.saturating_mul(2).saturating_add(priority),
		max_priority_fee_per_gas: priority,
	}
}
