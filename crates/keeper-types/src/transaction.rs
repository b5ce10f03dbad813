//! Transaction types for the execution queues.
//!
//! This module defines the receipt returned by the chain, the decision a
//! caller takes for a transaction that was not mined in the last block and
//! the terminal outcome reported to whoever pushed the envelope.

use alloy::primitives::B256;
use serde::{Deserialize, Serialize};

/// Transaction receipt containing execution details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
	/// The hash of the transaction.
	pub hash: B256,
	/// The block number where the transaction was included.
	pub block_number: u64,
	/// Whether the transaction executed successfully.
	pub success: bool,
	pub gas_used: u64,
}

/// What to do with a transaction that was not included in the last block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GasAction {
	/// Keep waiting with the current fees.
	Ignore,
	/// Resubmit at the same nonce with new fees.
	Replace,
	/// Submit a zero-value self-transfer at the same nonce.
	Cancel,
}

/// Gas escalation decision returned by the not-mined policy.
///
/// Fees are only read for `Replace` and `Cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasUpdateDecision {
	pub action: GasAction,
	pub new_max_fee: u128,
	pub new_priority_fee: u128,
}

impl GasUpdateDecision {
	pub fn ignore() -> Self {
		Self {
			action: GasAction::Ignore,
			new_max_fee: 0,
			new_priority_fee: 0,
		}
	}

	pub fn replace(new_max_fee: u128, new_priority_fee: u128) -> Self {
		Self {
			action: GasAction::Replace,
			new_max_fee,
			new_priority_fee,
		}
	}

	pub fn cancel(new_max_fee: u128, new_priority_fee: u128) -> Self {
		Self {
			action: GasAction::Cancel,
			new_max_fee,
			new_priority_fee,
		}
	}
}

impl Default for GasUpdateDecision {
	fn default() -> Self {
		Self::ignore()
	}
}

/// Terminal state of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransactionOutcome {
	/// The job transaction, or one of its replacements, was included.
	Mined { receipt: TransactionReceipt },
	/// The cancelling self-transfer was included instead of the job transaction.
	Cancelled { receipt: TransactionReceipt },
	/// Gas estimation failed; nothing was submitted.
	EstimationFailed { reason: String },
	/// Signing or broadcasting failed, or monitoring could not continue.
	ExecutionFailed { reason: String },
}

impl TransactionOutcome {
	/// Returns the receipt of the included transaction, if any.
	pub fn receipt(&self) -> Option<&TransactionReceipt> {
		match self {
			TransactionOutcome::Mined { receipt } | TransactionOutcome::Cancelled { receipt } => {
				Some(receipt)
			},
			_ => None,
		}
	}

	/// Returns true if the job transaction itself was included.
	pub fn is_mined(&self) -> bool {
		matches!(self, TransactionOutcome::Mined { .. })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_decision_constructors() {
		assert_eq!(GasUpdateDecision::default().action, GasAction::Ignore);

		let replace = GasUpdateDecision::replace(200, 20);
		assert_eq!(replace.action, GasAction::Replace);
		assert_eq!(replace.new_max_fee, 200);
		assert_eq!(replace.new_priority_fee, 20);

		assert_eq!(GasUpdateDecision::cancel(1, 1).action, GasAction::Cancel);
	}

	#[test]
	fn test_outcome_serializes_with_status_tag() {
		let outcome = TransactionOutcome::EstimationFailed {
			reason: "execution reverted".to_string(),
		};
		let json = serde_json::to_value(&outcome).unwrap();
		assert_eq!(json["status"], "estimation_failed");
		assert_eq!(json["reason"], "execution reverted");
		assert!(outcome.receipt().is_none());
		assert!(!outcome.is_mined());
	}
}
