//! Job types for the block-driven scheduler.
//!
//! Jobs come in two kinds: interval jobs fire once the block timestamp
//! reaches their trigger time, resolver jobs fire when an on-chain view
//! function reports that work is available.

use alloy::primitives::{Address, Bytes};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Shortest accepted job key.
pub const MIN_JOB_KEY_LENGTH: usize = 3;

/// The two registration maps a job key can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
	Interval,
	Resolver,
}

impl fmt::Display for JobKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			JobKind::Interval => write!(f, "interval"),
			JobKind::Resolver => write!(f, "resolver"),
		}
	}
}

/// Returns true if the key is long enough to be registered.
pub fn is_valid_job_key(key: &str) -> bool {
	key.len() >= MIN_JOB_KEY_LENGTH
}

/// On-chain condition check of a resolver job.
///
/// The target is called statically with `calldata` and must return an
/// ABI-encoded `(bool matched, bytes payload)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolver {
	pub target: Address,
	pub calldata: Bytes,
}

/// One leg of an aggregated read call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateCall {
	pub target: Address,
	pub calldata: Bytes,
}

impl From<&Resolver> for AggregateCall {
	fn from(resolver: &Resolver) -> Self {
		Self {
			target: resolver.target,
			calldata: resolver.calldata.clone(),
		}
	}
}

/// Result of one leg of an aggregated read call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateResult {
	pub success: bool,
	pub return_data: Bytes,
}
