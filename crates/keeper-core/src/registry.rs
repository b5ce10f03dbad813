//! Job registrations of a network.
//!
//! Interval and resolver registrations live in two separate insertion-ordered
//! maps, so a key may be used once per kind. The block scheduler reads
//! snapshots of both maps; callbacks are shared with it by `Arc`.

use crate::CallbackError;
use async_trait::async_trait;
use indexmap::IndexMap;
use keeper_types::{
	is_valid_job_key, Bytes, JobKind, Resolver, ResolverCallbackStatus, TimeoutCallbackStatus,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors returned by registration operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
	#[error("Invalid {kind} callback key '{key}': must be at least 3 characters")]
	InvalidKey { kind: JobKind, key: String },
	#[error("Duplicate {kind} callback key '{key}'")]
	DuplicateKey { kind: JobKind, key: String },
}

/// Callback of an interval job, invoked with the block number and timestamp.
#[async_trait]
pub trait IntervalCallback: Send + Sync {
	async fn on_interval(&self, block_number: u64, block_timestamp: u64) -> Result<(), CallbackError>;
}

#[async_trait]
impl<F, Fut> IntervalCallback for F
where
	F: Fn(u64, u64) -> Fut + Send + Sync,
	Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
{
	async fn on_interval(&self, block_number: u64, block_timestamp: u64) -> Result<(), CallbackError> {
		(self)(block_number, block_timestamp).await
	}
}

/// Callback of a resolver job, invoked with the block number and the
/// payload returned by a matching resolver.
#[async_trait]
pub trait ResolverCallback: Send + Sync {
	async fn on_resolved(&self, block_number: u64, payload: Bytes) -> Result<(), CallbackError>;
}

#[async_trait]
impl<F, Fut> ResolverCallback for F
where
	F: Fn(u64, Bytes) -> Fut + Send + Sync,
	Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
{
	async fn on_resolved(&self, block_number: u64, payload: Bytes) -> Result<(), CallbackError> {
		(self)(block_number, payload).await
	}
}

/// Wraps an async closure as an interval callback.
pub fn interval_callback<F, Fut>(f: F) -> Arc<dyn IntervalCallback>
where
	F: Fn(u64, u64) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
{
	Arc::new(f)
}

/// Wraps an async closure as a resolver callback.
pub fn resolver_callback<F, Fut>(f: F) -> Arc<dyn ResolverCallback>
where
	F: Fn(u64, Bytes) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
{
	Arc::new(f)
}

struct IntervalJob {
	trigger_after: u64,
	callback: Arc<dyn IntervalCallback>,
}

struct ResolverJob {
	resolver: Resolver,
	callback: Arc<dyn ResolverCallback>,
}

/// Interval job due in a block.
pub struct DueInterval {
	pub key: String,
	pub callback: Arc<dyn IntervalCallback>,
}

/// Resolver job to be checked in a block.
pub struct ResolverEntry {
	pub key: String,
	pub resolver: Resolver,
	pub callback: Arc<dyn ResolverCallback>,
}

fn validate_key(kind: JobKind, key: &str) -> Result<(), RegistryError> {
	if is_valid_job_key(key) {
		Ok(())
	} else {
		Err(RegistryError::InvalidKey {
			kind,
			key: key.to_string(),
		})
	}
}

/// Interval and resolver registrations of one network.
#[derive(Default)]
pub struct JobRegistry {
	intervals: RwLock<IndexMap<String, IntervalJob>>,
	resolvers: RwLock<IndexMap<String, ResolverJob>>,
}

impl JobRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers an interval job firing on every block with
	/// `timestamp >= trigger_after` until it is unregistered.
	pub async fn register_timeout(
		&self,
		key: &str,
		trigger_after: u64,
		callback: Arc<dyn IntervalCallback>,
	) -> Result<(), RegistryError> {
		validate_key(JobKind::Interval, key)?;
		let mut intervals = self.intervals.write().await;
		if intervals.contains_key(key) {
			return Err(RegistryError::DuplicateKey {
				kind: JobKind::Interval,
				key: key.to_string(),
			});
		}
		intervals.insert(
			key.to_string(),
			IntervalJob {
				trigger_after,
				callback,
			},
		);
		Ok(())
	}

	/// Removes an interval job. Removing an absent key succeeds.
	pub async fn unregister_timeout(&self, key: &str) -> Result<(), RegistryError> {
		validate_key(JobKind::Interval, key)?;
		self.intervals.write().await.shift_remove(key);
		Ok(())
	}

	/// Registers a resolver job checked on every accepted block.
	pub async fn register_resolver(
		&self,
		key: &str,
		resolver: Resolver,
		callback: Arc<dyn ResolverCallback>,
	) -> Result<(), RegistryError> {
		validate_key(JobKind::Resolver, key)?;
		let mut resolvers = self.resolvers.write().await;
		if resolvers.contains_key(key) {
			return Err(RegistryError::DuplicateKey {
				kind: JobKind::Resolver,
				key: key.to_string(),
			});
		}
		resolvers.insert(key.to_string(), ResolverJob { resolver, callback });
		Ok(())
	}

	/// Removes a resolver job. Removing an absent key succeeds.
	pub async fn unregister_resolver(&self, key: &str) -> Result<(), RegistryError> {
		validate_key(JobKind::Resolver, key)?;
		self.resolvers.write().await.shift_remove(key);
		Ok(())
	}

	pub async fn contains_timeout(&self, key: &str) -> bool {
		self.intervals.read().await.contains_key(key)
	}

	pub async fn contains_resolver(&self, key: &str) -> bool {
		self.resolvers.read().await.contains_key(key)
	}

	/// Interval jobs whose trigger time has been reached, in registration order.
	pub async fn due_intervals(&self, block_timestamp: u64) -> Vec<DueInterval> {
		self.intervals
			.read()
			.await
			.iter()
			.filter(|(_, job)| job.trigger_after <= block_timestamp)
			.map(|(key, job)| DueInterval {
				key: key.clone(),
				callback: job.callback.clone(),
			})
			.collect()
	}

	/// All resolver jobs in registration order.
	pub async fn resolver_entries(&self) -> Vec<ResolverEntry> {
		self.resolvers
			.read()
			.await
			.iter()
			.map(|(key, job)| ResolverEntry {
				key: key.clone(),
				resolver: job.resolver.clone(),
				callback: job.callback.clone(),
			})
			.collect()
	}

	/// Trigger times of the interval jobs relative to `now`.
	pub async fn timeout_statuses(&self, now: u64) -> BTreeMap<String, TimeoutCallbackStatus> {
		self.intervals
			.read()
			.await
			.iter()
			.map(|(key, job)| {
				let status = TimeoutCallbackStatus {
					callback_at: job.trigger_after,
					callback_in: seconds_until(job.trigger_after, now),
				};
				(key.clone(), status)
			})
			.collect()
	}

	pub async fn resolver_statuses(&self) -> BTreeMap<String, ResolverCallbackStatus> {
		self.resolvers
			.read()
			.await
			.iter()
			.map(|(key, job)| {
				let status = ResolverCallbackStatus {
					target: job.resolver.target,
					calldata: job.resolver.calldata.clone(),
				};
				(key.clone(), status)
			})
			.collect()
	}
}

/// Signed distance from `now` to `at`, saturating at the `i64` bounds.
fn seconds_until(at: u64, now: u64) -> i64 {
	(i128::from(at) - i128::from(now)).clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

#[cfg(test)]
mod tests {
	use super::*;
	use keeper_types::Address;

	fn noop_interval() -> Arc<dyn IntervalCallback> {
		interval_callback(|_, _| async { Ok(()) })
	}

	fn noop_resolver() -> Arc<dyn ResolverCallback> {
		resolver_callback(|_, _| async { Ok(()) })
	}

	fn resolver(byte: u8) -> Resolver {
		Resolver {
			target: Address::with_last_byte(byte),
			calldata: Bytes::from(vec![byte]),
		}
	}

	#[tokio::test]
	async fn test_short_keys_rejected_for_both_kinds() {
		let registry = JobRegistry::new();

		let err = registry.register_timeout("ab", 0, noop_interval()).await.unwrap_err();
		assert_eq!(
			err,
			RegistryError::InvalidKey {
				kind: JobKind::Interval,
				key: "ab".to_string()
			}
		);
		let err = registry
			.register_resolver("", resolver(1), noop_resolver())
			.await
			.unwrap_err();
		assert!(matches!(err, RegistryError::InvalidKey { kind: JobKind::Resolver, .. }));

		assert!(registry.unregister_timeout("ab").await.is_err());
		assert!(registry.unregister_resolver("x").await.is_err());
		assert!(registry.due_intervals(u64::MAX).await.is_empty());
	}

	#[tokio::test]
	async fn test_duplicate_key_leaves_registry_unchanged() {
		let registry = JobRegistry::new();
		registry.register_timeout("foo", 100, noop_interval()).await.unwrap();

		let err = registry.register_timeout("foo", 5, noop_interval()).await.unwrap_err();
		assert!(matches!(err, RegistryError::DuplicateKey { .. }));

		let statuses = registry.timeout_statuses(0).await;
		assert_eq!(statuses.len(), 1);
		assert_eq!(statuses["foo"].callback_at, 100);

		// The same key is free in the other map.
		registry
			.register_resolver("foo", resolver(1), noop_resolver())
			.await
			.unwrap();
		assert!(registry.contains_resolver("foo").await);
	}

	#[tokio::test]
	async fn test_unregister_is_idempotent() {
		let registry = JobRegistry::new();
		registry.register_timeout("foo", 0, noop_interval()).await.unwrap();

		registry.unregister_timeout("foo").await.unwrap();
		registry.unregister_timeout("foo").await.unwrap();
		registry.unregister_resolver("missing").await.unwrap();
		assert!(!registry.contains_timeout("foo").await);

		// A removed key can be registered again.
		registry.register_timeout("foo", 0, noop_interval()).await.unwrap();
	}

	#[tokio::test]
	async fn test_due_intervals_are_continuous() {
		let registry = JobRegistry::new();
		registry.register_timeout("early", 100, noop_interval()).await.unwrap();
		registry.register_timeout("late", 200, noop_interval()).await.unwrap();

		assert!(registry.due_intervals(99).await.is_empty());
		let due: Vec<_> = registry.due_intervals(100).await.into_iter().map(|d| d.key).collect();
		assert_eq!(due, vec!["early"]);
		// Still due on later blocks: registrations are not consumed by firing.
		let due: Vec<_> = registry.due_intervals(250).await.into_iter().map(|d| d.key).collect();
		assert_eq!(due, vec!["early", "late"]);
	}

	#[tokio::test]
	async fn test_resolver_entries_keep_registration_order() {
		let registry = JobRegistry::new();
		for (key, byte) in [("zeta", 3u8), ("alpha", 1), ("mid", 2)] {
			registry
				.register_resolver(key, resolver(byte), noop_resolver())
				.await
				.unwrap();
		}
		registry.unregister_resolver("alpha").await.unwrap();
		registry
			.register_resolver("alpha", resolver(1), noop_resolver())
			.await
			.unwrap();

		let keys: Vec<_> = registry.resolver_entries().await.into_iter().map(|e| e.key).collect();
		assert_eq!(keys, vec!["zeta", "mid", "alpha"]);
	}

	#[tokio::test]
	async fn test_timeout_status_counts_down() {
		let registry = JobRegistry::new();
		registry.register_timeout("soon", 1_000, noop_interval()).await.unwrap();
		registry.register_timeout("past", 900, noop_interval()).await.unwrap();

		let statuses = registry.timeout_statuses(950).await;
		assert_eq!(statuses["soon"].callback_in, 50);
		assert_eq!(statuses["past"].callback_in, -50);

		let resolvers = registry.resolver_statuses().await;
		assert!(resolvers.is_empty());
	}

	#[tokio::test]
	async fn test_timeout_status_far_future_saturates() {
		let registry = JobRegistry::new();
		registry.register_timeout("far", 1 << 63, noop_interval()).await.unwrap();
		registry.register_timeout("never", u64::MAX, noop_interval()).await.unwrap();

		let statuses = registry.timeout_statuses(1_700_000_000).await;
		assert_eq!(statuses["far"].callback_at, 1 << 63);
		assert_eq!(statuses["far"].callback_in, i64::MAX - 1_699_999_999);
		assert_eq!(statuses["never"].callback_in, i64::MAX);
		assert_eq!(seconds_until(0, u64::MAX), i64::MIN);
	}
}
