//! Keeper engine running every configured network.
//!
//! The engine owns the networks built from the configuration. Networks run
//! independently of each other; the engine starts them, exposes their status
//! and stops them on shutdown.

pub mod lifecycle;

use crate::network::{Network, NetworkError};
use keeper_config::Config;
use keeper_types::NetworkStatus;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
	#[error(transparent)]
	Network(#[from] NetworkError),
	#[error("Service error: {0}")]
	Service(String),
}

/// Main keeper engine.
#[derive(Clone)]
pub struct KeeperEngine {
	pub(crate) config: Config,
	pub(crate) networks: Vec<Arc<Network>>,
}

impl KeeperEngine {
	pub fn new(config: Config, networks: Vec<Arc<Network>>) -> Self {
		Self { config, networks }
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn networks(&self) -> &[Arc<Network>] {
		&self.networks
	}

	pub fn network(&self, name: &str) -> Option<&Arc<Network>> {
		self.networks.iter().find(|network| network.name() == name)
	}

	/// Status snapshots of all networks, in configuration order.
	pub async fn status(&self) -> Vec<NetworkStatus> {
		let mut statuses = Vec::with_capacity(self.networks.len());
		for network in &self.networks {
			statuses.push(network.status().await);
		}
		statuses
	}

	/// Runs until ctrl-c, then shuts every network down.
	pub async fn run(&self) -> Result<(), EngineError> {
		tokio::signal::ctrl_c()
			.await
			.map_err(|e| EngineError::Service(format!("Failed to listen for shutdown signal: {}", e)))?;

		self.shutdown().await
	}
}
