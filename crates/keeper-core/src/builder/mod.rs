//! Construction of the keeper engine from configuration.
//!
//! The builder connects one chain client per enabled network through a
//! factory function, so the service binary decides the transport and tests
//! can substitute mocks. Networks without agents are not connected.

use crate::engine::KeeperEngine;
use crate::network::{Network, NetworkError, NetworkSettings};
use keeper_chain::implementations::detached::DetachedChain;
use keeper_chain::{ChainFactory, ChainInterface};
use keeper_config::Config;
use keeper_types::SecretString;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during engine construction.
#[derive(Debug, Error)]
pub enum BuilderError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error(transparent)]
	Network(#[from] NetworkError),
}

/// Builder for constructing a [`KeeperEngine`].
pub struct KeeperBuilder {
	config: Config,
}

impl KeeperBuilder {
	pub fn new(config: Config) -> Self {
		Self { config }
	}

	/// Connects every enabled network and builds the engine.
	pub async fn build(self, chain_factory: ChainFactory) -> Result<KeeperEngine, BuilderError> {
		let settings = NetworkSettings {
			block_history_size: self.config.keeper.block_history_size,
			max_concurrent_callbacks: self.config.keeper.max_concurrent_callbacks,
		};

		let mut networks = Vec::with_capacity(self.config.networks.enabled.len());
		for name in &self.config.networks.enabled {
			let details = self.config.networks.details.get(name).ok_or_else(|| {
				BuilderError::Config(format!("Network '{}' has no configuration details", name))
			})?;

			if details.agents.is_empty() {
				tracing::warn!(
					component = "network",
					implementation = %name,
					"No agents configured, skipping connection"
				);
				let chain: Arc<dyn ChainInterface> = Arc::new(DetachedChain::new(name.as_str()));
				networks.push(Arc::new(Network::new(name, details, chain, settings)?));
				continue;
			}

			let worker_keys: Vec<SecretString> =
				details.agents.values().map(|agent| agent.private_key.clone()).collect();

			let chain = match chain_factory(details.rpc.clone(), worker_keys).await {
				Ok(chain) => chain,
				Err(e) => {
					tracing::error!(
						component = "network",
						implementation = %name,
						error = %e,
						"Failed to connect network"
					);
					return Err(BuilderError::Config(format!(
						"Failed to connect network '{}': {}",
						name, e
					)));
				},
			};

			let network = Network::new(name, details, chain, settings)?;
			tracing::info!(
				component = "network",
				implementation = %name,
				agents = network.agents().len(),
				"Loaded"
			);
			networks.push(Arc::new(network));
		}

		if networks.is_empty() {
			return Err(BuilderError::Config("No networks available".into()));
		}

		Ok(KeeperEngine::new(self.config, networks))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use futures::future::BoxFuture;
	use futures::FutureExt;
	use keeper_chain::{ChainError, ChainInterface, MockChainInterface};
	use std::str::FromStr;

	const AGENT: &str = "0x00000000000000000000000000000000000000aa";

	fn config(rpcs: &[(&str, &str)]) -> Config {
		let enabled: Vec<String> = rpcs.iter().map(|(name, _)| format!("\"{}\"", name)).collect();
		let mut toml = format!(
			"[keeper]\nid = \"builder-test\"\n\n[networks]\nenabled = [{}]\n",
			enabled.join(", ")
		);
		for (name, rpc) in rpcs {
			toml.push_str(&format!(
				"\n[networks.details.{name}]\nrpc = \"{rpc}\"\n\n[networks.details.{name}.agents.\"{AGENT}\"]\nkeeper_worker_address = \"0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266\"\nprivate_key = \"0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80\"\n"
			));
		}
		Config::from_str(&toml).unwrap()
	}

	fn mock_factory(
		_rpc: String,
		worker_keys: Vec<SecretString>,
	) -> BoxFuture<'static, Result<Arc<dyn ChainInterface>, ChainError>> {
		async move {
			assert_eq!(worker_keys.len(), 1);
			Ok(Arc::new(MockChainInterface::new()) as Arc<dyn ChainInterface>)
		}
		.boxed()
	}

	fn refusing_factory(
		rpc: String,
		_worker_keys: Vec<SecretString>,
	) -> BoxFuture<'static, Result<Arc<dyn ChainInterface>, ChainError>> {
		async move {
			if rpc.contains("down") {
				Err(ChainError::Connection("refused".to_string()))
			} else {
				Ok(Arc::new(MockChainInterface::new()) as Arc<dyn ChainInterface>)
			}
		}
		.boxed()
	}

	#[tokio::test]
	async fn test_builds_every_enabled_network() {
		let config = config(&[("sepolia", "ws://localhost:8546"), ("gnosis", "wss://gnosis.example")]);
		let engine = KeeperBuilder::new(config).build(mock_factory).await.unwrap();

		let names: Vec<_> = engine.networks().iter().map(|n| n.name().to_string()).collect();
		assert_eq!(names, vec!["sepolia", "gnosis"]);
		assert_eq!(engine.network("gnosis").unwrap().agents().len(), 1);
	}

	#[tokio::test]
	async fn test_network_without_agents_not_connected() {
		let mut config = config(&[("sepolia", "ws://localhost:8546"), ("gnosis", "ws://down:8546")]);
		config.networks.details.get_mut("gnosis").unwrap().agents.clear();

		// The refusing endpoint is never dialed.
		let engine = KeeperBuilder::new(config).build(refusing_factory).await.unwrap();
		let gnosis = engine.network("gnosis").unwrap();
		assert!(gnosis.agents().is_empty());
		assert!(matches!(
			gnosis.connector().chain().get_chain_id().await,
			Err(ChainError::Connection(message)) if message.contains("not connected")
		));

		gnosis.init().await.unwrap();
		assert!(!gnosis.is_initialized());
		assert!(!gnosis.connector().is_listening());
	}

	#[tokio::test]
	async fn test_connection_failure_names_network() {
		let config = config(&[("sepolia", "ws://localhost:8546"), ("gnosis", "ws://down:8546")]);
		let err = KeeperBuilder::new(config).build(refusing_factory).await.err().unwrap();

		match err {
			BuilderError::Config(message) => assert!(message.contains("gnosis")),
			other => panic!("unexpected error: {}", other),
		}
	}
}
