//! Startup and shutdown of the keeper engine.

use super::{EngineError, KeeperEngine};

impl KeeperEngine {
	/// Initializes every network. The first failure aborts startup.
	pub async fn initialize(&self) -> Result<(), EngineError> {
		tracing::info!(keeper_id = %self.config.keeper.id, networks = self.networks.len(), "Initializing keeper engine");

		for network in &self.networks {
			network.init().await?;
		}
		Ok(())
	}

	/// Stops the block subscriptions and queue workers of every network.
	pub async fn shutdown(&self) -> Result<(), EngineError> {
		tracing::info!("Shutting down keeper engine");

		for network in &self.networks {
			network.stop().await;
		}
		Ok(())
	}
}
