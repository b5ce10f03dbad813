//! Main entry point for the keeper service.
//!
//! Connects every enabled network over WebSocket, registers the jobs
//! declared in the configuration and runs until interrupted, optionally
//! serving the status API.

use clap::Parser;
use keeper_chain::implementations::evm::create_ws_chain;
use keeper_config::Config;
use keeper_core::KeeperBuilder;
use std::path::PathBuf;
use std::sync::Arc;

mod jobs;
mod server;

/// Command-line arguments for the keeper service.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
	/// Path to configuration file
	#[arg(short, long, default_value = "config.toml")]
	config: PathBuf,

	/// Log level (trace, debug, info, warn, error)
	#[arg(short, long, default_value = "info")]
	log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	use tracing_subscriber::{fmt, EnvFilter};

	// RUST_LOG wins over --log-level.
	let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

	fmt()
		.with_env_filter(env_filter)
		.with_thread_ids(true)
		.with_target(true)
		.init();

	tracing::info!("Started keeper");

	let config_path = args
		.config
		.to_str()
		.ok_or_else(|| format!("Invalid config path: {}", args.config.display()))?;
	let config = Config::from_file(config_path).await?;
	tracing::info!("Loaded configuration [{}]", config.keeper.id);

	let engine = Arc::new(KeeperBuilder::new(config.clone()).build(create_ws_chain).await?);

	for network in engine.networks() {
		if let Some(details) = config.networks.details.get(network.name()) {
			let registered = jobs::register_static_jobs(network, &details.jobs).await?;
			tracing::info!(network = %network.name(), jobs = registered, "Static jobs registered");
		}
	}

	engine.initialize().await?;

	match config.api.clone().filter(|api| api.enabled) {
		Some(api_config) => {
			let api_engine = Arc::clone(&engine);
			tokio::select! {
				result = engine.run() => {
					tracing::info!("Keeper finished");
					result?;
				}
				result = server::start_server(api_config, api_engine) => {
					tracing::info!("API server finished");
					engine.shutdown().await?;
					result?;
				}
			}
		},
		None => {
			tracing::info!("Starting keeper only");
			engine.run().await?;
		},
	}

	tracing::info!("Stopped keeper");
	Ok(())
}
