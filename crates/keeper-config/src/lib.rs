//! Configuration module for the keeper.
//!
//! Configuration is read from TOML, with `${VAR}` and `${VAR:-default}`
//! placeholders resolved from the environment before parsing so that worker
//! private keys never have to be written into the file itself.
//!
//! ## Modular Configuration Support
//!
//! Configurations can be split into multiple files:
//! - Use `include = ["networks.toml"]` to include other config files
//! - Each top-level section must be unique across all files (no duplicates allowed)

mod loader;

pub use loader::ConfigLoader;

use alloy::signers::local::PrivateKeySigner;
use keeper_types::{is_streaming_endpoint, is_valid_job_key, NetworksConfig};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Error that occurs during file I/O operations.
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	/// Error that occurs when parsing TOML configuration.
	#[error("Configuration error: {0}")]
	Parse(String),
	/// Error that occurs when configuration validation fails.
	#[error("Validation error: {0}")]
	Validation(String),
}

impl From<toml::de::Error> for ConfigError {
	fn from(err: toml::de::Error) -> Self {
		// The full error embeds the whole input, which may contain resolved secrets.
		ConfigError::Parse(err.message().to_string())
	}
}

/// Main configuration structure for the keeper.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	/// Settings of this keeper instance.
	pub keeper: KeeperConfig,
	/// Enabled networks and their details.
	pub networks: NetworksConfig,
	/// Configuration for the HTTP status API.
	pub api: Option<ApiConfig>,
}

/// Configuration specific to the keeper instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KeeperConfig {
	/// Unique identifier for this keeper instance.
	pub id: String,
	/// Number of most recent block numbers remembered for de-duplication.
	#[serde(default = "default_block_history_size")]
	pub block_history_size: usize,
	/// Upper bound of job callbacks running at once on a single network.
	#[serde(default = "default_max_concurrent_callbacks")]
	pub max_concurrent_callbacks: usize,
}

fn default_block_history_size() -> usize {
	256
}

fn default_max_concurrent_callbacks() -> usize {
	64
}

/// Configuration for the HTTP status API.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default = "default_api_host")]
	pub host: String,
	#[serde(default = "default_api_port")]
	pub port: u16,
}

fn default_api_host() -> String {
	"127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
	3000
}

/// Resolves environment variables in a string.
///
/// Replaces ${VAR_NAME} with the value of the environment variable VAR_NAME.
/// Supports default values with ${VAR_NAME:-default_value}.
///
/// Input strings are limited to 1MB to keep the regex scan bounded.
pub(crate) fn resolve_env_vars(input: &str) -> Result<String, ConfigError> {
	const MAX_INPUT_SIZE: usize = 1024 * 1024;
	if input.len() > MAX_INPUT_SIZE {
		return Err(ConfigError::Validation(format!(
			"Configuration file too large: {} bytes (max: {} bytes)",
			input.len(),
			MAX_INPUT_SIZE
		)));
	}

	let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]{0,127})(?::-([^}]{0,256}))?\}")
		.map_err(|e| ConfigError::Parse(format!("Regex error: {}", e)))?;

	let mut result = String::with_capacity(input.len());
	let mut last_end = 0;

	for cap in re.captures_iter(input) {
		let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
			continue;
		};
		let value = match (std::env::var(var_name.as_str()), cap.get(2)) {
			(Ok(value), _) => value,
			(Err(_), Some(default)) => default.as_str().to_string(),
			(Err(_), None) => {
				return Err(ConfigError::Validation(format!(
					"Environment variable '{}' not found",
					var_name.as_str()
				)));
			},
		};

		result.push_str(&input[last_end..full_match.start()]);
		result.push_str(&value);
		last_end = full_match.end();
	}
	result.push_str(&input[last_end..]);

	Ok(result)
}

impl Config {
	/// Loads configuration from a file, following its include directives.
	pub async fn from_file(path: &str) -> Result<Self, ConfigError> {
		let path_buf = Path::new(path);
		let base_dir = path_buf.parent().unwrap_or_else(|| Path::new("."));

		let mut loader = ConfigLoader::new(base_dir);
		let file_name = path_buf
			.file_name()
			.ok_or_else(|| ConfigError::Validation(format!("Invalid path: {}", path)))?;
		loader.load_config(file_name).await
	}

	/// Validates the configuration:
	/// - Ensures the keeper ID is not empty and its limits are positive
	/// - Checks that every enabled network has details with a WebSocket endpoint
	/// - Verifies agent addresses, and that each key signs for its worker address
	/// - Validates static job keys, triggers and agent references
	fn validate(&self) -> Result<(), ConfigError> {
		if self.keeper.id.is_empty() {
			return Err(ConfigError::Validation("Keeper ID cannot be empty".into()));
		}
		if self.keeper.block_history_size == 0 {
			return Err(ConfigError::Validation(
				"block_history_size must be at least 1".into(),
			));
		}
		if self.keeper.max_concurrent_callbacks == 0 {
			return Err(ConfigError::Validation(
				"max_concurrent_callbacks must be at least 1".into(),
			));
		}

		if self.networks.enabled.is_empty() {
			return Err(ConfigError::Validation(
				"At least one network must be enabled".into(),
			));
		}

		for name in &self.networks.enabled {
			let network = self.networks.details.get(name).ok_or_else(|| {
				ConfigError::Validation(format!(
					"Network '{}' is enabled but has no [networks.details.{}] section",
					name, name
				))
			})?;

			if !is_streaming_endpoint(&network.rpc) {
				return Err(ConfigError::Validation(format!(
					"Network '{}' rpc must be a ws:// or wss:// endpoint",
					name
				)));
			}
			if network.average_block_time == Some(0) {
				return Err(ConfigError::Validation(format!(
					"Network '{}' average_block_time must be greater than 0",
					name
				)));
			}

			let agents = network
				.agents_by_address()
				.map_err(|e| ConfigError::Validation(format!("Network '{}': {}", name, e)))?;
			for (address, agent) in &agents {
				if agent.private_key.is_empty() {
					return Err(ConfigError::Validation(format!(
						"Agent {} on network '{}' has an empty private_key",
						address, name
					)));
				}
				// The parse error is not echoed, it could quote the key.
				let signer = agent.private_key.expose_secret().parse::<PrivateKeySigner>().map_err(|_| {
					ConfigError::Validation(format!(
						"Agent {} on network '{}' has an invalid private_key",
						address, name
					))
				})?;
				if signer.address() != agent.keeper_worker_address {
					return Err(ConfigError::Validation(format!(
						"Agent {} on network '{}': private_key belongs to {}, not keeper_worker_address {}",
						address,
						name,
						signer.address(),
						agent.keeper_worker_address
					)));
				}
			}

			for (key, job) in &network.jobs {
				if !is_valid_job_key(key) {
					return Err(ConfigError::Validation(format!(
						"Job key '{}' on network '{}' must be at least 3 characters",
						key, name
					)));
				}
				match (job.is_interval(), job.is_resolver()) {
					(true, true) | (false, false) => {
						return Err(ConfigError::Validation(format!(
							"Job '{}' on network '{}' must set exactly one of interval_seconds or a resolver",
							key, name
						)));
					},
					(true, false) => {
						if job.interval_seconds == Some(0) {
							return Err(ConfigError::Validation(format!(
								"Job '{}' on network '{}' interval_seconds must be greater than 0",
								key, name
							)));
						}
					},
					(false, true) => {
						if job.resolver_address.is_none() || job.resolver_calldata.is_none() {
							return Err(ConfigError::Validation(format!(
								"Job '{}' on network '{}' needs both resolver_address and resolver_calldata",
								key, name
							)));
						}
					},
				}
				if !agents.iter().any(|(address, _)| *address == job.agent) {
					return Err(ConfigError::Validation(format!(
						"Job '{}' on network '{}' references unknown agent {}",
						key, name, job.agent
					)));
				}
			}
		}

		Ok(())
	}
}

/// Parses configuration from a TOML string.
///
/// Environment variables are resolved and the configuration is validated
/// after parsing.
impl FromStr for Config {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let resolved = resolve_env_vars(s)?;
		let config: Config = toml::from_str(&resolved)?;
		config.validate()?;
		Ok(config)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use keeper_types::{Address, DEFAULT_MULTICALL_ADDRESS};

	const AGENT: &str = "0x00000000000000000000000000000000000000aa";
	const WORKER_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

	fn network_section(rpc: &str, jobs: &str) -> String {
		format!(
			r#"
[keeper]
id = "test-keeper"

[networks]
enabled = ["sepolia"]

[networks.details.sepolia]
rpc = "{rpc}"

[networks.details.sepolia.agents."{AGENT}"]
keeper_worker_address = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"
private_key = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
{jobs}
"#
		)
	}

	#[test]
	fn test_env_var_resolution() {
		std::env::set_var("KEEPER_TEST_HOST", "localhost");
		std::env::set_var("KEEPER_TEST_PORT", "8546");

		let input = "rpc = \"ws://${KEEPER_TEST_HOST}:${KEEPER_TEST_PORT}\"";
		let result = resolve_env_vars(input).unwrap();
		assert_eq!(result, "rpc = \"ws://localhost:8546\"");

		std::env::remove_var("KEEPER_TEST_HOST");
		std::env::remove_var("KEEPER_TEST_PORT");
	}

	#[test]
	fn test_env_var_with_default() {
		let input = "value = \"${KEEPER_MISSING_VAR:-fallback}\"";
		let result = resolve_env_vars(input).unwrap();
		assert_eq!(result, "value = \"fallback\"");
	}

	#[test]
	fn test_missing_env_var_error() {
		let result = resolve_env_vars("value = \"${KEEPER_MISSING_VAR}\"");
		assert!(result.unwrap_err().to_string().contains("KEEPER_MISSING_VAR"));
	}

	#[test]
	fn test_parse_minimal_config() {
		let config: Config = network_section("ws://localhost:8545", "").parse().unwrap();

		assert_eq!(config.keeper.id, "test-keeper");
		assert_eq!(config.keeper.block_history_size, 256);
		assert_eq!(config.keeper.max_concurrent_callbacks, 64);
		assert!(config.api.is_none());

		let sepolia = &config.networks.details["sepolia"];
		assert_eq!(sepolia.average_block_time_seconds("sepolia"), 12);
		assert_eq!(sepolia.multicall_address(), DEFAULT_MULTICALL_ADDRESS);

		let agents = sepolia.agents_by_address().unwrap();
		assert_eq!(agents[0].0, Address::with_last_byte(0xaa));
		assert_eq!(agents[0].1.private_key.expose_secret(), WORKER_KEY);
	}

	#[test]
	fn test_private_key_from_env() {
		std::env::set_var("KEEPER_TEST_WORKER_KEY", WORKER_KEY);
		let content = network_section("ws://localhost:8545", "").replace(WORKER_KEY, "${KEEPER_TEST_WORKER_KEY}");
		assert!(!content.contains(WORKER_KEY));

		let config: Config = content.parse().unwrap();
		let agent = config.networks.details["sepolia"].agents.values().next().unwrap();
		assert_eq!(agent.private_key.expose_secret(), WORKER_KEY);

		std::env::remove_var("KEEPER_TEST_WORKER_KEY");
	}

	#[test]
	fn test_http_rpc_rejected() {
		let result: Result<Config, _> = network_section("http://localhost:8545", "").parse();
		let error = result.unwrap_err().to_string();
		assert!(error.contains("ws://"), "{}", error);
	}

	#[test]
	fn test_private_key_must_match_worker_address() {
		// Second well-known development key, it signs for 0x7099..79c8.
		let other_key = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";
		let error = network_section("ws://localhost:8545", "")
			.replace(WORKER_KEY, other_key)
			.parse::<Config>()
			.unwrap_err()
			.to_string();
		assert!(error.contains("not keeper_worker_address"), "{}", error);
		assert!(!error.contains(other_key));

		let error = network_section("ws://localhost:8545", "")
			.replace(WORKER_KEY, "0xnot-a-key")
			.parse::<Config>()
			.unwrap_err()
			.to_string();
		assert!(error.contains("invalid private_key"), "{}", error);
	}

	#[test]
	fn test_enabled_network_without_details() {
		let content = r#"
[keeper]
id = "test-keeper"

[networks]
enabled = ["mainnet"]
"#;
		let error = content.parse::<Config>().unwrap_err().to_string();
		assert!(error.contains("mainnet"));
	}

	#[test]
	fn test_static_jobs_validation() {
		let interval_job = format!(
			r#"
[networks.details.sepolia.jobs.harvest]
agent = "{AGENT}"
target = "0x00000000000000000000000000000000000000cc"
calldata = "0x4641257d"
interval_seconds = 3600
"#
		);
		let config: Config = network_section("ws://localhost:8545", &interval_job)
			.parse()
			.unwrap();
		assert!(config.networks.details["sepolia"].jobs["harvest"].is_interval());

		let short_key = interval_job.replace("jobs.harvest", "jobs.hv");
		let error = network_section("ws://localhost:8545", &short_key)
			.parse::<Config>()
			.unwrap_err()
			.to_string();
		assert!(error.contains("at least 3 characters"));

		let both_triggers = format!(
			"{}resolver_address = \"0x00000000000000000000000000000000000000dd\"\n",
			interval_job
		);
		let error = network_section("ws://localhost:8545", &both_triggers)
			.parse::<Config>()
			.unwrap_err()
			.to_string();
		assert!(error.contains("exactly one"));

		let unknown_agent = interval_job.replace(AGENT, "0x00000000000000000000000000000000000000ee");
		let error = network_section("ws://localhost:8545", &unknown_agent)
			.parse::<Config>()
			.unwrap_err()
			.to_string();
		assert!(error.contains("unknown agent"));
	}

	#[test]
	fn test_resolver_job_needs_calldata() {
		let resolver_job = format!(
			r#"
[networks.details.sepolia.jobs.liquidate]
agent = "{AGENT}"
target = "0x00000000000000000000000000000000000000cc"
resolver_address = "0x00000000000000000000000000000000000000dd"
"#
		);
		let error = network_section("ws://localhost:8545", &resolver_job)
			.parse::<Config>()
			.unwrap_err()
			.to_string();
		assert!(error.contains("resolver_calldata"));
	}
}
