//! Formatting and time helpers.

/// Truncates a hex identifier (hash, address) for log output.
///
/// Shows only the first 10 characters followed by ".." for longer strings.
pub fn truncate_id(id: &str) -> String {
	match id.get(..10) {
		Some(prefix) if id.len() > 10 => format!("{}..", prefix),
		_ => id.to_string(),
	}
}

/// Current unix timestamp in seconds, 0 if the clock is before the epoch.
pub fn current_timestamp() -> u64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or(0)
}

/// Returns true for endpoints that support push subscriptions.
pub fn is_streaming_endpoint(rpc: &str) -> bool {
	rpc.starts_with("ws://") || rpc.starts_with("wss://")
}
