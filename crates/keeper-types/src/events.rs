//! Event types for inter-component communication.
//!
//! Every fetched block is announced to listeners (the execution queues)
//! regardless of whether it triggers a scheduler walk.

use serde::{Deserialize, Serialize};

/// Announcement of a freshly fetched block.
///
/// Sent on a broadcast channel; slow receivers may miss old announcements
/// and only the most recent ones are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBlockEvent {
	pub number: u64,
	pub timestamp: u64,
}
