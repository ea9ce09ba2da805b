//! Channel names used on the bus.
//!
//! A manager owns exactly one command topic derived from its host address.
//! Response and progress topics are minted per request by the caller so that
//! concurrent requests never share a stream.

use uuid::Uuid;

/// Prefix of every manager's command topic; the host IP follows.
pub const COMMAND_TOPIC_PREFIX: &str = "datasource_commands_";

/// Prefix of per-request response topics.
pub const RESPONSE_TOPIC_PREFIX: &str = "response_";

/// Prefix of per-request progress topics.
pub const PROGRESS_TOPIC_PREFIX: &str = "progress_";

/// Shared progress topic for commands that do not name their own.
pub const DEFAULT_PROGRESS_TOPIC: &str = "datasource_progress";

/// Command topic of the manager running on `host`.
pub fn command_topic(host: &str) -> String {
    format!("{COMMAND_TOPIC_PREFIX}{host}")
}

/// A fresh `response_<32 hex>` topic.
pub fn fresh_response_topic() -> String {
    format!("{RESPONSE_TOPIC_PREFIX}{}", Uuid::new_v4().simple())
}

/// A fresh `progress_<32 hex>` topic.
pub fn fresh_progress_topic() -> String {
    format!("{PROGRESS_TOPIC_PREFIX}{}", Uuid::new_v4().simple())
}

/// Whether `topic` is some manager's command topic.
///
/// Replies and progress must never be routed onto a command topic.
pub fn is_command_topic(topic: &str) -> bool {
    topic.starts_with(COMMAND_TOPIC_PREFIX)
}
