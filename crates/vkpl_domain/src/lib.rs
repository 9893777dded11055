#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseChannelError {
	#[error("empty value")]
	Empty,
	#[error("invalid channel name: {0}")]
	InvalidName(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Blog URL slug of a streaming channel (the `<name>` in
/// `live.vkplay.ru/<name>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelName(String);

impl ChannelName {
	/// Create a non-empty `ChannelName`. Slugs never contain whitespace,
	/// `:` or `/`.
	pub fn new(name: impl Into<String>) -> Result<Self, ParseChannelError> {
		let name = name.into();
		if name.trim().is_empty() {
			return Err(ParseChannelError::Empty);
		}
		if name.chars().any(|c| c.is_whitespace() || c == ':' || c == '/') {
			return Err(ParseChannelError::InvalidName(name));
		}
		Ok(Self(name))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for ChannelName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelName {
	type Err = ParseChannelError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelName::new(s.to_string())
	}
}

/// A streaming channel resolved through the REST API. Immutable once
/// resolved; pub/sub frames reference it by `public_ws_channel`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
	pub blog_url: ChannelName,
	/// Bare channel id used inside pub/sub topic strings.
	pub public_ws_channel: String,
	/// Owner display name.
	pub name: String,
	pub owner_id: i64,
}

impl Channel {
	/// Topic string for the public chat of this channel.
	pub fn chat_topic(&self) -> String {
		Topic::format(Topic::CHAT, &self.public_ws_channel)
	}

	/// Topic string for channel info updates (stream status, viewers).
	pub fn info_topic(&self) -> String {
		Topic::format(Topic::INFO, &self.public_ws_channel)
	}

	/// Topic string for reward management events (requires a scoped
	/// subscription token).
	pub fn rewards_topic(&self) -> String {
		Topic::format(Topic::REWARDS, &self.public_ws_channel)
	}
}

/// Helpers for pub/sub topic strings of the form `<topic>:<channel-id>`.
pub struct Topic;

impl Topic {
	pub const CHAT: &'static str = "public-chat";
	pub const INFO: &'static str = "channel-info";
	pub const REWARDS: &'static str = "channel-info-manage";

	/// Format a topic string (e.g. `public-chat:6e0dff09`).
	pub fn format(topic: &str, channel_id: &str) -> String {
		format!("{topic}:{channel_id}")
	}

	/// Split a topic string into `(topic, channel_id)`.
	pub fn split(s: &str) -> Result<(&str, &str), ParseChannelError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseChannelError::Empty);
		}
		s.split_once(':')
			.ok_or_else(|| ParseChannelError::InvalidFormat("expected <topic>:<channel-id>".into()))
	}
}

/// One emote known to the sending account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Smile {
	pub id: String,
	pub name: String,
}

/// A user mention extracted from a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mention {
	pub user_id: i64,
	pub name: Option<String>,
	pub display_name: Option<String>,
	pub nick: Option<String>,
}

/// A link extracted from a message.
///
/// `text` keeps the block's raw content field, which is still the
/// JSON-encoded `[label, style, annotations]` triple the backend sends.
/// `label` carries the decoded display text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
	pub text: String,
	pub url: String,
	pub label: String,
}

/// Structured view of a rich chat message, derived by folding over its
/// block sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedMessage {
	/// All textual fragments in order, single-space-joined and trimmed.
	pub text: String,
	pub smiles: Vec<Smile>,
	pub mentions: Vec<Mention>,
	pub links: Vec<Link>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn channel_name_parse_and_display() {
		let name = "some_channel".parse::<ChannelName>().unwrap();
		assert_eq!(name.as_str(), "some_channel");
		assert_eq!(name.to_string(), "some_channel");
	}

	#[test]
	fn rejects_bad_channel_names() {
		assert!(ChannelName::new("").is_err());
		assert!(ChannelName::new("   ").is_err());
		assert!(ChannelName::new("a b").is_err());
		assert!(ChannelName::new("a:b").is_err());
		assert!(ChannelName::new("a/b").is_err());
	}

	#[test]
	fn topic_format_split_roundtrip() {
		let topic = Topic::format(Topic::CHAT, "6e0dff09");
		assert_eq!(topic, "public-chat:6e0dff09");
		let (kind, id) = Topic::split(&topic).unwrap();
		assert_eq!(kind, "public-chat");
		assert_eq!(id, "6e0dff09");
	}

	#[test]
	fn topic_split_rejects_garbage() {
		assert!(Topic::split("").is_err());
		assert!(Topic::split("no-separator").is_err());
	}

	#[test]
	fn channel_topics() {
		let channel = Channel {
			blog_url: ChannelName::new("demo").unwrap(),
			public_ws_channel: "abc123".into(),
			name: "Demo".into(),
			owner_id: 1,
		};
		assert_eq!(channel.chat_topic(), "public-chat:abc123");
		assert_eq!(channel.info_topic(), "channel-info:abc123");
		assert_eq!(channel.rewards_topic(), "channel-info-manage:abc123");
	}
}
