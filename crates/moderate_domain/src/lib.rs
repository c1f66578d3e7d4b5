#![forbid(unsafe_code)]

pub mod channel;
pub mod chat;
pub mod moderation;
pub mod user;

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use channel::{Category, Channel, ChannelUpdate, Chatroom, Paginated, PaginationLinks, PaginationMeta, ParentCategory};
pub use chat::{ChatMessage, MessageBadge, MessageIdentity, MessageMetadata, MessageSender, OriginalMessage};
pub use moderation::{ModerationAction, ModerationType, UserModerationInfo};
pub use user::UserProfile;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Kick channel slug (the path segment used by the REST surface).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelSlug(String);

impl ChannelSlug {
	/// Create a non-empty slug. Surrounding whitespace is trimmed.
	pub fn new(slug: impl Into<String>) -> Result<Self, ParseIdError> {
		let slug = slug.into();
		let trimmed = slug.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if trimmed.contains('/') || trimmed.contains('?') || trimmed.contains('#') {
			return Err(ParseIdError::InvalidFormat(format!("slug must be a single path segment: {trimmed}")));
		}
		Ok(Self(trimmed.to_string()))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ChannelSlug {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelSlug {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelSlug::new(s.to_string())
	}
}

/// Numeric chatroom identifier (the broker channel key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatroomId(pub u64);

impl fmt::Display for ChatroomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for ChatroomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		s.parse::<u64>()
			.map(ChatroomId)
			.map_err(|_| ParseIdError::InvalidFormat(format!("expected numeric chatroom id: {s}")))
	}
}

/// Broker channel naming for chatrooms.
pub struct ChatroomTopic;

impl ChatroomTopic {
	/// Prefix for chatroom channels.
	pub const PREFIX: &'static str = "chatrooms.";

	/// Suffix for the v2 event stream.
	pub const SUFFIX: &'static str = ".v2";

	/// Format a broker channel name (e.g. `chatrooms.668.v2`).
	pub fn format(id: ChatroomId) -> String {
		format!("{}{}{}", Self::PREFIX, id.0, Self::SUFFIX)
	}

	/// Parse a broker channel name of the form `chatrooms.<id>.v2`.
	pub fn parse(s: &str) -> Result<ChatroomId, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let id = s
			.strip_prefix(Self::PREFIX)
			.and_then(|rest| rest.strip_suffix(Self::SUFFIX))
			.ok_or_else(|| ParseIdError::InvalidFormat("expected chatrooms.<id>.v2".into()))?;

		id.parse::<ChatroomId>()
	}
}
