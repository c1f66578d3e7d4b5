use core::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ChatroomId;

/// Moderation action kinds as reported by the history endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationType {
	Timeout,
	Ban,
	Unban,
	Kick,
	ChatClear,
	MessageDelete,
}

impl ModerationType {
	/// Stable wire identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Timeout => "timeout",
			Self::Ban => "ban",
			Self::Unban => "unban",
			Self::Kick => "kick",
			Self::ChatClear => "chat_clear",
			Self::MessageDelete => "message_delete",
		}
	}
}

impl fmt::Display for ModerationType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// One row of a channel's moderation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationAction {
	pub id: String,
	#[serde(rename = "type")]
	pub kind: ModerationType,
	pub target_user_id: u64,
	pub target_username: String,
	pub moderator_id: u64,
	pub moderator_username: String,
	#[serde(default)]
	pub reason: Option<String>,
	/// Timeout length in seconds.
	#[serde(default)]
	pub duration: Option<u64>,
	pub created_at: String,
	pub chatroom_id: ChatroomId,
}

impl ModerationAction {
	pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
		DateTime::parse_from_rfc3339(&self.created_at)
			.ok()
			.map(|t| t.with_timezone(&Utc))
	}
}

/// Per-user moderation status inside a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserModerationInfo {
	pub user_id: u64,
	pub is_banned: bool,
	pub is_timed_out: bool,
	#[serde(default)]
	pub timeout_expires_at: Option<String>,
	#[serde(default)]
	pub ban_reason: Option<String>,
	#[serde(default)]
	pub timeout_reason: Option<String>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn history_row_decodes_snake_case_kind() {
		let raw = r#"{"id":"1","type":"chat_clear","target_user_id":0,"target_username":"",
			"moderator_id":9,"moderator_username":"boss","created_at":"2024-05-01T12:30:00Z","chatroom_id":668}"#;
		let row: ModerationAction = serde_json::from_str(raw).unwrap();
		assert_eq!(row.kind, ModerationType::ChatClear);
		assert_eq!(row.kind.to_string(), "chat_clear");
		assert!(row.created_at_utc().is_some());
		assert!(row.reason.is_none());
	}
}
