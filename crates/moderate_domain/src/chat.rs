use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ChatroomId;

/// Chat message as carried in the inner payload of a broker chat event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
	pub id: String,
	pub chatroom_id: ChatroomId,
	pub content: String,

	/// Message kind (`message`, `reply`, ...).
	#[serde(rename = "type")]
	pub kind: String,

	/// Provider timestamp, kept verbatim.
	pub created_at: String,

	pub sender: MessageSender,

	#[serde(default)]
	pub metadata: Option<MessageMetadata>,
}

impl ChatMessage {
	/// Parsed `created_at` (RFC3339), if the provider sent a valid timestamp.
	pub fn timestamp(&self) -> Option<DateTime<Utc>> {
		DateTime::parse_from_rfc3339(&self.created_at)
			.ok()
			.map(|t| t.with_timezone(&Utc))
	}

	pub fn is_reply(&self) -> bool {
		self.metadata.as_ref().is_some_and(|m| m.original_message.is_some())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSender {
	pub id: u64,
	pub username: String,
	pub slug: String,
	#[serde(default)]
	pub identity: MessageIdentity,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageIdentity {
	#[serde(default)]
	pub color: Option<String>,
	#[serde(default)]
	pub badges: Vec<MessageBadge>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBadge {
	#[serde(rename = "type")]
	pub badge_type: String,
	pub text: String,
	#[serde(default)]
	pub count: Option<u32>,
	#[serde(default)]
	pub active: Option<bool>,
}

/// Reply context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
	#[serde(default)]
	pub original_sender: Option<MessageSender>,
	#[serde(default)]
	pub original_message: Option<OriginalMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginalMessage {
	pub id: String,
	pub content: String,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn decodes_kick_chat_payload() {
		let raw = r##"{
			"id": "b1f6c2",
			"chatroom_id": 668,
			"content": "hello chat",
			"type": "message",
			"created_at": "2024-05-01T12:30:00+00:00",
			"sender": {
				"id": 7,
				"username": "Mod",
				"slug": "mod",
				"identity": {"color": "#FF0000", "badges": [{"type": "moderator", "text": "Moderator"}]}
			}
		}"##;

		let msg: ChatMessage = serde_json::from_str(raw).unwrap();
		assert_eq!(msg.chatroom_id, ChatroomId(668));
		assert_eq!(msg.kind, "message");
		assert_eq!(msg.sender.identity.badges[0].badge_type, "moderator");
		assert!(!msg.is_reply());
		assert_eq!(msg.timestamp().unwrap().to_rfc3339(), "2024-05-01T12:30:00+00:00");
	}

	#[test]
	fn tolerates_missing_identity_and_bad_timestamp() {
		let raw = r#"{"id":"x","chatroom_id":1,"content":"c","type":"reply","created_at":"yesterday",
			"sender":{"id":1,"username":"u","slug":"u"},
			"metadata":{"original_message":{"id":"y","content":"orig"}}}"#;
		let msg: ChatMessage = serde_json::from_str(raw).unwrap();
		assert!(msg.sender.identity.badges.is_empty());
		assert!(msg.timestamp().is_none());
		assert!(msg.is_reply());
	}
}
