use serde::{Deserialize, Serialize};

use crate::user::UserProfile;
use crate::{ChannelSlug, ChatroomId};

/// Channel detail as returned by `GET /api/v2/channels/{slug}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
	pub id: u64,
	pub user_id: u64,
	pub slug: ChannelSlug,
	#[serde(default)]
	pub playback_url: Option<String>,
	#[serde(default)]
	pub followers_count: u64,
	#[serde(default)]
	pub user: Option<UserProfile>,
	#[serde(default)]
	pub is_live: bool,
	#[serde(default)]
	pub category: Option<Category>,
	#[serde(default)]
	pub tags: Vec<String>,
	#[serde(default)]
	pub viewers_count: Option<u64>,
	#[serde(default)]
	pub chatroom: Option<Chatroom>,
	#[serde(default)]
	pub language: Option<String>,
	#[serde(default)]
	pub is_mature: bool,
	#[serde(default)]
	pub slow_mode: bool,
	#[serde(default)]
	pub subscriber_mode: bool,
	#[serde(default)]
	pub followers_mode: bool,
	#[serde(default)]
	pub emotes_mode: bool,
}

impl Channel {
	/// Broker chatroom id for this channel, if the payload carried one.
	pub fn chatroom_id(&self) -> Option<ChatroomId> {
		self.chatroom.as_ref().map(|c| ChatroomId(c.id))
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chatroom {
	pub id: u64,
	#[serde(default)]
	pub channel_id: Option<u64>,
	#[serde(default)]
	pub chat_mode: Option<String>,
	#[serde(default)]
	pub slow_mode: bool,
	#[serde(default)]
	pub followers_mode: bool,
	#[serde(default)]
	pub subscribers_mode: bool,
	#[serde(default)]
	pub emotes_mode: bool,
	#[serde(default)]
	pub message_interval: Option<u64>,
	#[serde(default)]
	pub following_min_duration: Option<u64>,
	#[serde(default)]
	pub chatroom_clear_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
	pub id: u64,
	pub name: String,
	pub slug: String,
	#[serde(default)]
	pub tags: Vec<String>,
	#[serde(default)]
	pub description: Option<String>,
	#[serde(default)]
	pub viewers: Option<u64>,
	#[serde(default)]
	pub category: Option<ParentCategory>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentCategory {
	pub id: u64,
	pub name: String,
	pub slug: String,
	#[serde(default)]
	pub icon: Option<String>,
}

/// Body of `PATCH /api/v2/channels/{slug}`. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelUpdate {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub title: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub category_id: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub language: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub is_mature: Option<bool>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tags: Option<Vec<String>>,
}

impl ChannelUpdate {
	pub fn is_empty(&self) -> bool {
		self.title.is_none()
			&& self.category_id.is_none()
			&& self.language.is_none()
			&& self.is_mature.is_none()
			&& self.tags.is_none()
	}
}

/// Paginated list envelope (`{data, links?, meta?}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paginated<T> {
	pub data: Vec<T>,
	#[serde(default)]
	pub links: Option<PaginationLinks>,
	#[serde(default)]
	pub meta: Option<PaginationMeta>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationLinks {
	#[serde(default)]
	pub first: Option<String>,
	#[serde(default)]
	pub last: Option<String>,
	#[serde(default)]
	pub prev: Option<String>,
	#[serde(default)]
	pub next: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationMeta {
	pub current_page: u64,
	#[serde(default)]
	pub from: Option<u64>,
	pub last_page: u64,
	pub path: String,
	pub per_page: u64,
	#[serde(default)]
	pub to: Option<u64>,
	pub total: u64,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn channel_update_skips_absent_fields() {
		let update = ChannelUpdate {
			title: Some("new title".to_string()),
			is_mature: Some(false),
			..Default::default()
		};
		let json = serde_json::to_value(&update).unwrap();
		assert_eq!(json, serde_json::json!({"title": "new title", "is_mature": false}));
		assert!(ChannelUpdate::default().is_empty());
	}

	#[test]
	fn channel_exposes_chatroom_id() {
		let raw = r#"{"id":1,"user_id":2,"slug":"xqc","chatroom":{"id":668}}"#;
		let channel: Channel = serde_json::from_str(raw).unwrap();
		assert_eq!(channel.chatroom_id(), Some(ChatroomId(668)));
		assert!(channel.tags.is_empty());
	}
}
