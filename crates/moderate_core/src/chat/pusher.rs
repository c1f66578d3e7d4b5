//! Pusher protocol 7 framing as used by Kick's chat broker.
//!
//! Every frame is an outer `{event, data, channel?}` envelope. For most
//! events `data` is itself a JSON document serialized into a string, so
//! decoding happens in two steps and either step may fail independently.

use moderate_domain::{ChatMessage, ChatroomId, ChatroomTopic};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::SecretString;

pub const EVENT_CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
pub const EVENT_SUBSCRIBE: &str = "pusher:subscribe";
pub const EVENT_PING: &str = "pusher:ping";
pub const EVENT_PONG: &str = "pusher:pong";
pub const EVENT_ERROR: &str = "pusher:error";
pub const EVENT_SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
pub const EVENT_CHAT_MESSAGE: &str = r"App\Events\ChatMessageEvent";
pub const EVENT_MESSAGE_DELETED: &str = r"App\Events\MessageDeletedEvent";
pub const EVENT_CHATROOM_CLEAR: &str = r"App\Events\ChatroomClearEvent";

#[derive(Debug, Deserialize)]
pub struct Envelope {
	pub event: String,
	#[serde(default)]
	pub data: serde_json::Value,
	#[serde(default)]
	pub channel: Option<String>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
	ConnectionEstablished { socket_id: Option<String> },
	SubscriptionSucceeded { channel: Option<String> },
	ChatMessage(Box<ChatMessage>),
	MessageDeleted { message_id: String },
	ChatroomCleared { chatroom_id: Option<ChatroomId> },
	Ping,
	Error { code: Option<u32>, message: Option<String> },
	Unrecognized { event: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
	#[error("invalid envelope: {0}")]
	Envelope(String),
	#[error("invalid {event} payload: {reason}")]
	Payload { event: String, reason: String },
}

#[derive(Debug, Default, Deserialize)]
struct ConnectionEstablished {
	#[serde(default)]
	socket_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageDeleted {
	message: DeletedMessageRef,
}

#[derive(Debug, Deserialize)]
struct DeletedMessageRef {
	id: String,
}

#[derive(Debug, Default, Deserialize)]
struct PusherErrorPayload {
	#[serde(default)]
	code: Option<u32>,
	#[serde(default)]
	message: Option<String>,
}

/// Decode `data`, which may be a JSON string holding the document or (from
/// some relays) the document itself.
fn inner<T: DeserializeOwned>(event: &str, data: serde_json::Value) -> Result<T, DecodeError> {
	let result = match data {
		serde_json::Value::String(raw) => serde_json::from_str(&raw),
		other => serde_json::from_value(other),
	};
	result.map_err(|e| DecodeError::Payload {
		event: event.to_string(),
		reason: e.to_string(),
	})
}

/// Like [`inner`], but a missing or undecodable payload falls back to the default.
fn inner_lenient<T: DeserializeOwned + Default>(data: serde_json::Value) -> T {
	if data.is_null() {
		return T::default();
	}
	inner("", data).unwrap_or_default()
}

pub fn decode_frame(text: &str) -> Result<Frame, DecodeError> {
	let envelope: Envelope = serde_json::from_str(text).map_err(|e| DecodeError::Envelope(e.to_string()))?;
	decode_envelope(envelope)
}

pub fn decode_envelope(envelope: Envelope) -> Result<Frame, DecodeError> {
	let Envelope { event, data, channel } = envelope;
	let frame = match event.as_str() {
		EVENT_CONNECTION_ESTABLISHED => {
			let payload: ConnectionEstablished = inner_lenient(data);
			Frame::ConnectionEstablished {
				socket_id: payload.socket_id,
			}
		}
		EVENT_SUBSCRIPTION_SUCCEEDED => Frame::SubscriptionSucceeded { channel },
		EVENT_CHAT_MESSAGE => Frame::ChatMessage(Box::new(inner(&event, data)?)),
		EVENT_MESSAGE_DELETED => {
			let payload: MessageDeleted = inner(&event, data)?;
			Frame::MessageDeleted {
				message_id: payload.message.id,
			}
		}
		EVENT_CHATROOM_CLEAR => Frame::ChatroomCleared {
			chatroom_id: channel.as_deref().and_then(|c| ChatroomTopic::parse(c).ok()),
		},
		EVENT_PING => Frame::Ping,
		EVENT_ERROR => {
			let payload: PusherErrorPayload = inner_lenient(data);
			Frame::Error {
				code: payload.code,
				message: payload.message,
			}
		}
		_ => Frame::Unrecognized { event },
	};
	Ok(frame)
}

pub fn subscribe_message(chatroom_id: ChatroomId, token: &SecretString) -> String {
	serde_json::json!({
		"event": EVENT_SUBSCRIBE,
		"data": {
			"auth": token.expose(),
			"channel": ChatroomTopic::format(chatroom_id),
		},
	})
	.to_string()
}

pub fn pong_message() -> String {
	serde_json::json!({ "event": EVENT_PONG, "data": {} }).to_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	const CHAT_FRAME: &str = r##"{"event":"App\\Events\\ChatMessageEvent","data":"{\"id\":\"abc\",\"chatroom_id\":668,\"content\":\"hi\",\"type\":\"message\",\"created_at\":\"2024-05-01T12:00:00+00:00\",\"sender\":{\"id\":1,\"username\":\"Viewer\",\"slug\":\"viewer\",\"identity\":{\"color\":\"#FF0000\",\"badges\":[{\"type\":\"moderator\",\"text\":\"Moderator\"}]}}}","channel":"chatrooms.668.v2"}"##;

	#[test]
	fn decodes_nested_chat_message() {
		let Frame::ChatMessage(msg) = decode_frame(CHAT_FRAME).unwrap() else {
			panic!("expected chat message");
		};
		assert_eq!(msg.id, "abc");
		assert_eq!(msg.chatroom_id, ChatroomId(668));
		assert_eq!(msg.sender.identity.badges[0].badge_type, "moderator");
		assert!(msg.timestamp().is_some());
	}

	#[test]
	fn accepts_object_payloads() {
		let frame = r#"{"event":"App\\Events\\ChatMessageEvent","data":{"id":"x","chatroom_id":1,"content":"c","type":"message","created_at":"2024-05-01T12:00:00Z","sender":{"id":2,"username":"u","slug":"u"}}}"#;
		assert!(matches!(decode_frame(frame), Ok(Frame::ChatMessage(_))));
	}

	#[test]
	fn bad_inner_payload_is_a_payload_error() {
		let frame = r#"{"event":"App\\Events\\ChatMessageEvent","data":"{not json"}"#;
		assert!(matches!(decode_frame(frame), Err(DecodeError::Payload { .. })));
		assert!(matches!(decode_frame("nope"), Err(DecodeError::Envelope(_))));
	}

	#[test]
	fn control_frames() {
		let established =
			r#"{"event":"pusher:connection_established","data":"{\"socket_id\":\"123.456\",\"activity_timeout\":120}"}"#;
		assert_eq!(
			decode_frame(established).unwrap(),
			Frame::ConnectionEstablished {
				socket_id: Some("123.456".to_string())
			}
		);
		assert_eq!(decode_frame(r#"{"event":"pusher:ping","data":{}}"#).unwrap(), Frame::Ping);
		assert_eq!(
			decode_frame(r#"{"event":"pusher:error","data":{"code":4009,"message":"unauthorized"}}"#).unwrap(),
			Frame::Error {
				code: Some(4009),
				message: Some("unauthorized".to_string())
			}
		);
		assert_eq!(
			decode_frame(r#"{"event":"pusher_internal:subscription_succeeded","data":"{}","channel":"chatrooms.1.v2"}"#)
				.unwrap(),
			Frame::SubscriptionSucceeded {
				channel: Some("chatrooms.1.v2".to_string())
			}
		);
		assert_eq!(
			decode_frame(r#"{"event":"App\\Events\\StreamHostEvent","data":"{}"}"#).unwrap(),
			Frame::Unrecognized {
				event: r"App\Events\StreamHostEvent".to_string()
			}
		);
	}

	#[test]
	fn moderation_frames() {
		let deleted = r#"{"event":"App\\Events\\MessageDeletedEvent","data":"{\"id\":\"evt\",\"message\":{\"id\":\"m1\"}}","channel":"chatrooms.9.v2"}"#;
		assert_eq!(
			decode_frame(deleted).unwrap(),
			Frame::MessageDeleted {
				message_id: "m1".to_string()
			}
		);
		let cleared = r#"{"event":"App\\Events\\ChatroomClearEvent","data":"{\"id\":\"x\"}","channel":"chatrooms.9.v2"}"#;
		assert_eq!(
			decode_frame(cleared).unwrap(),
			Frame::ChatroomCleared {
				chatroom_id: Some(ChatroomId(9))
			}
		);
	}

	#[test]
	fn subscribe_payload_shape() {
		let msg = subscribe_message(ChatroomId(668), &SecretString::new("tok"));
		let value: serde_json::Value = serde_json::from_str(&msg).unwrap();
		assert_eq!(
			value,
			serde_json::json!({"event": "pusher:subscribe", "data": {"auth": "tok", "channel": "chatrooms.668.v2"}})
		);
		let pong: serde_json::Value = serde_json::from_str(&pong_message()).unwrap();
		assert_eq!(pong["event"], "pusher:pong");
	}
}
