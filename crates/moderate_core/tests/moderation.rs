use std::sync::Arc;
use std::time::Duration;

use moderate_core::{
	ApiConfig, KickApi, ModerationCommand, ModerationConfig, ModerationDispatcher, ModerationError, SecretString,
};
use moderate_domain::{ChannelSlug, ModerationType};
use tokio::time::timeout;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn dispatcher(server: &MockServer, token: Option<&str>, history_capacity: usize) -> ModerationDispatcher {
	let api = KickApi::new(ApiConfig {
		base_url: server.uri(),
		..ApiConfig::default()
	})
	.unwrap();
	ModerationDispatcher::new(
		api,
		Arc::new(token.map(SecretString::new)),
		ModerationConfig { history_capacity },
	)
}

fn slug() -> ChannelSlug {
	ChannelSlug::new("somechannel").unwrap()
}

fn history_row(id: &str, kind: &str) -> serde_json::Value {
	serde_json::json!({
		"id": id,
		"type": kind,
		"target_user_id": 5,
		"target_username": "spammer",
		"moderator_id": 42,
		"moderator_username": "Mod",
		"reason": "spam",
		"duration": 600,
		"created_at": "2024-05-01T12:30:00Z",
		"chatroom_id": 668
	})
}

async fn mount_history(server: &MockServer, rows: Vec<serde_json::Value>, expected: u64) {
	Mock::given(method("GET"))
		.and(path("/api/v2/channels/somechannel/moderation/history"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": rows})))
		.expect(expected)
		.mount(server)
		.await;
}

#[tokio::test]
async fn timeout_posts_body_and_refreshes_history() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/api/v2/channels/somechannel/moderation"))
		.and(header("authorization", "Bearer tok"))
		.and(body_json(serde_json::json!({
			"user_id": 5,
			"type": "timeout",
			"duration": 600,
			"reason": "spam"
		})))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"success": true})))
		.expect(1)
		.mount(&server)
		.await;
	mount_history(&server, vec![history_row("1", "timeout")], 1).await;

	let moderation = dispatcher(&server, Some("tok"), 100);
	let mut updates = moderation.history_updates();
	moderation
		.execute(ModerationCommand::Timeout {
			channel_slug: slug(),
			user_id: 5,
			duration: 600,
			reason: Some("spam".to_string()),
		})
		.await
		.unwrap();

	let view = timeout(Duration::from_secs(3), updates.wait_for(Option::is_some))
		.await
		.expect("history never refreshed")
		.unwrap()
		.clone()
		.unwrap();
	assert_eq!(view.channel_slug, slug());
	assert_eq!(view.actions[0].kind, ModerationType::Timeout);
	assert_eq!(view.actions[0].duration, Some(600));
}

#[tokio::test]
async fn forbidden_is_rejected_without_refetch() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/api/v2/channels/somechannel/moderation"))
		.respond_with(ResponseTemplate::new(403))
		.expect(1)
		.mount(&server)
		.await;
	mount_history(&server, vec![], 0).await;

	let moderation = dispatcher(&server, Some("tok"), 100);
	let err = moderation
		.execute(ModerationCommand::Ban {
			channel_slug: slug(),
			user_id: 5,
			reason: None,
		})
		.await
		.unwrap_err();
	assert_eq!(err, ModerationError::Rejected(403));

	tokio::time::sleep(Duration::from_millis(200)).await;
	assert!(moderation.last_history().is_none());
}

#[tokio::test]
async fn explicit_failure_flag_is_rejected() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/api/v2/channels/somechannel/moderation"))
		.respond_with(
			ResponseTemplate::new(200).set_body_json(serde_json::json!({"success": false, "message": "already banned"})),
		)
		.mount(&server)
		.await;
	mount_history(&server, vec![], 0).await;

	let moderation = dispatcher(&server, Some("tok"), 100);
	let err = moderation
		.execute(ModerationCommand::Kick {
			channel_slug: slug(),
			user_id: 5,
			reason: Some("bye".to_string()),
		})
		.await
		.unwrap_err();
	assert_eq!(err, ModerationError::Rejected(200));
	tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn clear_and_delete_accept_empty_bodies() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/api/v2/channels/somechannel/chatroom/clear"))
		.respond_with(ResponseTemplate::new(204))
		.expect(1)
		.mount(&server)
		.await;
	Mock::given(method("DELETE"))
		.and(path("/api/v2/channels/somechannel/messages/msg-1"))
		.respond_with(ResponseTemplate::new(200))
		.expect(1)
		.mount(&server)
		.await;
	mount_history(&server, vec![history_row("9", "message_delete")], 2).await;

	let moderation = dispatcher(&server, Some("tok"), 100);
	moderation
		.execute(ModerationCommand::ClearChat { channel_slug: slug() })
		.await
		.unwrap();
	moderation
		.execute(ModerationCommand::DeleteMessage {
			channel_slug: slug(),
			message_id: "msg-1".to_string(),
		})
		.await
		.unwrap();
	tokio::time::sleep(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn history_view_is_bounded() {
	let server = MockServer::start().await;
	mount_history(
		&server,
		vec![history_row("3", "ban"), history_row("2", "unban"), history_row("1", "timeout")],
		1,
	)
	.await;

	let moderation = dispatcher(&server, Some("tok"), 2);
	let full = moderation.history(&slug()).await.unwrap();
	assert_eq!(full.len(), 3);

	let view = moderation.last_history().unwrap();
	let ids: Vec<_> = view.actions.iter().map(|a| a.id.as_str()).collect();
	assert_eq!(ids, ["3", "2"]);
}

#[tokio::test]
async fn user_moderation_info_is_fetched() {
	let server = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/api/v2/channels/somechannel/users/5/moderation"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
			"user_id": 5,
			"is_banned": false,
			"is_timed_out": true,
			"timeout_expires_at": "2024-05-01T13:00:00Z",
			"timeout_reason": "spam"
		})))
		.mount(&server)
		.await;

	let moderation = dispatcher(&server, Some("tok"), 100);
	let info = moderation.user_moderation_info(&slug(), 5).await.unwrap();
	assert!(info.is_timed_out);
	assert!(!info.is_banned);
	assert_eq!(info.timeout_reason.as_deref(), Some("spam"));
}

#[tokio::test]
async fn no_token_never_hits_the_network() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.respond_with(ResponseTemplate::new(200))
		.expect(0)
		.mount(&server)
		.await;

	let moderation = dispatcher(&server, None, 100);
	let err = moderation
		.execute(ModerationCommand::Unban {
			channel_slug: slug(),
			user_id: 5,
		})
		.await
		.unwrap_err();
	assert_eq!(err, ModerationError::Unauthenticated);
	assert_eq!(moderation.history(&slug()).await.unwrap_err(), ModerationError::Unauthenticated);
}
