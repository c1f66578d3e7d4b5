#![forbid(unsafe_code)]

use std::time::Duration;

use moderate_domain::{
	Category, Channel, ChannelSlug, ChannelUpdate, ModerationAction, Paginated, UserModerationInfo, UserProfile,
};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::SecretString;

pub const DEFAULT_API_BASE_URL: &str = "https://kick.com";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Transport-level failures of the REST surface.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
	#[error("invalid url: {0}")]
	InvalidUrl(String),
	#[error("invalid response: {0}")]
	InvalidResponse(String),
	#[error("http error: status={0}")]
	Http(u16),
	#[error("decode error: {0}")]
	Decode(String),
	#[error("request timed out")]
	Timeout,
}

impl NetworkError {
	pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
		if err.is_timeout() {
			Self::Timeout
		} else if err.is_builder() {
			Self::InvalidUrl(err.to_string())
		} else if err.is_decode() {
			Self::Decode(err.to_string())
		} else if let Some(status) = err.status() {
			Self::Http(status.as_u16())
		} else {
			Self::InvalidResponse(err.to_string())
		}
	}

	/// HTTP status, when the failure was a non-2xx answer.
	pub fn status(&self) -> Option<u16> {
		match self {
			Self::Http(status) => Some(*status),
			_ => None,
		}
	}

	/// True for 401/403 answers, i.e. the token itself was refused.
	pub fn is_auth_rejection(&self) -> bool {
		matches!(self.status(), Some(401) | Some(403))
	}
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
	pub base_url: String,
	pub request_timeout: Duration,
	pub user_agent: String,
}

impl Default for ApiConfig {
	fn default() -> Self {
		Self {
			base_url: DEFAULT_API_BASE_URL.to_string(),
			request_timeout: DEFAULT_REQUEST_TIMEOUT,
			user_agent: format!("moderate/{}", env!("CARGO_PKG_VERSION")),
		}
	}
}

/// Server answer to a moderation/clear/delete call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionAck {
	#[serde(skip)]
	pub status: u16,
	#[serde(default)]
	pub success: Option<bool>,
	#[serde(default)]
	pub message: Option<String>,
}

impl ActionAck {
	/// A missing `success` flag counts as accepted; only an explicit `false` is a refusal.
	pub fn accepted(&self) -> bool {
		self.success != Some(false)
	}
}

/// Body of `POST /api/v2/channels/{slug}/moderation`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModerationRequest {
	pub user_id: u64,
	#[serde(rename = "type")]
	pub kind: &'static str,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub duration: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListOrPage<T> {
	Page(Paginated<T>),
	List(Vec<T>),
}

impl<T> ListOrPage<T> {
	fn into_vec(self) -> Vec<T> {
		match self {
			Self::Page(page) => page.data,
			Self::List(list) => list,
		}
	}
}

/// Kick REST client. Stateless with respect to credentials: every
/// authenticated call takes the token snapshot it should use.
#[derive(Debug, Clone)]
pub struct KickApi {
	base_url: String,
	client: reqwest::Client,
}

impl KickApi {
	pub fn new(cfg: ApiConfig) -> Result<Self, NetworkError> {
		let base_url = cfg.base_url.trim().trim_end_matches('/').to_string();
		if !(base_url.starts_with("https://") || base_url.starts_with("http://")) {
			return Err(NetworkError::InvalidUrl(cfg.base_url));
		}
		let client = reqwest::Client::builder()
			.timeout(cfg.request_timeout)
			.user_agent(cfg.user_agent)
			.build()
			.map_err(NetworkError::from_reqwest)?;
		Ok(Self { base_url, client })
	}

	pub fn base_url(&self) -> &str {
		&self.base_url
	}

	fn url(&self, path: &str) -> String {
		format!("{}{}", self.base_url, path)
	}

	fn channel_url(&self, slug: &ChannelSlug, rest: &str) -> String {
		format!("{}/api/v2/channels/{}{}", self.base_url, urlencoding::encode(slug.as_str()), rest)
	}

	fn authed(req: RequestBuilder, token: &SecretString) -> RequestBuilder {
		req.header("Authorization", format!("Bearer {}", token.expose().trim()))
			.header("Accept", "application/json")
	}

	async fn send_json<T: DeserializeOwned>(req: RequestBuilder, what: &'static str) -> Result<T, NetworkError> {
		let resp = req.send().await.map_err(NetworkError::from_reqwest)?;
		let status = resp.status();
		if !status.is_success() {
			debug!(%status, what, "kick api request failed");
			return Err(NetworkError::Http(status.as_u16()));
		}
		let body = resp.bytes().await.map_err(NetworkError::from_reqwest)?;
		serde_json::from_slice(&body).map_err(|e| NetworkError::Decode(format!("{what}: {e}")))
	}

	async fn send_ack(req: RequestBuilder, what: &'static str) -> Result<ActionAck, NetworkError> {
		let resp = req.send().await.map_err(NetworkError::from_reqwest)?;
		let status = resp.status();
		if !status.is_success() {
			debug!(%status, what, "kick api action failed");
			return Err(NetworkError::Http(status.as_u16()));
		}
		let body = resp.bytes().await.map_err(NetworkError::from_reqwest)?;
		let mut ack = if status == StatusCode::NO_CONTENT || body.iter().all(u8::is_ascii_whitespace) {
			ActionAck::default()
		} else {
			serde_json::from_slice::<ActionAck>(&body).map_err(|e| NetworkError::Decode(format!("{what}: {e}")))?
		};
		ack.status = status.as_u16();
		Ok(ack)
	}

	pub async fn current_user(&self, token: &SecretString) -> Result<UserProfile, NetworkError> {
		let req = Self::authed(self.client.get(self.url("/api/v2/user")), token);
		Self::send_json(req, "current user").await
	}

	pub async fn moderated_channels(&self, token: &SecretString) -> Result<Vec<Channel>, NetworkError> {
		let req = Self::authed(self.client.get(self.url("/api/v2/channels/moderated")), token);
		let list: ListOrPage<Channel> = Self::send_json(req, "moderated channels").await?;
		Ok(list.into_vec())
	}

	pub async fn channel(&self, token: &SecretString, slug: &ChannelSlug) -> Result<Channel, NetworkError> {
		let req = Self::authed(self.client.get(self.channel_url(slug, "")), token);
		Self::send_json(req, "channel detail").await
	}

	pub async fn update_channel(
		&self,
		token: &SecretString,
		slug: &ChannelSlug,
		update: &ChannelUpdate,
	) -> Result<Channel, NetworkError> {
		let req = Self::authed(self.client.patch(self.channel_url(slug, "")), token).json(update);
		Self::send_json(req, "channel update").await
	}

	/// Category search; this endpoint is public and sent without credentials.
	pub async fn categories(&self, search: Option<&str>) -> Result<Vec<Category>, NetworkError> {
		let url = match search.map(str::trim).filter(|s| !s.is_empty()) {
			Some(term) => format!("{}?search={}", self.url("/api/v1/categories"), urlencoding::encode(term)),
			None => self.url("/api/v1/categories"),
		};
		let req = self.client.get(url).header("Accept", "application/json");
		let list: ListOrPage<Category> = Self::send_json(req, "categories").await?;
		Ok(list.into_vec())
	}

	pub async fn moderate(
		&self,
		token: &SecretString,
		slug: &ChannelSlug,
		body: &ModerationRequest,
	) -> Result<ActionAck, NetworkError> {
		let req = Self::authed(self.client.post(self.channel_url(slug, "/moderation")), token).json(body);
		Self::send_ack(req, "moderation action").await
	}

	pub async fn clear_chat(&self, token: &SecretString, slug: &ChannelSlug) -> Result<ActionAck, NetworkError> {
		let req = Self::authed(self.client.post(self.channel_url(slug, "/chatroom/clear")), token);
		Self::send_ack(req, "clear chat").await
	}

	pub async fn delete_message(
		&self,
		token: &SecretString,
		slug: &ChannelSlug,
		message_id: &str,
	) -> Result<ActionAck, NetworkError> {
		let rest = format!("/messages/{}", urlencoding::encode(message_id));
		let req = Self::authed(self.client.delete(self.channel_url(slug, &rest)), token);
		Self::send_ack(req, "delete message").await
	}

	pub async fn moderation_history(
		&self,
		token: &SecretString,
		slug: &ChannelSlug,
	) -> Result<Vec<ModerationAction>, NetworkError> {
		let req = Self::authed(self.client.get(self.channel_url(slug, "/moderation/history")), token);
		let list: ListOrPage<ModerationAction> = Self::send_json(req, "moderation history").await?;
		Ok(list.into_vec())
	}

	pub async fn user_moderation_info(
		&self,
		token: &SecretString,
		slug: &ChannelSlug,
		user_id: u64,
	) -> Result<UserModerationInfo, NetworkError> {
		let rest = format!("/users/{user_id}/moderation");
		let req = Self::authed(self.client.get(self.channel_url(slug, &rest)), token);
		Self::send_json(req, "user moderation info").await
	}
}
