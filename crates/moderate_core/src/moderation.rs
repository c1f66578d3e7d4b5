#![forbid(unsafe_code)]

use std::sync::Arc;

use moderate_domain::{ChannelSlug, ModerationAction, ModerationType, UserModerationInfo};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::{ActionAck, KickApi, ModerationRequest, NetworkError};
use crate::{SecretString, TokenSource};

pub const DEFAULT_HISTORY_CAPACITY: usize = 100;
pub const MIN_TIMEOUT_SECS: u32 = 60;
pub const MAX_TIMEOUT_SECS: u32 = 86_400;

#[derive(Debug, Clone)]
pub struct ModerationConfig {
	pub history_capacity: usize,
}

impl Default for ModerationConfig {
	fn default() -> Self {
		Self {
			history_capacity: DEFAULT_HISTORY_CAPACITY,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModerationCommand {
	Timeout {
		channel_slug: ChannelSlug,
		user_id: u64,
		/// Seconds.
		duration: u32,
		reason: Option<String>,
	},
	Ban {
		channel_slug: ChannelSlug,
		user_id: u64,
		reason: Option<String>,
	},
	Unban {
		channel_slug: ChannelSlug,
		user_id: u64,
	},
	Kick {
		channel_slug: ChannelSlug,
		user_id: u64,
		reason: Option<String>,
	},
	ClearChat {
		channel_slug: ChannelSlug,
	},
	DeleteMessage {
		channel_slug: ChannelSlug,
		message_id: String,
	},
}

impl ModerationCommand {
	pub fn channel_slug(&self) -> &ChannelSlug {
		match self {
			Self::Timeout { channel_slug, .. }
			| Self::Ban { channel_slug, .. }
			| Self::Unban { channel_slug, .. }
			| Self::Kick { channel_slug, .. }
			| Self::ClearChat { channel_slug }
			| Self::DeleteMessage { channel_slug, .. } => channel_slug,
		}
	}

	pub fn kind(&self) -> ModerationType {
		match self {
			Self::Timeout { .. } => ModerationType::Timeout,
			Self::Ban { .. } => ModerationType::Ban,
			Self::Unban { .. } => ModerationType::Unban,
			Self::Kick { .. } => ModerationType::Kick,
			Self::ClearChat { .. } => ModerationType::ChatClear,
			Self::DeleteMessage { .. } => ModerationType::MessageDelete,
		}
	}

	/// Body for the user-targeted actions that share the moderation endpoint.
	fn moderation_request(&self) -> Option<ModerationRequest> {
		let clean = |reason: &Option<String>| reason.as_deref().map(str::trim).filter(|r| !r.is_empty()).map(str::to_string);
		match self {
			Self::Timeout {
				user_id,
				duration,
				reason,
				..
			} => Some(ModerationRequest {
				user_id: *user_id,
				kind: ModerationType::Timeout.as_str(),
				duration: Some(*duration),
				reason: clean(reason),
			}),
			Self::Ban { user_id, reason, .. } => Some(ModerationRequest {
				user_id: *user_id,
				kind: ModerationType::Ban.as_str(),
				duration: None,
				reason: clean(reason),
			}),
			Self::Unban { user_id, .. } => Some(ModerationRequest {
				user_id: *user_id,
				kind: ModerationType::Unban.as_str(),
				duration: None,
				reason: None,
			}),
			Self::Kick { user_id, reason, .. } => Some(ModerationRequest {
				user_id: *user_id,
				kind: ModerationType::Kick.as_str(),
				duration: None,
				reason: clean(reason),
			}),
			Self::ClearChat { .. } | Self::DeleteMessage { .. } => None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModerationError {
	#[error("not authenticated")]
	Unauthenticated,
	#[error("moderation rejected: status={0}")]
	Rejected(u16),
	#[error("malformed moderation response: {0}")]
	Malformed(String),
	#[error(transparent)]
	Network(NetworkError),
}

impl From<NetworkError> for ModerationError {
	fn from(err: NetworkError) -> Self {
		match err {
			NetworkError::Http(status) => Self::Rejected(status),
			NetworkError::Decode(reason) => Self::Malformed(reason),
			other => Self::Network(other),
		}
	}
}

/// Most recent moderation history for one channel, newest entries as the
/// server ordered them, truncated to the configured capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryView {
	pub channel_slug: ChannelSlug,
	pub actions: Vec<ModerationAction>,
}

#[derive(Clone)]
pub struct ModerationDispatcher {
	api: KickApi,
	tokens: Arc<dyn TokenSource>,
	cfg: ModerationConfig,
	history_tx: Arc<watch::Sender<Option<HistoryView>>>,
}

impl ModerationDispatcher {
	pub fn new(api: KickApi, tokens: Arc<dyn TokenSource>, cfg: ModerationConfig) -> Self {
		let (history_tx, _) = watch::channel(None);
		Self {
			api,
			tokens,
			cfg,
			history_tx: Arc::new(history_tx),
		}
	}

	fn token(&self) -> Result<SecretString, ModerationError> {
		self.tokens.token().ok_or(ModerationError::Unauthenticated)
	}

	/// Send one command. On success a history refresh for the same channel
	/// runs in the background; failures are returned as-is and never retried.
	pub async fn execute(&self, command: ModerationCommand) -> Result<(), ModerationError> {
		let token = self.token()?;
		let kind = command.kind();
		let slug = command.channel_slug().clone();
		metrics::counter!("moderate_moderation_commands_total", "kind" => kind.as_str()).increment(1);

		let result = match &command {
			ModerationCommand::ClearChat { .. } => self.api.clear_chat(&token, &slug).await,
			ModerationCommand::DeleteMessage { message_id, .. } => {
				self.api.delete_message(&token, &slug, message_id).await
			}
			other => match other.moderation_request() {
				Some(body) => self.api.moderate(&token, &slug, &body).await,
				None => return Err(ModerationError::Malformed(format!("no request body for {kind}"))),
			},
		};

		let ack = match result {
			Ok(ack) => ack,
			Err(err) => {
				metrics::counter!("moderate_moderation_failures_total", "kind" => kind.as_str()).increment(1);
				warn!(%kind, channel = %slug, error = %err, "moderation command failed");
				return Err(err.into());
			}
		};
		check_ack(kind, &slug, &ack)?;
		info!(%kind, channel = %slug, "moderation command applied");

		let this = self.clone();
		tokio::spawn(async move {
			if let Err(err) = this.refresh_history(&slug, &token).await {
				warn!(channel = %slug, error = %err, "moderation history refresh failed");
			}
		});
		Ok(())
	}

	/// Fetch the channel's moderation history and publish it as the current view.
	pub async fn history(&self, channel_slug: &ChannelSlug) -> Result<Vec<ModerationAction>, ModerationError> {
		let token = self.token()?;
		self.refresh_history(channel_slug, &token).await
	}

	async fn refresh_history(
		&self,
		channel_slug: &ChannelSlug,
		token: &SecretString,
	) -> Result<Vec<ModerationAction>, ModerationError> {
		let actions = self.api.moderation_history(token, channel_slug).await?;
		debug!(channel = %channel_slug, count = actions.len(), "moderation history fetched");
		let view = HistoryView {
			channel_slug: channel_slug.clone(),
			actions: actions.iter().take(self.cfg.history_capacity).cloned().collect(),
		};
		self.history_tx.send_replace(Some(view));
		Ok(actions)
	}

	pub fn last_history(&self) -> Option<HistoryView> {
		self.history_tx.borrow().clone()
	}

	pub fn history_updates(&self) -> watch::Receiver<Option<HistoryView>> {
		self.history_tx.subscribe()
	}

	pub async fn user_moderation_info(
		&self,
		channel_slug: &ChannelSlug,
		user_id: u64,
	) -> Result<UserModerationInfo, ModerationError> {
		let token = self.token()?;
		Ok(self.api.user_moderation_info(&token, channel_slug, user_id).await?)
	}
}

fn check_ack(kind: ModerationType, slug: &ChannelSlug, ack: &ActionAck) -> Result<(), ModerationError> {
	if ack.accepted() {
		return Ok(());
	}
	metrics::counter!("moderate_moderation_failures_total", "kind" => kind.as_str()).increment(1);
	warn!(
		%kind,
		channel = %slug,
		message = ack.message.as_deref().unwrap_or(""),
		"moderation command refused"
	);
	Err(ModerationError::Rejected(ack.status))
}
