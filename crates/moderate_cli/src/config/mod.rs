#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use moderate_core::api::DEFAULT_REQUEST_TIMEOUT;
use moderate_core::{ApiConfig, AuthConfig, ChatConfig, ModerationConfig};
use serde::Deserialize;
use tracing::{info, warn};
use url::Url;

const MIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default config path: `~/.moderate/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".moderate").join("config.toml"))
}

/// Load the CLI config from TOML and `MODERATE_*` env overrides.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<CliConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = CliConfig::from_file(file_cfg);
	apply_overrides(&mut cfg, |key| std::env::var(key).ok());
	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct CliConfig {
	pub auth: AuthSettings,
	pub api: ApiSettings,
	pub chat: ChatSettings,
	pub moderation: ModerationSettings,
	pub vault: VaultSettings,
}

/// OAuth client registration. `client_id` and `redirect_uri` have no defaults.
#[derive(Debug, Clone, Default)]
pub struct AuthSettings {
	pub client_id: Option<String>,
	pub redirect_uri: Option<String>,
	pub authorize_url: Option<String>,
	pub token_url: Option<String>,
	pub scopes: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
	pub base_url: Option<String>,
	/// Always within 15..=30 s.
	pub request_timeout: Duration,
}

impl Default for ApiSettings {
	fn default() -> Self {
		Self {
			base_url: None,
			request_timeout: DEFAULT_REQUEST_TIMEOUT,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct ChatSettings {
	pub pusher_ws_url: Option<String>,
	pub subscribe_delay: Option<Duration>,
	pub connect_timeout: Option<Duration>,
	pub window_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct ModerationSettings {
	pub history_capacity: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VaultBackend {
	#[default]
	Keyring,
	File,
	Memory,
}

impl FromStr for VaultBackend {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"keyring" | "keychain" => Ok(Self::Keyring),
			"file" => Ok(Self::File),
			"memory" => Ok(Self::Memory),
			other => Err(anyhow!("unknown vault backend: {other} (expected keyring, file or memory)")),
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct VaultSettings {
	pub backend: VaultBackend,
	/// File store path; also the fallback for the keyring backend.
	pub file: Option<PathBuf>,
}

impl CliConfig {
	fn from_file(file: FileConfig) -> Self {
		let backend = match file.vault.backend.as_deref().map(VaultBackend::from_str) {
			Some(Ok(backend)) => backend,
			Some(Err(e)) => {
				warn!(error = %e, "vault config: falling back to keyring");
				VaultBackend::Keyring
			}
			None => VaultBackend::Keyring,
		};

		Self {
			auth: AuthSettings {
				client_id: non_empty(file.auth.client_id),
				redirect_uri: non_empty(file.auth.redirect_uri),
				authorize_url: non_empty(file.auth.authorize_url),
				token_url: non_empty(file.auth.token_url),
				scopes: file.auth.scopes.filter(|s| !s.is_empty()),
			},
			api: ApiSettings {
				base_url: non_empty(file.api.base_url),
				request_timeout: file
					.api
					.request_timeout_ms
					.map(clamp_request_timeout)
					.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
			},
			chat: ChatSettings {
				pusher_ws_url: non_empty(file.chat.pusher_ws_url),
				subscribe_delay: file.chat.subscribe_delay_ms.map(Duration::from_millis),
				connect_timeout: file.chat.connect_timeout_ms.filter(|v| *v > 0).map(Duration::from_millis),
				window_capacity: file.chat.window_capacity.filter(|v| *v > 0),
			},
			moderation: ModerationSettings {
				history_capacity: file.moderation.history_capacity.filter(|v| *v > 0),
			},
			vault: VaultSettings {
				backend,
				file: non_empty(file.vault.file).map(PathBuf::from),
			},
		}
	}

	pub fn auth_config(&self) -> anyhow::Result<AuthConfig> {
		let client_id = self
			.auth
			.client_id
			.clone()
			.ok_or_else(|| anyhow!("auth.client_id is not configured (or set MODERATE_KICK_CLIENT_ID)"))?;
		let redirect_uri = self
			.auth
			.redirect_uri
			.clone()
			.ok_or_else(|| anyhow!("auth.redirect_uri is not configured (or set MODERATE_KICK_REDIRECT_URI)"))?;

		let mut cfg = AuthConfig::new(client_id, redirect_uri);
		if let Some(v) = &self.auth.authorize_url {
			cfg.authorize_url = Url::parse(v).with_context(|| format!("parse auth.authorize_url {v}"))?;
		}
		if let Some(v) = &self.auth.token_url {
			cfg.token_url = Url::parse(v).with_context(|| format!("parse auth.token_url {v}"))?;
		}
		if let Some(scopes) = &self.auth.scopes {
			cfg.scopes = scopes.clone();
		}
		Ok(cfg)
	}

	pub fn api_config(&self) -> ApiConfig {
		let mut cfg = ApiConfig {
			request_timeout: self.api.request_timeout,
			..ApiConfig::default()
		};
		if let Some(v) = &self.api.base_url {
			cfg.base_url = v.trim_end_matches('/').to_string();
		}
		cfg
	}

	pub fn chat_config(&self) -> ChatConfig {
		let mut cfg = ChatConfig::default();
		if let Some(v) = &self.chat.pusher_ws_url {
			cfg.ws_url = v.clone();
		}
		if let Some(v) = self.chat.subscribe_delay {
			cfg.subscribe_delay = v;
		}
		if let Some(v) = self.chat.connect_timeout {
			cfg.connect_timeout = v;
		}
		if let Some(v) = self.chat.window_capacity {
			cfg.window_capacity = v;
		}
		cfg
	}

	pub fn moderation_config(&self) -> ModerationConfig {
		let mut cfg = ModerationConfig::default();
		if let Some(v) = self.moderation.history_capacity {
			cfg.history_capacity = v;
		}
		cfg
	}
}

fn clamp_request_timeout(ms: u64) -> Duration {
	let requested = Duration::from_millis(ms);
	let clamped = requested.clamp(MIN_REQUEST_TIMEOUT, MAX_REQUEST_TIMEOUT);
	if clamped != requested {
		warn!(
			requested_ms = ms,
			clamped_ms = clamped.as_millis() as u64,
			"api config: request_timeout out of range; clamped"
		);
	}
	clamped
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	auth: FileAuthConfig,
	#[serde(default)]
	api: FileApiConfig,
	#[serde(default)]
	chat: FileChatConfig,
	#[serde(default)]
	moderation: FileModerationConfig,
	#[serde(default)]
	vault: FileVaultConfig,
}

#[derive(Debug, Default, Deserialize)]
struct FileAuthConfig {
	client_id: Option<String>,
	redirect_uri: Option<String>,
	authorize_url: Option<String>,
	token_url: Option<String>,
	scopes: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct FileApiConfig {
	base_url: Option<String>,
	request_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct FileChatConfig {
	pusher_ws_url: Option<String>,
	subscribe_delay_ms: Option<u64>,
	connect_timeout_ms: Option<u64>,
	window_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct FileModerationConfig {
	history_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct FileVaultConfig {
	backend: Option<String>,
	file: Option<String>,
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_overrides(cfg: &mut CliConfig, env: impl Fn(&str) -> Option<String>) {
	let var = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = var("MODERATE_KICK_CLIENT_ID") {
		cfg.auth.client_id = Some(v);
		info!("auth config: client_id overridden by env");
	}

	if let Some(v) = var("MODERATE_KICK_REDIRECT_URI") {
		cfg.auth.redirect_uri = Some(v);
		info!("auth config: redirect_uri overridden by env");
	}

	if let Some(v) = var("MODERATE_API_BASE_URL") {
		cfg.api.base_url = Some(v);
		info!("api config: base_url overridden by env");
	}

	if let Some(v) = var("MODERATE_PUSHER_WS_URL") {
		cfg.chat.pusher_ws_url = Some(v);
		info!("chat config: pusher_ws_url overridden by env");
	}

	if let Some(v) = var("MODERATE_REQUEST_TIMEOUT_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.api.request_timeout = clamp_request_timeout(ms);
		info!(ms, "api config: request_timeout overridden by env");
	}

	if let Some(v) = var("MODERATE_SUBSCRIBE_DELAY_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.chat.subscribe_delay = Some(Duration::from_millis(ms));
		info!(ms, "chat config: subscribe_delay overridden by env");
	}

	if let Some(v) = var("MODERATE_VAULT") {
		match v.parse::<VaultBackend>() {
			Ok(backend) => {
				cfg.vault.backend = backend;
				info!(?backend, "vault config: backend overridden by env");
			}
			Err(e) => warn!(error = %e, "vault config: ignoring MODERATE_VAULT"),
		}
	}

	if let Some(v) = var("MODERATE_VAULT_FILE") {
		cfg.vault.file = Some(PathBuf::from(v));
		info!("vault config: file overridden by env");
	}
}
