#![forbid(unsafe_code)]

mod config;
mod consent;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow, bail};
use moderate_core::moderation::{MAX_TIMEOUT_SECS, MIN_TIMEOUT_SECS};
use moderate_core::vault::KEYRING_SERVICE;
use moderate_core::{
	ChatClient, ChatEvent, ConnectionState, CredentialVault, FileVault, KeyringVault, KickApi, MemoryVault, ModerationCommand,
	ModerationDispatcher, PkceAuthenticator, SecretString, SessionManager, SessionState, TokenSource,
};
use moderate_domain::{ChannelSlug, ChannelUpdate, ChatroomId};
use tracing::{info, warn};

use crate::config::{CliConfig, VaultBackend, default_config_path, load_config_from_path};
use crate::consent::BrowserConsent;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: moderate [--config path] [--ephemeral] <command> [args]\n\
\n\
Options:\n\
	--config     Config file (default: ~/.moderate/config.toml)\n\
	--ephemeral  Keep credentials in memory only for this run\n\
	--help       Show this help\n\
\n\
Commands:\n\
	login                                   Authorize in the browser and store the session\n\
	logout                                  Forget the stored session\n\
	whoami                                  Validate the stored session and print the user\n\
	channels                                List channels you moderate\n\
	channel <slug>                          Show channel detail\n\
	set-title <slug> <title>                Update the stream title\n\
	categories [search]                     List or search categories\n\
	chat <chatroom-id>                      Stream live chat until Ctrl-C\n\
	timeout <slug> <user-id> <secs> [reason]  Time a user out (60..=86400 s)\n\
	ban <slug> <user-id> [reason]           Ban a user\n\
	unban <slug> <user-id>                  Lift a ban or timeout\n\
	kick <slug> <user-id> [reason]          Kick a user from chat\n\
	clear <slug>                            Clear the chatroom\n\
	delete <slug> <message-id>              Delete one message\n\
	history <slug>                          Show moderation history\n\
	user-info <slug> <user-id>              Show a user's moderation status\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,moderate_core=debug".to_string());
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(false)
		.with_writer(std::io::stderr)
		.init();
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
	Login,
	Logout,
	Whoami,
	Channels,
	Channel(ChannelSlug),
	SetTitle(ChannelSlug, String),
	Categories(Option<String>),
	Chat(ChatroomId),
	Moderate(ModerationCommand),
	History(ChannelSlug),
	UserInfo(ChannelSlug, u64),
}

struct Args {
	config: Option<PathBuf>,
	ephemeral: bool,
	command: Command,
}

fn parse_args() -> Args {
	let mut config = None;
	let mut ephemeral = false;
	let mut rest = Vec::new();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config = Some(PathBuf::from(v));
			}
			"--ephemeral" => ephemeral = true,
			other if other.starts_with("--") => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
			_ => rest.push(arg),
		}
	}

	let command = parse_command(&rest).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	Args {
		config,
		ephemeral,
		command,
	}
}

fn parse_command(args: &[String]) -> Result<Command, String> {
	let (name, rest) = args.split_first().ok_or_else(|| "missing command".to_string())?;
	let arg = |i: usize, what: &str| rest.get(i).map(String::as_str).ok_or_else(|| format!("{name}: missing <{what}>"));
	let slug = |i: usize| {
		arg(i, "slug").and_then(|s| ChannelSlug::new(s).map_err(|e| format!("{name}: invalid slug: {e}")))
	};
	let user_id = |i: usize| {
		arg(i, "user-id").and_then(|s| s.parse::<u64>().map_err(|_| format!("{name}: invalid user id: {s}")))
	};
	let tail = |from: usize| Some(rest.get(from..)?.join(" ")).filter(|r| !r.trim().is_empty());

	let command = match name.as_str() {
		"login" => Command::Login,
		"logout" => Command::Logout,
		"whoami" => Command::Whoami,
		"channels" => Command::Channels,
		"channel" => Command::Channel(slug(0)?),
		"set-title" => {
			let title = rest.get(1..).map(|t| t.join(" ")).unwrap_or_default();
			if title.trim().is_empty() {
				return Err("set-title: missing <title>".to_string());
			}
			Command::SetTitle(slug(0)?, title)
		}
		"categories" => Command::Categories(tail(0)),
		"chat" => {
			let raw = arg(0, "chatroom-id")?;
			let id = raw
				.parse::<ChatroomId>()
				.map_err(|e| format!("chat: invalid chatroom id {raw}: {e}"))?;
			Command::Chat(id)
		}
		"timeout" => {
			let raw = arg(2, "secs")?;
			let duration = raw
				.parse::<u32>()
				.ok()
				.filter(|d| (MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(d))
				.ok_or_else(|| format!("timeout: duration must be {MIN_TIMEOUT_SECS}..={MAX_TIMEOUT_SECS} seconds"))?;
			Command::Moderate(ModerationCommand::Timeout {
				channel_slug: slug(0)?,
				user_id: user_id(1)?,
				duration,
				reason: tail(3),
			})
		}
		"ban" => Command::Moderate(ModerationCommand::Ban {
			channel_slug: slug(0)?,
			user_id: user_id(1)?,
			reason: tail(2),
		}),
		"unban" => Command::Moderate(ModerationCommand::Unban {
			channel_slug: slug(0)?,
			user_id: user_id(1)?,
		}),
		"kick" => Command::Moderate(ModerationCommand::Kick {
			channel_slug: slug(0)?,
			user_id: user_id(1)?,
			reason: tail(2),
		}),
		"clear" => Command::Moderate(ModerationCommand::ClearChat { channel_slug: slug(0)? }),
		"delete" => Command::Moderate(ModerationCommand::DeleteMessage {
			channel_slug: slug(0)?,
			message_id: arg(1, "message-id")?.to_string(),
		}),
		"history" => Command::History(slug(0)?),
		"user-info" => Command::UserInfo(slug(0)?, user_id(1)?),
		other => return Err(format!("Unknown command: {other}")),
	};
	Ok(command)
}

fn open_vault(cfg: &CliConfig, ephemeral: bool) -> anyhow::Result<Arc<dyn CredentialVault>> {
	if ephemeral || cfg.vault.backend == VaultBackend::Memory {
		info!("credentials kept in memory for this run");
		return Ok(Arc::new(MemoryVault::new()));
	}

	let path = match &cfg.vault.file {
		Some(path) => path.clone(),
		None => FileVault::default_path().ok_or_else(|| anyhow!("could not determine home directory"))?,
	};
	let file = FileVault::new(path);
	let vault: Arc<dyn CredentialVault> = match cfg.vault.backend {
		VaultBackend::File => Arc::new(file),
		_ => Arc::new(KeyringVault::new(KEYRING_SERVICE, file)),
	};
	Ok(vault)
}

/// Restore the stored session or fail with a hint to log in.
fn require_token(session: &Arc<SessionManager>) -> anyhow::Result<SecretString> {
	if !session.restore().is_authenticated() {
		bail!("not logged in; run `moderate login` first");
	}
	session.token().ok_or_else(|| anyhow!("session was cleared; run `moderate login`"))
}

fn print_state(state: &SessionState) {
	match state {
		SessionState::Authenticated(Some(user)) => println!("logged in as {} (id {}, /{})", user.username, user.id, user.slug),
		SessionState::Authenticated(None) => println!("logged in (profile unavailable)"),
		SessionState::Authenticating => println!("authentication in progress"),
		SessionState::Unauthenticated | SessionState::Invalid => println!("not logged in"),
	}
}

fn print_event(event: &ChatEvent) {
	match event {
		ChatEvent::Status(state) => eprintln!("-- {state:?}"),
		ChatEvent::Subscribed { channel } => eprintln!("-- subscribed to {channel}"),
		ChatEvent::Message(msg) => {
			let at = msg
				.timestamp()
				.map(|t| t.format("%H:%M:%S").to_string())
				.unwrap_or_else(|| "--:--:--".to_string());
			println!("[{at}] {}: {}  ({})", msg.sender.username, msg.content, msg.id);
		}
		ChatEvent::MessageDeleted { message_id } => println!("-- message {message_id} deleted"),
		ChatEvent::ChatroomCleared { chatroom_id } => println!("-- chatroom {chatroom_id} cleared"),
	}
}

async fn stream_chat(cfg: &CliConfig, session: &Arc<SessionManager>, chatroom_id: ChatroomId) -> anyhow::Result<()> {
	require_token(session)?;
	let tokens: Arc<dyn TokenSource> = session.clone();
	let (client, mut events) = ChatClient::new(cfg.chat_config(), tokens);
	client.connect(chatroom_id).context("connect chat")?;

	loop {
		tokio::select! {
			event = events.recv() => {
				let Some(event) = event else { break };
				print_event(&event);
				if matches!(event, ChatEvent::Status(ConnectionState::Disconnected | ConnectionState::Errored)) {
					break;
				}
			}
			_ = tokio::signal::ctrl_c() => {
				info!("interrupted; closing chat");
				client.disconnect();
				break;
			}
		}
	}

	info!(buffered = client.messages().len(), "chat closed");
	client.shutdown();
	Ok(())
}

async fn moderate(cfg: &CliConfig, session: &Arc<SessionManager>, command: ModerationCommand) -> anyhow::Result<()> {
	require_token(session)?;
	let tokens: Arc<dyn TokenSource> = session.clone();
	let dispatcher = ModerationDispatcher::new(session.api().clone(), tokens, cfg.moderation_config());
	let mut updates = dispatcher.history_updates();

	let kind = command.kind();
	let slug = command.channel_slug().clone();
	dispatcher.execute(command).await.with_context(|| format!("{kind} in {slug}"))?;
	println!("{kind} applied in {slug}");

	match tokio::time::timeout(Duration::from_secs(5), updates.wait_for(Option::is_some)).await {
		Ok(Ok(view)) => {
			if let Some(latest) = view.as_ref().and_then(|v| v.actions.first()) {
				println!(
					"latest: {} {} by {} at {}",
					latest.kind, latest.target_username, latest.moderator_username, latest.created_at
				);
			}
		}
		_ => warn!(channel = %slug, "moderation history did not refresh"),
	}
	Ok(())
}

async fn run(cfg: CliConfig, session: Arc<SessionManager>, command: Command) -> anyhow::Result<()> {
	match command {
		Command::Login => {
			let state = session.login(&BrowserConsent).await.context("login")?;
			print_state(&state);
		}
		Command::Logout => {
			session.logout();
			println!("logged out");
		}
		Command::Whoami => {
			if session.restore().is_authenticated() {
				print_state(&session.validate().await);
			} else {
				print_state(&session.state());
			}
		}
		Command::Channels => {
			let token = require_token(&session)?;
			let channels = session.api().moderated_channels(&token).await.context("list moderated channels")?;
			if channels.is_empty() {
				println!("no moderated channels");
			}
			for ch in channels {
				let live = if ch.is_live { "live" } else { "offline" };
				println!("{}\t{}\tchatroom={}", ch.slug, live, ch.chatroom_id().map(|id| id.to_string()).unwrap_or_default());
			}
		}
		Command::Channel(slug) => {
			let token = require_token(&session)?;
			let ch = session.api().channel(&token, &slug).await.with_context(|| format!("fetch channel {slug}"))?;
			println!("slug:       {}", ch.slug);
			println!("id:         {}", ch.id);
			println!("live:       {}", ch.is_live);
			println!("followers:  {}", ch.followers_count);
			if let Some(category) = &ch.category {
				println!("category:   {}", category.name);
			}
			if let Some(id) = ch.chatroom_id() {
				println!("chatroom:   {id}");
			}
		}
		Command::SetTitle(slug, title) => {
			let token = require_token(&session)?;
			let update = ChannelUpdate {
				title: Some(title),
				..ChannelUpdate::default()
			};
			session
				.api()
				.update_channel(&token, &slug, &update)
				.await
				.with_context(|| format!("update channel {slug}"))?;
			println!("updated {slug}");
		}
		Command::Categories(search) => {
			let categories = session.api().categories(search.as_deref()).await.context("list categories")?;
			for c in categories {
				println!("{}\t{}\t{}", c.id, c.slug, c.name);
			}
		}
		Command::Chat(chatroom_id) => stream_chat(&cfg, &session, chatroom_id).await?,
		Command::Moderate(command) => moderate(&cfg, &session, command).await?,
		Command::History(slug) => {
			require_token(&session)?;
			let tokens: Arc<dyn TokenSource> = session.clone();
			let dispatcher = ModerationDispatcher::new(session.api().clone(), tokens, cfg.moderation_config());
			let actions = dispatcher.history(&slug).await.with_context(|| format!("history for {slug}"))?;
			let shown = dispatcher.last_history().map(|v| v.actions).unwrap_or_default();
			for a in &shown {
				let duration = a.duration.map(|d| format!(" {d}s")).unwrap_or_default();
				let reason = a.reason.as_deref().map(|r| format!(" \"{r}\"")).unwrap_or_default();
				println!(
					"{}  {}{} {} by {}{}",
					a.created_at, a.kind, duration, a.target_username, a.moderator_username, reason
				);
			}
			if actions.len() > shown.len() {
				println!("({} older entries not shown)", actions.len() - shown.len());
			}
		}
		Command::UserInfo(slug, user_id) => {
			require_token(&session)?;
			let tokens: Arc<dyn TokenSource> = session.clone();
			let dispatcher = ModerationDispatcher::new(session.api().clone(), tokens, cfg.moderation_config());
			let info = dispatcher
				.user_moderation_info(&slug, user_id)
				.await
				.with_context(|| format!("moderation info for {user_id} in {slug}"))?;
			println!("banned:     {}", info.is_banned);
			if let Some(reason) = &info.ban_reason {
				println!("  reason:   {reason}");
			}
			println!("timed out:  {}", info.is_timed_out);
			if let Some(until) = &info.timeout_expires_at {
				println!("  until:    {until}");
			}
			if let Some(reason) = &info.timeout_reason {
				println!("  reason:   {reason}");
			}
		}
	}
	Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = parse_args();
	init_tracing();

	let config_path = match args.config {
		Some(path) => path,
		None => default_config_path()?,
	};
	let cfg = load_config_from_path(&config_path)?;

	let vault = open_vault(&cfg, args.ephemeral)?;
	let api = KickApi::new(cfg.api_config()).context("build api client")?;
	let auth = PkceAuthenticator::new(cfg.auth_config()?).context("build authenticator")?;
	let session = Arc::new(SessionManager::new(vault, api, auth));

	run(cfg, session, args.command).await
}
