#![forbid(unsafe_code)]

//! Realtime chat over Kick's Pusher broker.
//!
//! A single actor task owns the socket, the connection state and the message
//! window. [`ChatClient`] handles only send commands to it and read snapshots.

pub mod pusher;
pub mod window;

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use moderate_domain::{ChatMessage, ChatroomId, ChatroomTopic};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::{SecretString, TokenSource};

pub use pusher::{DecodeError, Frame, decode_frame};
pub use window::{DEFAULT_WINDOW_CAPACITY, MessageWindow};

pub const DEFAULT_PUSHER_URL: &str =
	"wss://ws-us2.pusher.com/app/32cbd69e4b950bf97679?protocol=7&client=js&version=7.4.0&flash=false";
pub const DEFAULT_SUBSCRIBE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_EVENT_QUEUE: usize = 1024;

type PusherWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ChatConfig {
	pub ws_url: String,
	/// Delay between opening the socket and sending `pusher:subscribe`.
	pub subscribe_delay: Duration,
	/// Upper bound for the handshake plus `pusher:connection_established`.
	pub connect_timeout: Duration,
	pub window_capacity: usize,
	pub event_queue: usize,
}

impl Default for ChatConfig {
	fn default() -> Self {
		Self {
			ws_url: DEFAULT_PUSHER_URL.to_string(),
			subscribe_delay: DEFAULT_SUBSCRIBE_DELAY,
			connect_timeout: DEFAULT_CONNECT_TIMEOUT,
			window_capacity: DEFAULT_WINDOW_CAPACITY,
			event_queue: DEFAULT_EVENT_QUEUE,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Disconnected,
	Connecting,
	Connected,
	Errored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
	Status(ConnectionState),
	Subscribed { channel: String },
	Message(ChatMessage),
	MessageDeleted { message_id: String },
	ChatroomCleared { chatroom_id: ChatroomId },
}

pub type ChatEventRx = mpsc::Receiver<ChatEvent>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
	#[error("no session token available")]
	Unauthenticated,
	#[error("chat client has shut down")]
	Closed,
}

#[derive(Debug)]
enum Command {
	Connect { chatroom_id: ChatroomId, token: SecretString },
	Disconnect,
	Clear(oneshot::Sender<()>),
	Shutdown,
}

/// Handle to the chat actor. Cloning is cheap; the actor stops once every
/// handle is dropped or [`ChatClient::shutdown`] is called.
#[derive(Clone)]
pub struct ChatClient {
	command_tx: mpsc::UnboundedSender<Command>,
	state_rx: watch::Receiver<ConnectionState>,
	window: Arc<RwLock<MessageWindow>>,
	tokens: Arc<dyn TokenSource>,
}

impl ChatClient {
	/// Spawn the actor on the current tokio runtime.
	pub fn new(cfg: ChatConfig, tokens: Arc<dyn TokenSource>) -> (Self, ChatEventRx) {
		let (command_tx, command_rx) = mpsc::unbounded_channel();
		let (events_tx, events_rx) = mpsc::channel(cfg.event_queue.max(1));
		let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
		let window = Arc::new(RwLock::new(MessageWindow::new(cfg.window_capacity)));

		let actor = Actor {
			cfg,
			commands: command_rx,
			events: events_tx,
			state_tx,
			window: Arc::clone(&window),
		};
		tokio::spawn(actor.run());

		(
			Self {
				command_tx,
				state_rx,
				window,
				tokens,
			},
			events_rx,
		)
	}

	/// Subscribe to `chatroom_id`, tearing down any current connection first.
	/// The session token is read once, here.
	pub fn connect(&self, chatroom_id: ChatroomId) -> Result<(), ChatError> {
		let token = self.tokens.token().ok_or(ChatError::Unauthenticated)?;
		self.command_tx
			.send(Command::Connect { chatroom_id, token })
			.map_err(|_| ChatError::Closed)
	}

	/// Close the socket. Calling it while already disconnected does nothing.
	pub fn disconnect(&self) {
		let _ = self.command_tx.send(Command::Disconnect);
	}

	/// Empty the message window; the connection is left alone.
	pub async fn clear(&self) -> Result<(), ChatError> {
		let (ack_tx, ack_rx) = oneshot::channel();
		self.command_tx
			.send(Command::Clear(ack_tx))
			.map_err(|_| ChatError::Closed)?;
		ack_rx.await.map_err(|_| ChatError::Closed)
	}

	pub fn shutdown(&self) {
		let _ = self.command_tx.send(Command::Shutdown);
	}

	pub fn state(&self) -> ConnectionState {
		*self.state_rx.borrow()
	}

	pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
		self.state_rx.clone()
	}

	/// Copy of the current window, oldest first.
	pub fn messages(&self) -> Vec<ChatMessage> {
		self.window.read().snapshot()
	}
}

struct Actor {
	cfg: ChatConfig,
	commands: mpsc::UnboundedReceiver<Command>,
	events: mpsc::Sender<ChatEvent>,
	state_tx: watch::Sender<ConnectionState>,
	window: Arc<RwLock<MessageWindow>>,
}

impl Actor {
	async fn run(mut self) {
		let mut pending: Option<Command> = None;
		loop {
			let cmd = match pending.take() {
				Some(cmd) => cmd,
				None => match self.commands.recv().await {
					Some(cmd) => cmd,
					None => break,
				},
			};
			match cmd {
				Command::Connect { chatroom_id, token } => {
					pending = self.run_connection(chatroom_id, token).await;
				}
				Command::Disconnect => self.set_state(ConnectionState::Disconnected),
				Command::Clear(ack) => self.clear_window(ack),
				Command::Shutdown => break,
			}
		}
		self.set_state(ConnectionState::Disconnected);
		debug!("chat actor stopped");
	}

	fn set_state(&self, state: ConnectionState) {
		let changed = self.state_tx.send_if_modified(|current| {
			if *current == state {
				false
			} else {
				*current = state;
				true
			}
		});
		if changed {
			debug!(?state, "chat connection state");
			self.emit(ChatEvent::Status(state));
		}
	}

	fn emit(&self, event: ChatEvent) {
		if let Err(err) = self.events.try_send(event) {
			metrics::counter!("moderate_chat_events_dropped_total").increment(1);
			debug!(error = %err, "chat event dropped");
		}
	}

	fn clear_window(&self, ack: oneshot::Sender<()>) {
		self.window.write().clear();
		let _ = ack.send(());
	}

	/// Drive one connection until it ends. Returns a command that interrupted
	/// it and still has to be handled (a new `Connect` or `Shutdown`).
	async fn run_connection(&mut self, chatroom_id: ChatroomId, token: SecretString) -> Option<Command> {
		self.set_state(ConnectionState::Connecting);
		let started = Instant::now();
		let deadline = started + self.cfg.connect_timeout;
		info!(%chatroom_id, url = %self.cfg.ws_url, "connecting to chat broker");

		let connect = tokio::time::timeout_at(deadline, tokio_tungstenite::connect_async(self.cfg.ws_url.clone()));
		tokio::pin!(connect);

		let mut ws = loop {
			tokio::select! {
				res = &mut connect => match res {
					Ok(Ok((ws, _))) => break ws,
					Ok(Err(err)) => {
						warn!(error = %err, "chat broker connect failed");
						self.set_state(ConnectionState::Errored);
						return None;
					}
					Err(_) => {
						warn!("chat broker connect timed out");
						self.set_state(ConnectionState::Errored);
						return None;
					}
				},
				cmd = self.commands.recv() => match cmd {
					None | Some(Command::Shutdown) => return Some(Command::Shutdown),
					Some(Command::Clear(ack)) => self.clear_window(ack),
					Some(Command::Disconnect) => {
						debug!("connect aborted");
						self.set_state(ConnectionState::Disconnected);
						return None;
					}
					Some(cmd @ Command::Connect { .. }) => return Some(cmd),
				},
			}
		};

		let subscribe_at = started + self.cfg.subscribe_delay;
		let mut subscribe_sent = false;
		let mut connected = false;

		loop {
			tokio::select! {
				cmd = self.commands.recv() => match cmd {
					None | Some(Command::Shutdown) => {
						close(&mut ws).await;
						return Some(Command::Shutdown);
					}
					Some(Command::Clear(ack)) => self.clear_window(ack),
					Some(Command::Disconnect) => {
						close(&mut ws).await;
						info!(%chatroom_id, "chat disconnected");
						self.set_state(ConnectionState::Disconnected);
						return None;
					}
					Some(cmd @ Command::Connect { .. }) => {
						close(&mut ws).await;
						return Some(cmd);
					}
				},
				_ = tokio::time::sleep_until(subscribe_at), if !subscribe_sent => {
					subscribe_sent = true;
					let text = pusher::subscribe_message(chatroom_id, &token);
					if let Err(err) = ws.send(Message::Text(text.into())).await {
						warn!(error = %err, "pusher subscribe send failed");
						self.set_state(ConnectionState::Errored);
						return None;
					}
					debug!(channel = %ChatroomTopic::format(chatroom_id), "pusher subscribe sent");
				}
				_ = tokio::time::sleep_until(deadline), if !connected => {
					warn!("no connection_established from chat broker");
					close(&mut ws).await;
					self.set_state(ConnectionState::Errored);
					return None;
				}
				msg = ws.next() => {
					let Some(msg) = msg else {
						warn!("chat broker stream ended");
						self.set_state(ConnectionState::Errored);
						return None;
					};
					match msg {
						Ok(Message::Text(text)) => {
							if let Err(err) = self.handle_text(&text, chatroom_id, &mut ws, &mut connected).await {
								warn!(error = %err, "chat broker send failed");
								self.set_state(ConnectionState::Errored);
								return None;
							}
						}
						Ok(Message::Close(frame)) => {
							info!(?frame, "chat broker closed the connection");
							self.set_state(ConnectionState::Disconnected);
							return None;
						}
						// tungstenite queues the Pong for a Ping on its own.
						Ok(_) => {}
						Err(err) => {
							warn!(error = %err, "chat broker receive failed");
							self.set_state(ConnectionState::Errored);
							return None;
						}
					}
				}
			}
		}
	}

	async fn handle_text(
		&mut self,
		text: &str,
		chatroom_id: ChatroomId,
		ws: &mut PusherWs,
		connected: &mut bool,
	) -> Result<(), tokio_tungstenite::tungstenite::Error> {
		metrics::counter!("moderate_chat_frames_total").increment(1);
		let frame = match pusher::decode_frame(text) {
			Ok(frame) => frame,
			Err(err) => {
				metrics::counter!("moderate_chat_decode_errors_total").increment(1);
				warn!(error = %err, "dropping undecodable chat frame");
				return Ok(());
			}
		};

		match frame {
			Frame::ConnectionEstablished { socket_id } => {
				*connected = true;
				info!(%chatroom_id, socket_id = socket_id.as_deref().unwrap_or(""), "chat connected");
				self.set_state(ConnectionState::Connected);
			}
			Frame::SubscriptionSucceeded { channel } => {
				let channel = channel.unwrap_or_else(|| ChatroomTopic::format(chatroom_id));
				debug!(%channel, "pusher subscription succeeded");
				self.emit(ChatEvent::Subscribed { channel });
			}
			Frame::ChatMessage(message) => {
				if message.chatroom_id != chatroom_id {
					debug!(got = %message.chatroom_id, %chatroom_id, "ignoring message for another chatroom");
					return Ok(());
				}
				self.window.write().push((*message).clone());
				self.emit(ChatEvent::Message(*message));
			}
			Frame::MessageDeleted { message_id } => self.emit(ChatEvent::MessageDeleted { message_id }),
			Frame::ChatroomCleared { chatroom_id: cleared } => self.emit(ChatEvent::ChatroomCleared {
				chatroom_id: cleared.unwrap_or(chatroom_id),
			}),
			Frame::Ping => ws.send(Message::Text(pusher::pong_message().into())).await?,
			Frame::Error { code, message } => {
				warn!(?code, message = message.as_deref().unwrap_or(""), "pusher error");
			}
			Frame::Unrecognized { event } => debug!(%event, "ignoring chat event"),
		}
		Ok(())
	}
}

async fn close(ws: &mut PusherWs) {
	let frame = CloseFrame {
		code: CloseCode::Away,
		reason: Utf8Bytes::from_static("client disconnect"),
	};
	if let Err(err) = ws.close(Some(frame)).await {
		debug!(error = %err, "chat socket close failed");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn connect_without_token_is_rejected() {
		let (client, _events) = ChatClient::new(ChatConfig::default(), Arc::new(None::<SecretString>));
		assert_eq!(client.connect(ChatroomId(1)), Err(ChatError::Unauthenticated));
		assert_eq!(client.state(), ConnectionState::Disconnected);
	}

	#[tokio::test]
	async fn disconnect_when_idle_is_a_no_op() {
		let (client, mut events) = ChatClient::new(ChatConfig::default(), Arc::new(SecretString::new("t")));
		client.disconnect();
		client.disconnect();
		client.clear().await.unwrap();
		assert_eq!(client.state(), ConnectionState::Disconnected);
		assert!(events.try_recv().is_err());
	}

	#[tokio::test]
	async fn shutdown_closes_the_command_channel() {
		let (client, _events) = ChatClient::new(ChatConfig::default(), Arc::new(SecretString::new("t")));
		client.shutdown();
		let result = tokio::time::timeout(Duration::from_secs(2), async {
			loop {
				if client.clear().await == Err(ChatError::Closed) {
					break;
				}
				tokio::task::yield_now().await;
			}
		})
		.await;
		assert!(result.is_ok());
	}

	#[tokio::test]
	async fn unreachable_broker_ends_errored() {
		let cfg = ChatConfig {
			ws_url: "ws://127.0.0.1:1/app/x".to_string(),
			connect_timeout: Duration::from_secs(2),
			..ChatConfig::default()
		};
		let (client, _events) = ChatClient::new(cfg, Arc::new(SecretString::new("t")));
		let mut state = client.subscribe_state();
		client.connect(ChatroomId(1)).unwrap();
		tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == ConnectionState::Errored))
			.await
			.expect("timed out")
			.expect("state channel closed");
	}
}
