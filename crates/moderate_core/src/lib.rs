#![forbid(unsafe_code)]

pub mod api;
pub mod auth;
pub mod chat;
pub mod moderation;
pub mod session;
pub mod vault;

use std::fmt;

pub use api::{ApiConfig, KickApi, NetworkError};
pub use auth::{AuthConfig, AuthError, AuthFlowState, AuthorizationCode, Credential, PkceAuthenticator, PkceContext};
pub use chat::{ChatClient, ChatConfig, ChatError, ChatEvent, ChatEventRx, ConnectionState, MessageWindow};
pub use moderation::{HistoryView, ModerationCommand, ModerationConfig, ModerationDispatcher, ModerationError};
pub use session::{ConsentDriver, SessionError, SessionManager, SessionState};
pub use vault::{CredentialVault, FileVault, KeyringVault, MemoryVault, VaultError};

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_blank(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<<S as serde::Serializer>::Ok, <S as serde::Serializer>::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Read access to the current bearer token.
///
/// Implementations hand out an owned copy so a concurrent re-login can never
/// change the token underneath an in-flight request.
pub trait TokenSource: Send + Sync + 'static {
	fn token(&self) -> Option<SecretString>;
}

impl TokenSource for SecretString {
	fn token(&self) -> Option<SecretString> {
		if self.is_blank() { None } else { Some(self.clone()) }
	}
}

impl TokenSource for Option<SecretString> {
	fn token(&self) -> Option<SecretString> {
		self.as_ref().and_then(TokenSource::token)
	}
}
