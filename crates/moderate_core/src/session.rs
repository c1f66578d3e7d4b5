#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use moderate_domain::UserProfile;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};
use url::Url;

use crate::api::KickApi;
use crate::auth::{AuthError, Credential, PkceAuthenticator};
use crate::vault::{CredentialVault, VaultError};
use crate::{SecretString, TokenSource};

pub const TOKEN_KEY: &str = "auth_token";
pub const USER_KEY: &str = "current_user";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
	Unauthenticated,
	Authenticating,
	/// `None` when the profile could not be fetched; the token is still usable.
	Authenticated(Option<UserProfile>),
	Invalid,
}

impl SessionState {
	pub fn is_authenticated(&self) -> bool {
		matches!(self, Self::Authenticated(_))
	}

	pub fn user(&self) -> Option<&UserProfile> {
		match self {
			Self::Authenticated(user) => user.as_ref(),
			_ => None,
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
	#[error("an authentication attempt is already in progress")]
	InProgress,
	#[error(transparent)]
	Auth(#[from] AuthError),
	#[error("user consent failed: {0}")]
	Consent(String),
	#[error(transparent)]
	Vault(#[from] VaultError),
	#[error("login was cancelled by a logout")]
	Cancelled,
}

/// Presents the authorization URL to the user and returns the full callback
/// URL the provider redirected to.
#[async_trait]
pub trait ConsentDriver: Send + Sync {
	async fn authorize(&self, url: Url) -> anyhow::Result<String>;
}

#[derive(Serialize, Deserialize)]
struct StoredCredential {
	access_token: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	refresh_token: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	expires_in: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	user: Option<UserProfile>,
}

impl StoredCredential {
	fn from_credential(cred: &Credential) -> Self {
		Self {
			access_token: cred.access_token.expose().to_string(),
			refresh_token: cred.refresh_token.as_ref().map(|t| t.expose().to_string()),
			expires_in: cred.expires_in,
			user: cred.cached_user.clone(),
		}
	}

	fn into_credential(self) -> Credential {
		Credential {
			access_token: SecretString::new(self.access_token),
			refresh_token: self.refresh_token.map(SecretString::new),
			expires_in: self.expires_in,
			cached_user: self.user,
		}
	}
}

/// Decode a vault entry. Older installs stored the bare token string.
fn decode_stored(raw: &str) -> Result<Credential, VaultError> {
	let trimmed = raw.trim();
	if trimmed.is_empty() {
		return Err(VaultError::Encoding("empty credential".to_string()));
	}
	if !trimmed.starts_with('{') {
		return Ok(Credential::bearer(trimmed));
	}
	let stored: StoredCredential = serde_json::from_str(trimmed).map_err(|e| VaultError::Encoding(e.to_string()))?;
	if stored.access_token.trim().is_empty() {
		return Err(VaultError::Encoding("empty access_token".to_string()));
	}
	Ok(stored.into_credential())
}

fn encode_entries(cred: &Credential) -> Result<Vec<(&'static str, String)>, VaultError> {
	let encoded =
		serde_json::to_string(&StoredCredential::from_credential(cred)).map_err(|e| VaultError::Encoding(e.to_string()))?;
	let mut entries = vec![(TOKEN_KEY, encoded)];
	if let Some(user) = &cred.cached_user {
		match serde_json::to_string(user) {
			Ok(json) => entries.push((USER_KEY, json)),
			Err(e) => debug!(error = %e, "failed to encode profile"),
		}
	}
	Ok(entries)
}

fn save_entries(vault: &dyn CredentialVault, entries: &[(&'static str, String)]) -> Result<(), VaultError> {
	for (key, value) in entries {
		vault.save(key, value)?;
	}
	Ok(())
}

fn delete_entries(vault: &dyn CredentialVault) {
	for key in [TOKEN_KEY, USER_KEY] {
		if let Err(e) = vault.delete(key) {
			warn!(key, error = %e, "failed to delete stored secret");
		}
	}
}

/// Owner of the credential and the authenticated state machine.
pub struct SessionManager {
	vault: Arc<dyn CredentialVault>,
	api: KickApi,
	auth: PkceAuthenticator,
	state_tx: watch::Sender<SessionState>,
	/// Commit point for the in-memory credential and the published state.
	/// Vault I/O never runs while this lock is held.
	credential: RwLock<Option<Credential>>,
	/// Bumped on every login, restore and clear. Async work that outlives a
	/// bump must not commit.
	generation: AtomicU64,
	login_guard: Mutex<()>,
}

impl SessionManager {
	pub fn new(vault: Arc<dyn CredentialVault>, api: KickApi, auth: PkceAuthenticator) -> Self {
		let (state_tx, _) = watch::channel(SessionState::Unauthenticated);
		Self {
			vault,
			api,
			auth,
			state_tx,
			credential: RwLock::new(None),
			generation: AtomicU64::new(0),
			login_guard: Mutex::new(()),
		}
	}

	pub fn api(&self) -> &KickApi {
		&self.api
	}

	pub fn authenticator(&self) -> &PkceAuthenticator {
		&self.auth
	}

	pub fn state(&self) -> SessionState {
		self.state_tx.borrow().clone()
	}

	pub fn subscribe(&self) -> watch::Receiver<SessionState> {
		self.state_tx.subscribe()
	}

	pub fn current_user(&self) -> Option<UserProfile> {
		self.credential.read().as_ref().and_then(|c| c.cached_user.clone())
	}

	/// Snapshot of the bearer token, `None` unless authenticated.
	pub fn token(&self) -> Option<SecretString> {
		if !self.state_tx.borrow().is_authenticated() {
			return None;
		}
		self.credential.read().as_ref().map(|c| c.access_token.clone())
	}

	fn publish(&self, state: SessionState) {
		debug!(?state, "session state");
		self.state_tx.send_replace(state);
	}

	fn bump_generation(&self) -> u64 {
		self.generation.fetch_add(1, Ordering::AcqRel) + 1
	}

	fn is_current(&self, generation: u64) -> bool {
		self.generation.load(Ordering::Acquire) == generation
	}

	/// Run a vault operation on the blocking pool.
	async fn with_vault<T, F>(&self, op: F) -> Result<T, VaultError>
	where
		T: Send + 'static,
		F: FnOnce(&dyn CredentialVault) -> Result<T, VaultError> + Send + 'static,
	{
		let vault = Arc::clone(&self.vault);
		tokio::task::spawn_blocking(move || op(vault.as_ref()))
			.await
			.map_err(|e| VaultError::Backend(format!("vault task failed: {e}")))?
	}

	/// Load the stored credential. A found credential is trusted immediately
	/// and revalidated in the background.
	pub fn restore(self: &Arc<Self>) -> SessionState {
		let raw = match self.vault.load(TOKEN_KEY) {
			Ok(raw) => raw,
			Err(VaultError::NotFound) => {
				debug!("no stored credential");
				self.publish(SessionState::Unauthenticated);
				return SessionState::Unauthenticated;
			}
			Err(e) => {
				warn!(error = %e, "credential vault unavailable");
				self.publish(SessionState::Unauthenticated);
				return SessionState::Unauthenticated;
			}
		};

		let mut cred = match decode_stored(&raw) {
			Ok(cred) => cred,
			Err(e) => {
				warn!(error = %e, "stored credential unreadable, purging");
				self.publish(SessionState::Invalid);
				self.logout();
				return SessionState::Unauthenticated;
			}
		};
		if cred.cached_user.is_none() {
			cred.cached_user = self.load_cached_user();
		}

		let state = SessionState::Authenticated(cred.cached_user.clone());
		{
			let mut slot = self.credential.write();
			self.bump_generation();
			*slot = Some(cred);
			self.publish(state.clone());
		}
		info!("restored stored session, validating");

		let this = Arc::clone(self);
		tokio::spawn(async move {
			this.validate().await;
		});
		state
	}

	fn load_cached_user(&self) -> Option<UserProfile> {
		let raw = self.vault.load(USER_KEY).ok()?;
		match serde_json::from_str(&raw) {
			Ok(user) => Some(user),
			Err(e) => {
				debug!(error = %e, "cached profile unreadable");
				None
			}
		}
	}

	/// Check the current token against `GET /api/v2/user`. Any failure purges
	/// the session.
	pub async fn validate(&self) -> SessionState {
		let generation = self.generation.load(Ordering::Acquire);
		let Some(token) = self.token() else {
			return self.state();
		};

		match self.api.current_user(&token).await {
			Ok(user) => {
				{
					let mut slot = self.credential.write();
					if !self.is_current(generation) {
						return self.state();
					}
					if let Some(cred) = slot.as_mut() {
						cred.cached_user = Some(user.clone());
					}
				}
				self.store_profile(generation, &user).await;
				let _slot = self.credential.write();
				if self.is_current(generation) {
					info!(user = %user.username, "session validated");
					self.publish(SessionState::Authenticated(Some(user)));
				}
			}
			Err(e) if e.is_auth_rejection() => {
				warn!(error = %e, "stored token rejected, logging out");
				self.purge_if_current(generation).await;
			}
			Err(e) => {
				warn!(error = %e, "session validation failed, logging out");
				self.purge_if_current(generation).await;
			}
		}
		self.state()
	}

	async fn store_profile(&self, generation: u64, user: &UserProfile) {
		let json = match serde_json::to_string(user) {
			Ok(json) => json,
			Err(e) => {
				debug!(error = %e, "failed to encode profile");
				return;
			}
		};
		if !self.is_current(generation) {
			return;
		}
		if let Err(e) = self.with_vault(move |vault| vault.save(USER_KEY, &json)).await {
			warn!(error = %e, "failed to persist refreshed profile");
		}
	}

	async fn purge_if_current(&self, generation: u64) {
		let cleared = {
			let mut slot = self.credential.write();
			if !self.is_current(generation) {
				debug!("session changed during validation, not purging");
				return;
			}
			*slot = None;
			self.publish(SessionState::Invalid);
			self.bump_generation()
		};
		self.finish_clear(cleared).await;
	}

	/// Delete the stored copy, then settle on Unauthenticated unless another
	/// transition started meanwhile.
	async fn finish_clear(&self, generation: u64) {
		if let Err(e) = self
			.with_vault(|vault| {
				delete_entries(vault);
				Ok(())
			})
			.await
		{
			warn!(error = %e, "failed to clear stored credential");
		}
		let _slot = self.credential.write();
		if self.is_current(generation) {
			self.publish(SessionState::Unauthenticated);
		}
	}

	/// Run the full PKCE login through `consent`. Failure leaves the session
	/// logged out.
	pub async fn login(&self, consent: &dyn ConsentDriver) -> Result<SessionState, SessionError> {
		let _guard = self.login_guard.try_lock().map_err(|_| SessionError::InProgress)?;
		let generation = self.bump_generation();
		self.publish(SessionState::Authenticating);

		let result = match self.authenticate(consent).await {
			Ok(cred) => self.commit_login(generation, cred).await,
			Err(e) => Err(e),
		};
		match &result {
			Ok(_) => info!("login complete"),
			Err(e) => warn!(error = %e, "login failed"),
		}
		if result.is_err() {
			let cleared = {
				let mut slot = self.credential.write();
				*slot = None;
				self.bump_generation()
			};
			self.finish_clear(cleared).await;
		}
		result
	}

	async fn authenticate(&self, consent: &dyn ConsentDriver) -> Result<Credential, SessionError> {
		let url = self.auth.begin_flow();
		info!("awaiting user consent");
		let callback = match consent.authorize(url).await {
			Ok(callback) => callback,
			Err(e) => {
				self.auth.abort();
				return Err(SessionError::Consent(format!("{e:#}")));
			}
		};
		let code = self.auth.complete_flow(&callback)?;
		let mut cred = self.auth.exchange_code(&code).await?;

		match self.api.current_user(&cred.access_token).await {
			Ok(user) => cred.cached_user = Some(user),
			Err(e) => warn!(error = %e, "profile fetch failed, continuing without profile"),
		}
		Ok(cred)
	}

	/// Store the new credential, then swap it in unless a logout arrived while
	/// the login was in flight.
	async fn commit_login(&self, generation: u64, cred: Credential) -> Result<SessionState, SessionError> {
		let entries = encode_entries(&cred)?;
		self.with_vault(move |vault| save_entries(vault, &entries)).await?;

		let mut slot = self.credential.write();
		if !self.is_current(generation) {
			return Err(SessionError::Cancelled);
		}
		let state = SessionState::Authenticated(cred.cached_user.clone());
		self.bump_generation();
		*slot = Some(cred);
		self.publish(state.clone());
		Ok(state)
	}

	/// Drop the credential and the stored copy. Always ends Unauthenticated.
	pub fn logout(&self) {
		{
			let mut slot = self.credential.write();
			self.bump_generation();
			*slot = None;
			self.publish(SessionState::Unauthenticated);
		}
		delete_entries(self.vault.as_ref());
	}
}

impl TokenSource for SessionManager {
	fn token(&self) -> Option<SecretString> {
		SessionManager::token(self)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn stored_credential_accepts_bare_token_and_json() {
		let cred = decode_stored("  abc  ").unwrap();
		assert_eq!(cred.access_token.expose(), "abc");
		assert!(cred.cached_user.is_none());

		let cred = decode_stored(r#"{"access_token":"t","refresh_token":"r","expires_in":3600}"#).unwrap();
		assert_eq!(cred.access_token.expose(), "t");
		assert_eq!(cred.refresh_token.unwrap().expose(), "r");
		assert_eq!(cred.expires_in, Some(3600));

		assert!(matches!(decode_stored("{broken"), Err(VaultError::Encoding(_))));
		assert!(matches!(decode_stored(r#"{"access_token":""}"#), Err(VaultError::Encoding(_))));
		assert!(matches!(decode_stored(""), Err(VaultError::Encoding(_))));
	}

	#[test]
	fn stored_credential_encodes_exposed_secrets() {
		let mut cred = Credential::bearer("tok");
		cred.refresh_token = Some(SecretString::new("ref"));
		let json = serde_json::to_value(StoredCredential::from_credential(&cred)).unwrap();
		assert_eq!(json, serde_json::json!({"access_token": "tok", "refresh_token": "ref"}));
	}

	#[test]
	fn state_helpers() {
		assert!(!SessionState::Invalid.is_authenticated());
		assert!(SessionState::Authenticated(None).is_authenticated());
		assert!(SessionState::Authenticated(None).user().is_none());
	}
}
