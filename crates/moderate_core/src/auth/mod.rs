#![forbid(unsafe_code)]

//! OAuth2 authorization-code flow with PKCE against `id.kick.com`.

pub mod pkce;

use std::time::Duration;

use moderate_domain::UserProfile;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::SecretString;
use crate::api::NetworkError;

pub use pkce::{PkceContext, PkceError, code_challenge};

pub const DEFAULT_AUTHORIZE_URL: &str = "https://id.kick.com/oauth/authorize";
pub const DEFAULT_TOKEN_URL: &str = "https://id.kick.com/oauth/token";
pub const DEFAULT_SCOPES: &[&str] = &["chat:read", "chat:moderate", "user:read", "channel:write", "channel:read"];
pub const DEFAULT_TOKEN_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct AuthConfig {
	pub client_id: String,
	pub redirect_uri: String,
	pub authorize_url: Url,
	pub token_url: Url,
	pub scopes: Vec<String>,
	pub token_timeout: Duration,
	pub user_agent: String,
}

impl AuthConfig {
	pub fn new(client_id: impl Into<String>, redirect_uri: impl Into<String>) -> Self {
		Self {
			client_id: client_id.into(),
			redirect_uri: redirect_uri.into(),
			authorize_url: Url::parse(DEFAULT_AUTHORIZE_URL).expect("valid default authorize url"),
			token_url: Url::parse(DEFAULT_TOKEN_URL).expect("valid default token url"),
			scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
			token_timeout: DEFAULT_TOKEN_TIMEOUT,
			user_agent: format!("moderate/{}", env!("CARGO_PKG_VERSION")),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
	#[error("authorization server returned {error}{}", describe(.description))]
	ProviderError { error: String, description: Option<String> },
	#[error("state parameter mismatch")]
	StateMismatch,
	#[error("callback carried no authorization code")]
	MissingCode,
	#[error("token endpoint returned status={0}")]
	Http(u16),
	#[error("malformed token response: {0}")]
	Malformed(String),
	#[error("no authorization flow in progress")]
	NoFlow,
	#[error("invalid callback url: {0}")]
	InvalidCallback(String),
	#[error(transparent)]
	Network(#[from] NetworkError),
}

impl AuthError {
	/// Failures a retry will not fix: the provider refused the request
	/// (e.g. `invalid_redirect_uri`) or the callback did not belong to us.
	pub fn is_configuration_error(&self) -> bool {
		matches!(self, Self::ProviderError { .. } | Self::StateMismatch)
	}

	pub fn is_network(&self) -> bool {
		matches!(self, Self::Network(_))
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFlowState {
	Idle,
	PkceGenerated,
	CodeReceived,
	TokenExchanged,
	Failed(AuthError),
}

/// Single-use authorization code taken from the redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationCode(SecretString);

impl AuthorizationCode {
	pub fn new(code: impl Into<String>) -> Self {
		Self(SecretString::new(code))
	}

	pub fn expose(&self) -> &str {
		self.0.expose()
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
	pub access_token: SecretString,
	pub refresh_token: Option<SecretString>,
	pub expires_in: Option<u64>,
	pub cached_user: Option<UserProfile>,
}

impl Credential {
	pub fn bearer(access_token: impl Into<String>) -> Self {
		Self {
			access_token: SecretString::new(access_token),
			refresh_token: None,
			expires_in: None,
			cached_user: None,
		}
	}
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
	access_token: String,
	#[serde(default)]
	token_type: Option<String>,
	#[serde(default)]
	expires_in: Option<u64>,
	#[serde(default)]
	refresh_token: Option<String>,
	#[serde(default)]
	scope: Option<String>,
}

struct Flow {
	state: AuthFlowState,
	context: Option<PkceContext>,
	/// Bumped by every `begin_flow`; a finishing exchange only records its
	/// outcome when no newer attempt has started meanwhile.
	attempt: u64,
}

pub struct PkceAuthenticator {
	cfg: AuthConfig,
	client: reqwest::Client,
	flow: Mutex<Flow>,
}

impl PkceAuthenticator {
	pub fn new(cfg: AuthConfig) -> Result<Self, NetworkError> {
		let client = reqwest::Client::builder()
			.timeout(cfg.token_timeout)
			.user_agent(cfg.user_agent.clone())
			.build()
			.map_err(NetworkError::from_reqwest)?;
		Ok(Self {
			cfg,
			client,
			flow: Mutex::new(Flow {
				state: AuthFlowState::Idle,
				context: None,
				attempt: 0,
			}),
		})
	}

	pub fn config(&self) -> &AuthConfig {
		&self.cfg
	}

	pub fn state(&self) -> AuthFlowState {
		self.flow.lock().state.clone()
	}

	/// Start a new attempt with a fresh PKCE context and return the
	/// authorization URL to present to the user.
	pub fn begin_flow(&self) -> Url {
		self.begin_flow_with(PkceContext::generate())
	}

	/// Start a new attempt with caller-supplied PKCE material. Any previous
	/// attempt is abandoned.
	pub fn begin_flow_with(&self, ctx: PkceContext) -> Url {
		let mut url = self.cfg.authorize_url.clone();
		url.query_pairs_mut()
			.append_pair("response_type", "code")
			.append_pair("client_id", &self.cfg.client_id)
			.append_pair("redirect_uri", &self.cfg.redirect_uri)
			.append_pair("scope", &self.cfg.scopes.join(" "))
			.append_pair("code_challenge", ctx.challenge())
			.append_pair("code_challenge_method", "S256")
			.append_pair("state", ctx.state());

		let mut flow = self.flow.lock();
		flow.attempt = flow.attempt.wrapping_add(1);
		flow.context = Some(ctx);
		flow.state = AuthFlowState::PkceGenerated;
		debug!(attempt = flow.attempt, "pkce flow started");
		url
	}

	/// Drop the current attempt without recording a failure (e.g. the user
	/// closed the consent page).
	pub fn abort(&self) {
		let mut flow = self.flow.lock();
		flow.context = None;
		flow.state = AuthFlowState::Idle;
	}

	/// Validate the redirect the provider sent back and extract the code.
	pub fn complete_flow(&self, callback: &str) -> Result<AuthorizationCode, AuthError> {
		let mut flow = self.flow.lock();
		let expected_state = match (&flow.state, flow.context.as_ref()) {
			(AuthFlowState::PkceGenerated, Some(ctx)) => ctx.state().to_string(),
			_ => return Err(AuthError::NoFlow),
		};

		let result = parse_callback(callback, &expected_state);
		match &result {
			Ok(_) => flow.state = AuthFlowState::CodeReceived,
			Err(err) => {
				warn!(error = %err, "authorization callback rejected");
				flow.context = None;
				flow.state = AuthFlowState::Failed(err.clone());
			}
		}
		result
	}

	/// Trade the authorization code for a credential. Consumes the verifier;
	/// a second call for the same attempt fails with `NoFlow`.
	pub async fn exchange_code(&self, code: &AuthorizationCode) -> Result<Credential, AuthError> {
		let (verifier, attempt) = {
			let mut flow = self.flow.lock();
			if flow.state != AuthFlowState::CodeReceived {
				return Err(AuthError::NoFlow);
			}
			let Some(ctx) = flow.context.take() else {
				return Err(AuthError::NoFlow);
			};
			(ctx.into_verifier(), flow.attempt)
		};

		let result = self.request_token(code, &verifier).await;

		let mut flow = self.flow.lock();
		if flow.attempt == attempt {
			flow.state = match &result {
				Ok(_) => AuthFlowState::TokenExchanged,
				Err(err) => AuthFlowState::Failed(err.clone()),
			};
		}
		result
	}

	async fn request_token(&self, code: &AuthorizationCode, verifier: &SecretString) -> Result<Credential, AuthError> {
		let form = [
			("grant_type", "authorization_code"),
			("client_id", self.cfg.client_id.as_str()),
			("code", code.expose()),
			("redirect_uri", self.cfg.redirect_uri.as_str()),
			("code_verifier", verifier.expose()),
		];

		let resp = self
			.client
			.post(self.cfg.token_url.clone())
			.header("Accept", "application/json")
			.form(&form)
			.send()
			.await
			.map_err(NetworkError::from_reqwest)?;

		let status = resp.status();
		if !status.is_success() {
			let body = resp.text().await.unwrap_or_default();
			warn!(%status, body = %truncate(&body, 256), "token exchange failed");
			return Err(AuthError::Http(status.as_u16()));
		}

		let body = resp.bytes().await.map_err(NetworkError::from_reqwest)?;
		let token: TokenResponse = serde_json::from_slice(&body).map_err(|e| AuthError::Malformed(e.to_string()))?;
		if token.access_token.trim().is_empty() {
			return Err(AuthError::Malformed("empty access_token".to_string()));
		}
		if let Some(kind) = token.token_type.as_deref() {
			if !kind.eq_ignore_ascii_case("bearer") {
				debug!(token_type = kind, "unexpected token type");
			}
		}

		info!(
			expires_in = ?token.expires_in,
			scope = token.scope.as_deref().unwrap_or(""),
			"token exchange succeeded"
		);
		Ok(Credential {
			access_token: SecretString::new(token.access_token),
			refresh_token: token.refresh_token.filter(|t| !t.is_empty()).map(SecretString::new),
			expires_in: token.expires_in,
			cached_user: None,
		})
	}
}

fn parse_callback(callback: &str, expected_state: &str) -> Result<AuthorizationCode, AuthError> {
	let url = Url::parse(callback.trim()).map_err(|e| AuthError::InvalidCallback(e.to_string()))?;

	let mut code = None;
	let mut state = None;
	let mut error = None;
	let mut description = None;
	for (key, value) in url.query_pairs() {
		match key.as_ref() {
			"code" => code = Some(value.into_owned()),
			"state" => state = Some(value.into_owned()),
			"error" => error = Some(value.into_owned()),
			"error_description" => description = Some(value.into_owned()),
			_ => {}
		}
	}

	if let Some(error) = error {
		return Err(AuthError::ProviderError { error, description });
	}
	if state.as_deref() != Some(expected_state) {
		return Err(AuthError::StateMismatch);
	}
	match code {
		Some(code) if !code.is_empty() => Ok(AuthorizationCode::new(code)),
		_ => Err(AuthError::MissingCode),
	}
}

fn describe(description: &Option<String>) -> String {
	description.as_deref().map(|d| format!(": {d}")).unwrap_or_default()
}

fn truncate(s: &str, max: usize) -> &str {
	match s.char_indices().nth(max) {
		Some((idx, _)) => &s[..idx],
		None => s,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

	fn authenticator() -> PkceAuthenticator {
		PkceAuthenticator::new(AuthConfig::new("client-1", "moderate://oauth/callback")).unwrap()
	}

	fn started(auth: &PkceAuthenticator, state: &str) -> Url {
		auth.begin_flow_with(PkceContext::from_parts(VERIFIER, state).unwrap())
	}

	#[test]
	fn authorization_url_carries_pkce_parameters() {
		let auth = authenticator();
		let url = started(&auth, "S1");
		assert_eq!(url.host_str(), Some("id.kick.com"));
		assert_eq!(url.path(), "/oauth/authorize");

		let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
		let get = |k: &str| pairs.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());
		assert_eq!(get("response_type"), Some("code"));
		assert_eq!(get("client_id"), Some("client-1"));
		assert_eq!(get("redirect_uri"), Some("moderate://oauth/callback"));
		assert_eq!(get("scope"), Some("chat:read chat:moderate user:read channel:write channel:read"));
		assert_eq!(get("code_challenge"), Some("E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"));
		assert_eq!(get("code_challenge_method"), Some("S256"));
		assert_eq!(get("state"), Some("S1"));
		assert_eq!(auth.state(), AuthFlowState::PkceGenerated);
	}

	#[test]
	fn matching_state_yields_code() {
		let auth = authenticator();
		started(&auth, "S1");
		let code = auth.complete_flow("moderate://oauth/callback?code=xyz&state=S1").unwrap();
		assert_eq!(code.expose(), "xyz");
		assert_eq!(auth.state(), AuthFlowState::CodeReceived);
	}

	#[test]
	fn mismatched_state_is_rejected_and_context_discarded() {
		let auth = authenticator();
		started(&auth, "S1");
		let err = auth.complete_flow("moderate://oauth/callback?code=xyz&state=S2").unwrap_err();
		assert_eq!(err, AuthError::StateMismatch);
		assert!(err.is_configuration_error());
		assert_eq!(auth.state(), AuthFlowState::Failed(AuthError::StateMismatch));

		// The correct state no longer helps: the attempt is gone.
		let err = auth.complete_flow("moderate://oauth/callback?code=xyz&state=S1").unwrap_err();
		assert_eq!(err, AuthError::NoFlow);
	}

	#[test]
	fn missing_state_is_a_mismatch() {
		let auth = authenticator();
		started(&auth, "S1");
		assert_eq!(
			auth.complete_flow("moderate://oauth/callback?code=xyz").unwrap_err(),
			AuthError::StateMismatch
		);
	}

	#[test]
	fn provider_error_wins_over_other_parameters() {
		let auth = authenticator();
		started(&auth, "S1");
		let err = auth
			.complete_flow("moderate://oauth/callback?error=invalid_redirect_uri&error_description=bad+uri&state=S1")
			.unwrap_err();
		assert_eq!(
			err,
			AuthError::ProviderError {
				error: "invalid_redirect_uri".to_string(),
				description: Some("bad uri".to_string()),
			}
		);
		assert!(err.to_string().contains("invalid_redirect_uri: bad uri"));
	}

	#[test]
	fn missing_code_and_garbage_callbacks() {
		let auth = authenticator();
		started(&auth, "S1");
		assert_eq!(
			auth.complete_flow("moderate://oauth/callback?state=S1").unwrap_err(),
			AuthError::MissingCode
		);

		started(&auth, "S1");
		assert!(matches!(auth.complete_flow("not a url"), Err(AuthError::InvalidCallback(_))));
	}

	#[test]
	fn complete_without_begin_is_no_flow() {
		let auth = authenticator();
		assert_eq!(
			auth.complete_flow("moderate://oauth/callback?code=xyz&state=S1").unwrap_err(),
			AuthError::NoFlow
		);
	}

	#[test]
	fn abort_resets_to_idle() {
		let auth = authenticator();
		started(&auth, "S1");
		auth.abort();
		assert_eq!(auth.state(), AuthFlowState::Idle);
	}

	#[tokio::test]
	async fn exchange_requires_received_code() {
		let auth = authenticator();
		started(&auth, "S1");
		let err = auth.exchange_code(&AuthorizationCode::new("xyz")).await.unwrap_err();
		assert_eq!(err, AuthError::NoFlow);
	}

	#[test]
	fn truncate_respects_char_boundaries() {
		assert_eq!(truncate("héllo", 2), "hé");
		assert_eq!(truncate("abc", 10), "abc");
	}
}
