use std::time::Duration;

use moderate_core::auth::{AuthConfig, AuthError, AuthFlowState, PkceAuthenticator, PkceContext};
use moderate_core::NetworkError;
use url::Url;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

fn authenticator(server: &MockServer) -> PkceAuthenticator {
	let mut cfg = AuthConfig::new("client-1", "http://localhost/callback");
	cfg.token_url = Url::parse(&format!("{}/oauth/token", server.uri())).unwrap();
	cfg.token_timeout = Duration::from_millis(500);
	PkceAuthenticator::new(cfg).unwrap()
}

fn callback(state: &str) -> String {
	format!("http://localhost/callback?code=xyz&state={state}")
}

#[tokio::test]
async fn exchanges_code_with_verifier() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/oauth/token"))
		.and(header("accept", "application/json"))
		.and(body_string_contains("grant_type=authorization_code"))
		.and(body_string_contains("client_id=client-1"))
		.and(body_string_contains("code=xyz"))
		.and(body_string_contains(format!("code_verifier={VERIFIER}")))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
			"access_token": "access-1",
			"token_type": "Bearer",
			"expires_in": 3600,
			"refresh_token": "refresh-1",
			"scope": "chat:read user:read"
		})))
		.expect(1)
		.mount(&server)
		.await;

	let auth = authenticator(&server);
	auth.begin_flow_with(PkceContext::from_parts(VERIFIER, "S1").unwrap());
	let code = auth.complete_flow(&callback("S1")).unwrap();
	let cred = auth.exchange_code(&code).await.unwrap();

	assert_eq!(cred.access_token.expose(), "access-1");
	assert_eq!(cred.refresh_token.as_ref().map(|t| t.expose()), Some("refresh-1"));
	assert_eq!(cred.expires_in, Some(3600));
	assert_eq!(auth.state(), AuthFlowState::TokenExchanged);

	// The verifier was consumed; the same code cannot be redeemed twice.
	assert_eq!(auth.exchange_code(&code).await.unwrap_err(), AuthError::NoFlow);
}

#[tokio::test]
async fn state_mismatch_never_reaches_the_token_endpoint() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/oauth/token"))
		.respond_with(ResponseTemplate::new(200))
		.expect(0)
		.mount(&server)
		.await;

	let auth = authenticator(&server);
	auth.begin_flow_with(PkceContext::from_parts(VERIFIER, "S1").unwrap());
	assert_eq!(auth.complete_flow(&callback("S2")).unwrap_err(), AuthError::StateMismatch);
}

#[tokio::test]
async fn non_success_status_is_http_error() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/oauth/token"))
		.respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({"error": "invalid_grant"})))
		.mount(&server)
		.await;

	let auth = authenticator(&server);
	// A newer attempt replaces the first one entirely.
	auth.begin_flow();
	auth.begin_flow_with(PkceContext::from_parts(VERIFIER, "S1").unwrap());
	let code = auth.complete_flow(&callback("S1")).unwrap();
	let err = auth.exchange_code(&code).await.unwrap_err();
	assert_eq!(err, AuthError::Http(400));
	assert_eq!(auth.state(), AuthFlowState::Failed(AuthError::Http(400)));
	assert!(!err.is_network());
}

#[tokio::test]
async fn undecodable_body_is_malformed() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/oauth/token"))
		.respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
		.mount(&server)
		.await;

	let auth = authenticator(&server);
	auth.begin_flow_with(PkceContext::from_parts(VERIFIER, "S1").unwrap());
	let code = auth.complete_flow(&callback("S1")).unwrap();
	assert!(matches!(auth.exchange_code(&code).await, Err(AuthError::Malformed(_))));
}

#[tokio::test]
async fn slow_token_endpoint_times_out() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/oauth/token"))
		.respond_with(
			ResponseTemplate::new(200)
				.set_body_json(serde_json::json!({"access_token": "late"}))
				.set_delay(Duration::from_secs(3)),
		)
		.mount(&server)
		.await;

	let auth = authenticator(&server);
	auth.begin_flow_with(PkceContext::from_parts(VERIFIER, "S1").unwrap());
	let code = auth.complete_flow(&callback("S1")).unwrap();
	let err = auth.exchange_code(&code).await.unwrap_err();
	assert_eq!(err, AuthError::Network(NetworkError::Timeout));
	assert!(err.is_network());
	assert!(!err.is_configuration_error());
}
