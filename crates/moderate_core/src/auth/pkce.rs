//! PKCE (Proof Key for Code Exchange) material.
//!
//! The verifier never leaves the process until the token exchange; the
//! authorization server only ever sees its SHA-256 challenge.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng as _;
use sha2::{Digest, Sha256};

use crate::SecretString;

/// RFC 7636 unreserved characters.
pub const UNRESERVED_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

pub const MIN_VERIFIER_LEN: usize = 43;
pub const MAX_VERIFIER_LEN: usize = 128;
pub const DEFAULT_VERIFIER_LEN: usize = MAX_VERIFIER_LEN;
pub const STATE_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PkceError {
	#[error("verifier length {0} outside 43..=128")]
	VerifierLength(usize),
	#[error("verifier contains characters outside the unreserved set")]
	VerifierCharset,
	#[error("state must be non-empty")]
	EmptyState,
}

/// `base64url(SHA-256(verifier))` without padding.
pub fn code_challenge(verifier: &str) -> String {
	URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Random string over the unreserved alphabet, drawn from the thread CSPRNG.
pub fn random_unreserved(len: usize) -> String {
	let mut rng = rand::rng();
	(0..len)
		.map(|_| UNRESERVED_CHARSET[rng.random_range(0..UNRESERVED_CHARSET.len())] as char)
		.collect()
}

/// Verifier, challenge and CSRF state for one authorization attempt.
///
/// Deliberately not `Clone`: a context is moved into the authenticator and
/// consumed by the exchange, so it cannot be replayed across attempts.
pub struct PkceContext {
	verifier: SecretString,
	challenge: String,
	state: String,
}

impl PkceContext {
	pub fn generate() -> Self {
		let verifier = random_unreserved(DEFAULT_VERIFIER_LEN);
		let challenge = code_challenge(&verifier);
		Self {
			verifier: SecretString::new(verifier),
			challenge,
			state: random_unreserved(STATE_LEN),
		}
	}

	/// Build a context from caller-supplied material.
	pub fn from_parts(verifier: impl Into<String>, state: impl Into<String>) -> Result<Self, PkceError> {
		let verifier = verifier.into();
		let state = state.into();
		if !(MIN_VERIFIER_LEN..=MAX_VERIFIER_LEN).contains(&verifier.len()) {
			return Err(PkceError::VerifierLength(verifier.len()));
		}
		if !verifier.bytes().all(|b| UNRESERVED_CHARSET.contains(&b)) {
			return Err(PkceError::VerifierCharset);
		}
		if state.trim().is_empty() {
			return Err(PkceError::EmptyState);
		}
		let challenge = code_challenge(&verifier);
		Ok(Self {
			verifier: SecretString::new(verifier),
			challenge,
			state,
		})
	}

	pub fn verifier(&self) -> &str {
		self.verifier.expose()
	}

	pub fn challenge(&self) -> &str {
		&self.challenge
	}

	pub fn state(&self) -> &str {
		&self.state
	}

	pub(crate) fn into_verifier(self) -> SecretString {
		self.verifier
	}
}

impl fmt::Debug for PkceContext {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PkceContext")
			.field("verifier", &self.verifier)
			.field("challenge", &self.challenge)
			.field("state", &self.state)
			.finish()
	}
}
