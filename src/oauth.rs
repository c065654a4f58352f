//! Reduced OAuth 2.0 authorization-server role that brokers an upstream provider.
//!
//! MCP clients are sent to the upstream authorization endpoint; the upstream code returned to the
//! callback is exchanged for an upstream token, and the client receives a local authorization code
//! that it trades for an opaque MCP access token. The upstream token doubles as the downstream JWT
//! and stays reachable through [`SimpleOAuthProvider::get_instana_jwt_token`].

pub mod provider;

pub use provider::SimpleOAuthProvider;

// crates.io
use base64::{Engine, prelude::BASE64_URL_SAFE_NO_PAD};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;
// self
use crate::_prelude::*;

/// Lifetime of a local authorization code.
pub const AUTHORIZATION_CODE_TTL: Duration = Duration::from_secs(300);
/// Lifetime of a minted MCP access token.
pub const ACCESS_TOKEN_TTL: Duration = Duration::from_secs(3600);
/// Key prefix marking upstream-provider tokens in the token store.
pub const UPSTREAM_TOKEN_PREFIX: &str = "auth_";
/// Prefix of locally generated codes and tokens.
pub const MCP_TOKEN_PREFIX: &str = "mcp_";

/// A registered MCP client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
	/// Client identifier.
	pub client_id: String,
	/// Client secret, for confidential clients.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub client_secret: Option<String>,
	/// Registered redirect URIs.
	#[serde(default)]
	pub redirect_uris: Vec<Url>,
	/// Space-delimited scopes the client registered for.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub scope: Option<String>,
	/// Display name.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub client_name: Option<String>,
}
impl ClientRecord {
	/// Public client with no redirect URIs yet.
	pub fn new(client_id: impl Into<String>) -> Self {
		Self {
			client_id: client_id.into(),
			client_secret: None,
			redirect_uris: Vec::new(),
			scope: None,
			client_name: None,
		}
	}

	/// Add a redirect URI.
	pub fn with_redirect_uri(mut self, redirect_uri: Url) -> Self {
		self.redirect_uris.push(redirect_uri);

		self
	}
}

/// How a PKCE code challenge was derived from its verifier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeChallengeMethod {
	/// `BASE64URL(SHA256(verifier))`.
	#[default]
	S256,
	/// The challenge is the verifier.
	#[serde(rename = "plain")]
	Plain,
}

/// Parameters of an authorization request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthorizationParams {
	/// Client-supplied state; generated when absent.
	#[serde(default)]
	pub state: Option<String>,
	/// Requested scopes.
	#[serde(default)]
	pub scopes: Vec<String>,
	/// PKCE challenge.
	#[serde(default)]
	pub code_challenge: Option<String>,
	/// PKCE challenge method.
	#[serde(default)]
	pub code_challenge_method: CodeChallengeMethod,
	/// Where the client expects the final redirect.
	pub redirect_uri: Url,
	/// Whether the redirect URI was given explicitly in the request.
	#[serde(default)]
	pub redirect_uri_provided_explicitly: bool,
}
impl AuthorizationParams {
	/// Parameters with only a redirect URI.
	pub fn new(redirect_uri: Url) -> Self {
		Self {
			state: None,
			scopes: Vec::new(),
			code_challenge: None,
			code_challenge_method: CodeChallengeMethod::default(),
			redirect_uri,
			redirect_uri_provided_explicitly: true,
		}
	}

	/// Set the client state.
	pub fn state(mut self, state: impl Into<String>) -> Self {
		self.state = Some(state.into());

		self
	}

	/// Set a PKCE challenge.
	pub fn code_challenge(mut self, challenge: impl Into<String>, method: CodeChallengeMethod) -> Self {
		self.code_challenge = Some(challenge.into());
		self.code_challenge_method = method;

		self
	}
}

/// A local authorization code awaiting exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationCode {
	/// The code value.
	pub code: String,
	/// Client the code was issued to.
	pub client_id: String,
	/// Redirect URI of the originating request.
	pub redirect_uri: Url,
	/// Whether the redirect URI was given explicitly.
	pub redirect_uri_provided_explicitly: bool,
	/// Expiry in seconds since the epoch.
	pub expires_at: i64,
	/// Scopes granted by the code.
	pub scopes: Vec<String>,
	/// PKCE challenge of the originating request.
	pub code_challenge: Option<String>,
	/// PKCE challenge method.
	pub code_challenge_method: CodeChallengeMethod,
}
impl AuthorizationCode {
	/// Whether the code expired before `now` (seconds since the epoch).
	pub fn is_expired(&self, now: i64) -> bool {
		self.expires_at < now
	}

	/// Check a PKCE verifier against the stored challenge; codes without a challenge accept any
	/// verifier.
	pub fn verify_code_verifier(&self, verifier: &str) -> bool {
		let Some(challenge) = &self.code_challenge else {
			return true;
		};

		match self.code_challenge_method {
			CodeChallengeMethod::S256 => s256_challenge(verifier) == *challenge,
			CodeChallengeMethod::Plain => verifier == challenge,
		}
	}
}

/// A stored access token, either minted locally or received upstream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
	/// Token value.
	pub token: String,
	/// Owning client.
	pub client_id: String,
	/// Granted scopes.
	pub scopes: Vec<String>,
	/// Expiry in seconds since the epoch; `None` never expires.
	pub expires_at: Option<i64>,
}
impl AccessToken {
	/// Whether the token expired before `now` (seconds since the epoch).
	pub fn is_expired(&self, now: i64) -> bool {
		self.expires_at.is_some_and(|expires_at| expires_at < now)
	}
}

/// Token response returned to MCP clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthToken {
	/// Opaque MCP access token.
	pub access_token: String,
	/// Always `Bearer`.
	pub token_type: String,
	/// Lifetime in seconds.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub expires_in: Option<u64>,
	/// Space-delimited granted scopes.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub scope: Option<String>,
	/// Never issued.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub refresh_token: Option<String>,
}

/// Dynamic client registration policy advertised by the provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationOptions {
	/// Whether registration is open.
	pub enabled: bool,
	/// Scopes a client may request.
	pub valid_scopes: Vec<String>,
	/// Scopes granted when none are requested.
	pub default_scopes: Vec<String>,
}

/// Derive the S256 challenge for a PKCE verifier.
pub fn s256_challenge(verifier: &str) -> String {
	BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// `bytes` random bytes as lowercase hex.
pub(crate) fn token_hex(bytes: usize) -> String {
	let mut buf = vec![0_u8; bytes];

	rand::rng().fill(buf.as_mut_slice());

	buf.iter().map(|byte| format!("{byte:02x}")).collect()
}
