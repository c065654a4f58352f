//! Settings for the JWT verifier, OAuth provider, dynamic token clients, and credential
//! arbitration.
//!
//! Every loader has a `from_lookup` form that takes a key lookup closure, so callers and tests
//! can feed values without touching the process environment. `from_env` delegates to
//! [`std::env::var`].

// crates.io
use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};
use url::Url;
// self
use crate::_prelude::*;

/// Prefix applied to JWT verifier variables.
pub const JWT_ENV_PREFIX: &str = "FASTMCP_AUTH_JWT_";
/// Default prefix applied to OAuth provider variables.
pub const DEFAULT_OAUTH_PREFIX: &str = "OAUTH_";
/// Algorithm used when none is configured.
pub const DEFAULT_ALGORITHM: Algorithm = Algorithm::RS256;
/// Issuer URL used when OAuth is disabled and no server URL is configured.
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8080";
/// Variable naming the default downstream base URL.
pub const BASE_URL_ENV: &str = "INSTANA_BASE_URL";
/// Variable naming the static downstream token for stdio mode.
pub const API_TOKEN_ENV: &str = "INSTANA_API_TOKEN";
/// Variable enabling the OAuth provider for the default prefix.
pub const OAUTH_ENABLED_ENV: &str = "ENABLE_OAUTH";

const OAUTH_REQUIRED_SUFFIXES: [&str; 10] = [
	"HOST",
	"PORT",
	"SERVER_URL",
	"CLIENT_ID",
	"CLIENT_SECRET",
	"CALLBACK_PATH",
	"AUTH_URL",
	"TOKEN_URL",
	"MCP_SCOPE",
	"PROVIDER_SCOPE",
];

/// JWT verifier configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JwtSettings {
	/// Whether JWT validation is enabled at all.
	#[serde(default)]
	pub enabled: bool,
	/// PEM public key, or the shared secret for HMAC algorithms.
	#[serde(default)]
	pub public_key: Option<String>,
	/// JWKS endpoint used instead of a static key.
	#[serde(default)]
	pub jwks_uri: Option<Url>,
	/// Expected `aud` claim; the audience check is skipped when absent.
	#[serde(default)]
	pub audience: Option<String>,
	/// Signature algorithm accepted by the verifier.
	#[serde(default = "default_algorithm")]
	pub algorithm: Algorithm,
	/// Scopes that must all appear in the token's `scope` claim.
	#[serde(default)]
	pub required_scopes: Vec<String>,
}
impl JwtSettings {
	/// Settings with a static key (PEM or shared secret) and everything else defaulted.
	pub fn with_public_key(public_key: impl Into<String>) -> Self {
		Self { public_key: Some(public_key.into()), ..Self::default() }
	}

	/// Settings with a JWKS endpoint and everything else defaulted.
	pub fn with_jwks_uri(jwks_uri: Url) -> Self {
		Self { jwks_uri: Some(jwks_uri), ..Self::default() }
	}

	/// Set the expected audience.
	pub fn audience(mut self, audience: impl Into<String>) -> Self {
		self.audience = Some(audience.into());

		self
	}

	/// Set the accepted algorithm.
	pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
		self.algorithm = algorithm;

		self
	}

	/// Replace the required scope list.
	pub fn required_scopes<I, S>(mut self, scopes: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.required_scopes = scopes.into_iter().map(Into::into).collect();

		self
	}

	/// Load settings from the process environment.
	pub fn from_env() -> Result<Self> {
		Self::from_lookup(env_lookup)
	}

	/// Load settings through the supplied lookup.
	pub fn from_lookup<F>(lookup: F) -> Result<Self>
	where
		F: Fn(&str) -> Option<String>,
	{
		let var = |suffix: &str| non_empty(lookup(&format!("{JWT_ENV_PREFIX}{suffix}")));
		let jwks_uri = var("JWKS_URI").map(|raw| Url::parse(&raw)).transpose().map_err(|err| {
			Error::Config { field: "jwks_uri", reason: format!("Invalid JWKS URI: {err}.") }
		})?;
		let algorithm = match var("ALGORITHM") {
			Some(raw) => parse_algorithm(&raw)?,
			None => DEFAULT_ALGORITHM,
		};

		Ok(Self {
			enabled: is_true(var("ENABLED")),
			public_key: var("PUBLIC_KEY"),
			jwks_uri,
			audience: var("AUDIENCE"),
			algorithm,
			required_scopes: var("REQUIRED_SCOPES").map(|raw| split_scopes(&raw)).unwrap_or_default(),
		})
	}

	/// Validate that at least one key source is configured.
	pub fn validate(&self) -> Result<()> {
		if self.public_key.is_none() && self.jwks_uri.is_none() {
			return Err(Error::Config {
				field: "public_key",
				reason: "Either a public key or a JWKS URI must be provided.".into(),
			});
		}

		Ok(())
	}
}
impl Default for JwtSettings {
	fn default() -> Self {
		Self {
			enabled: false,
			public_key: None,
			jwks_uri: None,
			audience: None,
			algorithm: DEFAULT_ALGORITHM,
			required_scopes: Vec::new(),
		}
	}
}

/// OAuth provider configuration loaded from prefix-scoped variables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OAuthSettings {
	/// Whether the OAuth provider is enabled.
	#[serde(default)]
	pub enabled: bool,
	/// Host the MCP server listens on.
	#[serde(default)]
	pub host: String,
	/// Port the MCP server listens on.
	#[serde(default)]
	pub port: String,
	/// Public URL of the MCP server, used as issuer.
	pub server_url: Url,
	/// Client id registered with the upstream OAuth provider.
	#[serde(default)]
	pub client_id: String,
	/// Client secret registered with the upstream OAuth provider.
	#[serde(default)]
	pub client_secret: String,
	/// Redirect target registered upstream; sent as `redirect_uri`.
	#[serde(default)]
	pub callback_path: String,
	/// Upstream authorization endpoint.
	#[serde(default)]
	pub auth_url: String,
	/// Upstream token endpoint.
	#[serde(default)]
	pub token_url: String,
	/// Scope granted to MCP clients.
	#[serde(default)]
	pub mcp_scope: String,
	/// Scope requested from the upstream provider.
	#[serde(default)]
	pub provider_scope: String,
}
impl OAuthSettings {
	/// Load settings from the process environment with the default `OAUTH_` prefix.
	pub fn from_env() -> Result<Self> {
		Self::from_lookup(DEFAULT_OAUTH_PREFIX, env_lookup)
	}

	/// Load settings through the supplied lookup.
	///
	/// The enable flag is `ENABLE_OAUTH` for the default prefix and `<PREFIX>_ENABLED`
	/// otherwise. When enabled, every prefixed variable is required.
	pub fn from_lookup<F>(prefix: &str, lookup: F) -> Result<Self>
	where
		F: Fn(&str) -> Option<String>,
	{
		let var = |suffix: &str| non_empty(lookup(&format!("{prefix}{suffix}")));
		let enabled = is_true(non_empty(lookup(&enable_variable(prefix))));

		if enabled {
			let missing: Vec<String> = OAUTH_REQUIRED_SUFFIXES
				.iter()
				.filter(|&&suffix| var(suffix).is_none())
				.map(|suffix| format!("{prefix}{suffix}"))
				.collect();

			if !missing.is_empty() {
				return Err(Error::MissingSettings { prefix: prefix.to_owned(), missing });
			}
		}

		let server_url = match var("SERVER_URL") {
			Some(raw) => Url::parse(&raw).map_err(|err| Error::Config {
				field: "server_url",
				reason: format!("Invalid server URL: {err}."),
			})?,
			None => Url::parse(DEFAULT_SERVER_URL)?,
		};
		let settings = Self {
			enabled,
			host: var("HOST").unwrap_or_default(),
			port: var("PORT").unwrap_or_default(),
			server_url,
			client_id: var("CLIENT_ID").unwrap_or_default(),
			client_secret: var("CLIENT_SECRET").unwrap_or_default(),
			callback_path: var("CALLBACK_PATH").unwrap_or_default(),
			auth_url: var("AUTH_URL").unwrap_or_default(),
			token_url: var("TOKEN_URL").unwrap_or_default(),
			mcp_scope: var("MCP_SCOPE").unwrap_or_default(),
			provider_scope: var("PROVIDER_SCOPE").unwrap_or_default(),
		};

		if enabled {
			settings.validate()?;
		}

		Ok(settings)
	}

	/// Validate that the upstream endpoints are well-formed URLs.
	pub fn validate(&self) -> Result<()> {
		Url::parse(&self.auth_url).map_err(|err| Error::Config {
			field: "auth_url",
			reason: format!("Invalid authorization URL: {err}."),
		})?;
		Url::parse(&self.token_url).map_err(|err| Error::Config {
			field: "token_url",
			reason: format!("Invalid token URL: {err}."),
		})?;

		Ok(())
	}
}

/// Credentials and endpoint used by [`DynamicTokenClient`](crate::dynamic::client::DynamicTokenClient).
///
/// `id`, `secret`, and `apikey` may reference environment variables as `$NAME` or `${NAME}`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthData {
	/// Client id for Basic authentication.
	#[serde(default)]
	pub id: Option<String>,
	/// Client secret for Basic authentication.
	#[serde(default)]
	pub secret: Option<String>,
	/// API key for the JWT exchange and IAM grant.
	#[serde(default)]
	pub apikey: Option<String>,
	/// Token endpoint, absolute or relative to the client base URL.
	#[serde(default)]
	pub token_url: Option<String>,
	/// Token generation method: `jwt`, `basic`, or anything else for the IAM grant.
	#[serde(default)]
	pub token_gen_auth_method: Option<String>,
	/// HTTP method for Basic token requests: `post`, otherwise GET.
	#[serde(default)]
	pub token_gen_method: Option<String>,
}

/// Session-cookie login configuration used by
/// [`DynamicTokenManager`](crate::dynamic::session::DynamicTokenManager).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionSettings {
	/// Strategy name; `jsessionid` selects session-cookie login.
	#[serde(default)]
	pub auth_strategy: Option<String>,
	/// Login endpoint, absolute or relative to the manager base URL.
	#[serde(default)]
	pub login_url: Option<String>,
	/// Login username.
	#[serde(default)]
	pub username: Option<String>,
	/// Login password.
	#[serde(default)]
	pub password: Option<String>,
}

/// Settings consumed by credential arbitration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModeSettings {
	/// Whether MCP bearer tokens may be resolved through the OAuth provider.
	#[serde(default)]
	pub oauth_enabled: bool,
	/// Base URL used when an HTTP request carries none.
	#[serde(default)]
	pub default_base_url: Option<String>,
	/// Static downstream token for stdio mode.
	#[serde(default)]
	pub api_token: Option<String>,
}
impl ModeSettings {
	/// Load settings from the process environment.
	pub fn from_env() -> Self {
		Self::from_lookup(env_lookup)
	}

	/// Load settings through the supplied lookup.
	pub fn from_lookup<F>(lookup: F) -> Self
	where
		F: Fn(&str) -> Option<String>,
	{
		Self {
			oauth_enabled: is_true(non_empty(lookup(OAUTH_ENABLED_ENV))),
			default_base_url: non_empty(lookup(BASE_URL_ENV)),
			api_token: non_empty(lookup(API_TOKEN_ENV)),
		}
	}
}

/// Parse an algorithm name such as `RS256` or `HS256`.
pub fn parse_algorithm(raw: &str) -> Result<Algorithm> {
	raw.trim().parse::<Algorithm>().map_err(|err| Error::Config {
		field: "algorithm",
		reason: format!("Unsupported algorithm '{raw}': {err}."),
	})
}

/// Split a comma-separated scope list, trimming entries and dropping empties.
pub fn split_scopes(raw: &str) -> Vec<String> {
	raw.split(',').map(str::trim).filter(|scope| !scope.is_empty()).map(str::to_owned).collect()
}

pub(crate) fn env_lookup(key: &str) -> Option<String> {
	std::env::var(key).ok()
}

fn enable_variable(prefix: &str) -> String {
	if prefix == DEFAULT_OAUTH_PREFIX {
		OAUTH_ENABLED_ENV.to_owned()
	} else {
		format!("{}_ENABLED", prefix.trim_end_matches('_'))
	}
}

fn non_empty(value: Option<String>) -> Option<String> {
	value.filter(|v| !v.is_empty())
}

fn is_true(value: Option<String>) -> bool {
	value.map(|v| v.eq_ignore_ascii_case("true")).unwrap_or(false)
}

fn default_algorithm() -> Algorithm {
	DEFAULT_ALGORITHM
}
