//! Per-request credential arbitration between HTTP headers and static stdio credentials.
//!
//! Any of `instana-jwt-token`, `instana-base-url`, or `authorization` on the inbound request puts
//! the request in HTTP mode, which never falls back to the static credentials. Without those
//! headers the request is in stdio mode and only the static credentials apply.

// crates.io
use http::{HeaderMap, header::AUTHORIZATION};
use serde::{Deserialize, Serialize};
// self
use crate::{
	_prelude::*,
	config::ModeSettings,
	oauth::SimpleOAuthProvider,
	verifier::{InstanaCredentials, TokenVerifier, VerifiedAccess, extract_jwt_token},
};

/// Header carrying a pre-resolved downstream JWT.
pub const JWT_TOKEN_HEADER: &str = "instana-jwt-token";
/// Header carrying the downstream base URL.
pub const BASE_URL_HEADER: &str = "instana-base-url";

/// Where the credentials for a request come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialMode {
	/// Inbound HTTP headers.
	Http,
	/// Static credentials configured at startup.
	Stdio,
}

/// Why credentials could not be resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnresolvedReason {
	/// No downstream token.
	MissingToken,
	/// No downstream base URL.
	MissingBaseUrl,
	/// The base URL is not an HTTP(S) URL.
	InvalidBaseUrl,
}
impl UnresolvedReason {
	/// Human-readable description in the context of `mode`.
	pub fn describe(self, mode: CredentialMode) -> &'static str {
		match (self, mode) {
			(Self::MissingToken, CredentialMode::Http) => "instana-jwt-token (or valid OAuth token)",
			(Self::MissingBaseUrl, CredentialMode::Http) =>
				"instana-base-url (header or INSTANA_BASE_URL env var)",
			(Self::MissingToken, CredentialMode::Stdio) => "INSTANA_API_TOKEN is missing",
			(Self::MissingBaseUrl, CredentialMode::Stdio) => "INSTANA_BASE_URL is missing",
			(Self::InvalidBaseUrl, _) => "Instana base URL must start with http:// or https://",
		}
	}
}

/// Outcome of credential arbitration for one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CredentialResolution {
	/// Downstream credentials are available.
	Resolved {
		/// Downstream token.
		token: String,
		/// Downstream base URL.
		base_url: String,
		/// Source of the credentials.
		mode: CredentialMode,
	},
	/// Credentials are missing or invalid.
	Unresolved {
		/// Every problem found.
		reasons: Vec<UnresolvedReason>,
		/// Mode the request was handled in.
		mode: CredentialMode,
	},
}
impl CredentialResolution {
	/// Mode the request was handled in.
	pub fn mode(&self) -> CredentialMode {
		match self {
			Self::Resolved { mode, .. } | Self::Unresolved { mode, .. } => *mode,
		}
	}

	/// Resolved credentials, if any.
	pub fn credentials(&self) -> Option<InstanaCredentials> {
		match self {
			Self::Resolved { token, base_url, .. } =>
				Some(InstanaCredentials { token: token.clone(), base_url: base_url.clone() }),
			Self::Unresolved { .. } => None,
		}
	}

	/// Failure message for an unresolved outcome.
	pub fn error_message(&self) -> Option<String> {
		let Self::Unresolved { reasons, mode } = self else {
			return None;
		};

		if reasons.contains(&UnresolvedReason::InvalidBaseUrl) {
			return Some(UnresolvedReason::InvalidBaseUrl.describe(*mode).to_owned());
		}

		let described = reasons.iter().map(|reason| reason.describe(*mode)).collect::<Vec<_>>();

		Some(match mode {
			CredentialMode::Http => format!(
				"HTTP mode detected but missing required configuration: {}",
				described.join(", ")
			),
			CredentialMode::Stdio =>
				format!("Authentication failed: Missing credentials - {}", described.join(" - ")),
		})
	}

	/// Convert into credentials or the error payload returned to the caller.
	pub fn into_result(self) -> std::result::Result<InstanaCredentials, ErrorPayload> {
		match self {
			Self::Resolved { token, base_url, .. } => Ok(InstanaCredentials { token, base_url }),
			unresolved => Err(ErrorPayload::new(unresolved.error_message().unwrap_or_default())),
		}
	}
}

/// Error body returned at the tool-call boundary: `{"error": "..."}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
	/// Human-readable message.
	pub error: String,
}
impl ErrorPayload {
	/// Payload with the given message.
	pub fn new(error: impl Into<String>) -> Self {
		Self { error: error.into() }
	}
}
impl From<&Error> for ErrorPayload {
	fn from(err: &Error) -> Self {
		Self::new(err.to_string())
	}
}
impl From<Error> for ErrorPayload {
	fn from(err: Error) -> Self {
		Self::from(&err)
	}
}

/// Credentials used in stdio mode.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticCredentials {
	/// Downstream API token.
	pub api_token: Option<String>,
	/// Downstream base URL.
	pub base_url: Option<String>,
}

/// Authentication components shared by every request handler.
#[derive(Clone, Debug, Default)]
pub struct AuthContext {
	verifier: Option<Arc<TokenVerifier>>,
	oauth: Option<Arc<SimpleOAuthProvider>>,
	mode: ModeSettings,
	static_credentials: StaticCredentials,
}
impl AuthContext {
	/// Start building a context.
	pub fn builder() -> AuthContextBuilder {
		AuthContextBuilder::default()
	}

	/// Build every component from the process environment.
	pub fn from_env() -> Result<Self> {
		let mode = ModeSettings::from_env();
		let mut builder = Self::builder()
			.static_credentials(StaticCredentials {
				api_token: mode.api_token.clone(),
				base_url: mode.default_base_url.clone(),
			})
			.mode_settings(mode);

		if let Some(verifier) = TokenVerifier::from_env()? {
			builder = builder.verifier(Arc::new(verifier));
		}
		if let Some(oauth) = SimpleOAuthProvider::from_env()? {
			builder = builder.oauth_provider(Arc::new(oauth));
		}

		Ok(builder.build())
	}

	/// JWT verifier, when JWT authentication is enabled.
	pub fn verifier(&self) -> Option<&Arc<TokenVerifier>> {
		self.verifier.as_ref()
	}

	/// OAuth provider, when OAuth is enabled.
	pub fn oauth_provider(&self) -> Option<&Arc<SimpleOAuthProvider>> {
		self.oauth.as_ref()
	}

	/// Mode settings in effect.
	pub fn mode_settings(&self) -> &ModeSettings {
		&self.mode
	}

	/// Validate the request's bearer JWT and return the access it grants.
	pub async fn verify_bearer(&self, headers: &HeaderMap) -> Option<VerifiedAccess> {
		let verifier = self.verifier.as_ref()?;
		let token = extract_jwt_token(headers)?;

		verifier.load_access_token(token).await
	}

	/// Resolve downstream credentials for a request; `None` headers means stdio transport.
	pub async fn resolve_credentials(&self, headers: Option<&HeaderMap>) -> CredentialResolution {
		let Some(headers) = headers.filter(|headers| is_http_request(headers)) else {
			return self.resolve_static();
		};
		let mut token = header_value(headers, JWT_TOKEN_HEADER);
		let mut base_url = header_value(headers, BASE_URL_HEADER);

		if token.is_none()
			&& let Some(bearer) = extract_jwt_token(headers)
		{
			if self.mode.oauth_enabled
				&& let Some(oauth) = &self.oauth
			{
				if oauth.load_access_token(bearer).await.is_some() {
					token = oauth.get_instana_jwt_token(bearer).await;

					if token.is_none() {
						tracing::warn!("no downstream JWT recorded for the MCP token");
					}
				} else {
					tracing::debug!("bearer is not a live MCP token");
				}
			}
			if token.is_none()
				&& let Some(verifier) = &self.verifier
				&& let Some(access) = verifier.load_access_token(bearer).await
			{
				token = Some(access.credentials.token);
				base_url = base_url.or(Some(access.credentials.base_url));
			}
		}

		if base_url.is_none() {
			base_url = self.mode.default_base_url.clone();

			if base_url.is_some() {
				tracing::debug!("using the default base URL");
			}
		}

		let mut reasons = Vec::new();

		if token.is_none() {
			reasons.push(UnresolvedReason::MissingToken);
		}
		if base_url.is_none() {
			reasons.push(UnresolvedReason::MissingBaseUrl);
		}

		let (Some(token), Some(base_url)) = (token, base_url) else {
			tracing::error!(?reasons, "HTTP mode credentials incomplete");

			return CredentialResolution::Unresolved { reasons, mode: CredentialMode::Http };
		};

		if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
			tracing::error!(base_url = %base_url, "base URL is not an HTTP(S) URL");

			return CredentialResolution::Unresolved {
				reasons: vec![UnresolvedReason::InvalidBaseUrl],
				mode: CredentialMode::Http,
			};
		}

		tracing::debug!(base_url = %base_url, token_len = token.len(), "using header credentials");

		CredentialResolution::Resolved { token, base_url, mode: CredentialMode::Http }
	}

	fn resolve_static(&self) -> CredentialResolution {
		let StaticCredentials { api_token, base_url } = self.static_credentials.clone();
		let mut reasons = Vec::new();

		if api_token.is_none() {
			reasons.push(UnresolvedReason::MissingToken);
		}
		if base_url.is_none() {
			reasons.push(UnresolvedReason::MissingBaseUrl);
		}

		match (api_token, base_url) {
			(Some(token), Some(base_url)) =>
				CredentialResolution::Resolved { token, base_url, mode: CredentialMode::Stdio },
			_ => {
				tracing::error!(?reasons, "static credentials incomplete");

				CredentialResolution::Unresolved { reasons, mode: CredentialMode::Stdio }
			},
		}
	}
}

/// Builder for [`AuthContext`].
#[derive(Debug, Default)]
pub struct AuthContextBuilder {
	context: AuthContext,
}
impl AuthContextBuilder {
	/// Attach a JWT verifier.
	pub fn verifier(mut self, verifier: Arc<TokenVerifier>) -> Self {
		self.context.verifier = Some(verifier);

		self
	}

	/// Attach an OAuth provider.
	pub fn oauth_provider(mut self, oauth: Arc<SimpleOAuthProvider>) -> Self {
		self.context.oauth = Some(oauth);

		self
	}

	/// Replace the mode settings.
	pub fn mode_settings(mut self, mode: ModeSettings) -> Self {
		self.context.mode = mode;

		self
	}

	/// Replace the stdio credentials.
	pub fn static_credentials(mut self, credentials: StaticCredentials) -> Self {
		self.context.static_credentials = credentials;

		self
	}

	/// Finish building.
	pub fn build(self) -> AuthContext {
		self.context
	}
}

fn is_http_request(headers: &HeaderMap) -> bool {
	header_value(headers, JWT_TOKEN_HEADER).is_some()
		|| header_value(headers, BASE_URL_HEADER).is_some()
		|| headers.get(AUTHORIZATION).is_some_and(|value| !value.is_empty())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
	headers
		.get(name)
		.and_then(|value| value.to_str().ok())
		.filter(|value| !value.is_empty())
		.map(str::to_owned)
}
