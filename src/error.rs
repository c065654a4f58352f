//! Crate-wide error types and `Result` alias.

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the credential mediation crate.
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Http(#[from] http::Error),
	#[error(transparent)]
	InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),
	#[error(transparent)]
	Jsonwebtoken(#[from] jsonwebtoken::errors::Error),
	#[error(transparent)]
	Reqwest(#[from] reqwest::Error),
	#[error(transparent)]
	Serde(#[from] serde_json::Error),
	#[error(transparent)]
	Url(#[from] url::ParseError),

	#[error("Configuration error for {field}: {reason}")]
	Config { field: &'static str, reason: String },
	#[error(
		"Failed to load OAuth settings with prefix '{prefix}'. Missing required environment variables: {missing:?}"
	)]
	MissingSettings { prefix: String, missing: Vec<String> },
	#[error("Upstream HTTP status {status} from {url}: {body:?}")]
	HttpStatus { status: http::StatusCode, url: url::Url, body: Option<String> },
	#[error("Token refresh failed: {0}")]
	TokenRefresh(String),
	#[error("Invalid state parameter.")]
	InvalidState,
	#[error("Invalid authorization code.")]
	InvalidAuthorizationCode,
	#[error("Upstream OAuth error: {0}")]
	UpstreamOAuth(String),
	#[error("No valid authentication token found in upstream response.")]
	MissingUpstreamToken,
	#[error("JSESSIONID not found; login failed.")]
	MissingSessionCookie,
	#[error("Not supported: {0}.")]
	Unsupported(&'static str),
	#[cfg(feature = "prometheus")]
	#[error("Metrics error: {0}")]
	Metrics(String),
}
