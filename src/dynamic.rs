//! Dynamic downstream credentials: bearer tokens fetched on demand and session-cookie logins.

pub mod client;
pub mod session;

pub use client::DynamicTokenClient;
pub use session::{DynamicTokenManager, SessionClient};

// crates.io
use http::Method;
use serde_json::Value;
use url::Url;
// self
use crate::{_prelude::*, config::AuthData};

/// Upper bound applied to lifetimes reported by token endpoints.
pub const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(365 * 24 * 60 * 60);
/// Lifetime assumed when the token endpoint omits `expires_in`.
pub const DEFAULT_TOKEN_EXPIRY: Duration = Duration::from_secs(3600);
/// Subtracted from the reported lifetime so tokens renew early.
pub const TOKEN_REFRESH_BUFFER: Duration = Duration::from_secs(60);
/// Grant type sent by the IAM-style refresh.
pub const IAM_GRANT_TYPE: &str = "urn:ibm:params:oauth:grant-type:apikey";
/// Strategy name selecting session-cookie login.
pub const JSESSIONID_STRATEGY: &str = "jsessionid";
/// Session cookie issued by the login endpoint.
pub const SESSION_COOKIE: &str = "JSESSIONID";

/// How downstream credentials are obtained, resolved once at construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthMethod {
	/// POST `{"apikey": ...}` as JSON to the token endpoint.
	Jwt,
	/// Basic-authenticated request to the token endpoint.
	Basic {
		/// GET unless configured as `post`.
		request_method: Method,
	},
	/// POST the IAM apikey grant as a form.
	Iam,
	/// Form login yielding a `JSESSIONID` cookie.
	SessionCookie,
}
impl AuthMethod {
	/// Select the token method described by `auth_data`.
	pub fn from_auth_data(auth_data: &AuthData) -> Self {
		Self::from_token_gen(
			auth_data.token_gen_auth_method.as_deref(),
			auth_data.token_gen_method.as_deref(),
		)
	}

	/// Map `token_gen_auth_method` and `token_gen_method` to a variant; unknown methods use the
	/// IAM grant.
	pub fn from_token_gen(auth_method: Option<&str>, request_method: Option<&str>) -> Self {
		match auth_method {
			Some("jwt") => Self::Jwt,
			Some("basic") => {
				let request_method = if request_method.is_some_and(|m| m.eq_ignore_ascii_case("post"))
				{
					Method::POST
				} else {
					Method::GET
				};

				Self::Basic { request_method }
			},
			_ => Self::Iam,
		}
	}

	/// Map a session `auth_strategy`; only `jsessionid` is recognized.
	pub fn from_strategy(strategy: Option<&str>) -> Option<Self> {
		(strategy == Some(JSESSIONID_STRATEGY)).then_some(Self::SessionCookie)
	}

	/// Short name used in logs.
	pub fn name(&self) -> &'static str {
		match self {
			Self::Jwt => "jwt",
			Self::Basic { .. } => "basic",
			Self::Iam => "iam",
			Self::SessionCookie => "jsessionid",
		}
	}
}

/// A token issued by a token endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedToken {
	/// Bearer token value.
	pub access_token: String,
	/// Reported lifetime, defaulting to [`DEFAULT_TOKEN_EXPIRY`].
	pub expires_in: Duration,
}
impl IssuedToken {
	/// Extract a token from a JSON body, reading `access_token` then `token`.
	///
	/// `expires_in` may be a number or a numeric string.
	pub fn from_body(body: &[u8]) -> Option<Self> {
		let value: Value = serde_json::from_slice(body).ok()?;
		let access_token = ["access_token", "token"]
			.iter()
			.filter_map(|field| value.get(*field).and_then(Value::as_str))
			.find(|token| !token.is_empty())?;
		let expires_in = value
			.get("expires_in")
			.and_then(parse_seconds)
			.map(|secs| Duration::from_secs(secs).min(MAX_TOKEN_LIFETIME))
			.unwrap_or(DEFAULT_TOKEN_EXPIRY);

		Some(Self { access_token: access_token.to_owned(), expires_in })
	}

	/// Instant at which the token must be renewed, measured from `issued_at`.
	pub fn renew_at(&self, issued_at: Instant) -> Instant {
		let lifetime =
			self.expires_in.min(MAX_TOKEN_LIFETIME).saturating_sub(TOKEN_REFRESH_BUFFER);

		issued_at.checked_add(lifetime).unwrap_or(issued_at)
	}
}

/// Resolve `$NAME` or `${NAME}` from the process environment; other values are literal.
pub fn resolve_env_value(value: Option<&str>) -> Option<String> {
	resolve_env_value_with(value, crate::config::env_lookup)
}

/// [`resolve_env_value`] with an explicit lookup.
pub fn resolve_env_value_with<F>(value: Option<&str>, lookup: F) -> Option<String>
where
	F: Fn(&str) -> Option<String>,
{
	let value = value.filter(|v| !v.is_empty())?;
	let name = value
		.strip_prefix("${")
		.and_then(|rest| rest.strip_suffix('}'))
		.or_else(|| value.strip_prefix('$'));

	match name {
		Some(name) if !name.is_empty() => lookup(name).filter(|v| !v.is_empty()),
		_ => Some(value.to_owned()),
	}
}

/// Resolve `raw` against `base`, appending relative paths to the base path.
pub(crate) fn resolve_url(base: &Url, raw: &str) -> Result<Url> {
	match Url::parse(raw) {
		Ok(url) => Ok(url),
		Err(url::ParseError::RelativeUrlWithoutBase) => {
			let (path, query) = match raw.split_once('?') {
				Some((path, query)) => (path, Some(query)),
				None => (raw, None),
			};
			let mut url = base.clone();

			url.set_path(&format!(
				"{}/{}",
				base.path().trim_end_matches('/'),
				path.trim_start_matches('/')
			));
			url.set_query(query);

			Ok(url)
		},
		Err(err) => Err(err.into()),
	}
}

fn parse_seconds(value: &Value) -> Option<u64> {
	let secs = match value {
		Value::Number(number) => match number.as_u64() {
			Some(secs) => return Some(secs),
			None => number.as_f64()?,
		},
		Value::String(raw) => raw.trim().parse::<f64>().ok()?,
		_ => return None,
	};

	// Negative lifetimes renew immediately.
	secs.is_finite().then(|| secs.max(0.0) as u64)
}
