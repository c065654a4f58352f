//! Session-cookie login for downstream APIs that use `JSESSIONID` instead of bearer tokens.

// crates.io
use http::{
	HeaderMap, HeaderValue, Method,
	header::{COOKIE, SET_COOKIE},
};
use reqwest::{Client, RequestBuilder, redirect::Policy};
use url::Url;
// self
use crate::{
	_prelude::*,
	config::SessionSettings,
	dynamic::{AuthMethod, SESSION_COOKIE, resolve_url},
	metrics,
};

/// Timeout applied to the login request.
pub const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Logs in with form credentials and hands out a cookie-authenticated client.
///
/// Every call to [`authenticated_client`](Self::authenticated_client) performs a fresh login;
/// nothing is cached between calls.
#[derive(Clone, Debug)]
pub struct DynamicTokenManager {
	base_url: Url,
	timeout: Duration,
	method: Option<AuthMethod>,
	settings: SessionSettings,
}
impl DynamicTokenManager {
	/// Build a manager for `base_url`.
	pub fn new(base_url: &str, settings: SessionSettings, timeout: Duration) -> Result<Self> {
		let base_url = Url::parse(base_url).map_err(|err| Error::Config {
			field: "base_url",
			reason: format!("Invalid base URL: {err}."),
		})?;
		let method = AuthMethod::from_strategy(settings.auth_strategy.as_deref());

		Ok(Self { base_url, timeout, method, settings })
	}

	/// Strategy resolved from `auth_strategy`, if recognized.
	pub fn auth_method(&self) -> Option<&AuthMethod> {
		self.method.as_ref()
	}

	/// Log in and return a client carrying the session cookie.
	///
	/// Returns `Ok(None)` when the strategy is not `jsessionid`, a credential is missing, the
	/// login request fails, or the login status is not successful. A successful login without a
	/// `JSESSIONID` cookie is an error.
	#[tracing::instrument(skip(self), fields(base_url = %self.base_url))]
	pub async fn authenticated_client(&self) -> Result<Option<SessionClient>> {
		if self.method != Some(AuthMethod::SessionCookie) {
			return Ok(None);
		}

		let non_empty = |value: &Option<String>| value.clone().filter(|v| !v.is_empty());
		let (Some(login_url), Some(username), Some(password)) = (
			non_empty(&self.settings.login_url),
			non_empty(&self.settings.username),
			non_empty(&self.settings.password),
		) else {
			tracing::warn!("missing login credentials or login URL");

			return Ok(None);
		};
		let login_url = resolve_url(&self.base_url, &login_url)?;
		let login = Client::builder()
			.danger_accept_invalid_certs(true)
			.redirect(Policy::limited(10))
			.timeout(LOGIN_TIMEOUT)
			.build()?;

		tracing::info!(url = %login_url, username = %username, "logging in for a session cookie");

		let response = match login
			.post(login_url)
			.form(&[("username", username.as_str()), ("password", password.as_str())])
			.send()
			.await
		{
			Ok(response) => response,
			Err(err) => {
				tracing::error!(error = %err, "login request failed");
				metrics::record_session_login(false);

				return Ok(None);
			},
		};
		let status = response.status();

		if !status.is_success() {
			let body = response.text().await.unwrap_or_default();

			tracing::error!(%status, body = %body, "HTTP error during login");
			metrics::record_session_login(false);

			return Ok(None);
		}

		let Some(session_id) = session_cookie(response.headers()) else {
			tracing::error!("login response carried no JSESSIONID cookie");
			metrics::record_session_login(false);

			return Err(Error::MissingSessionCookie);
		};

		tracing::info!(session_id_len = session_id.len(), "received session cookie");
		metrics::record_session_login(true);

		SessionClient::new(self.base_url.clone(), session_id, self.timeout).map(Some)
	}
}

/// HTTP client bound to a base URL and a session cookie.
#[derive(Clone, Debug)]
pub struct SessionClient {
	client: Client,
	base_url: Url,
	session_id: String,
}
impl SessionClient {
	fn new(base_url: Url, session_id: String, timeout: Duration) -> Result<Self> {
		let mut cookie = HeaderValue::from_str(&format!("{SESSION_COOKIE}={session_id}"))?;

		cookie.set_sensitive(true);

		let mut headers = HeaderMap::new();

		headers.insert(COOKIE, cookie);

		let client = Client::builder()
			.default_headers(headers)
			.danger_accept_invalid_certs(true)
			.timeout(timeout)
			.build()?;

		Ok(Self { client, base_url, session_id })
	}

	/// Session id carried in the cookie.
	pub fn session_id(&self) -> &str {
		&self.session_id
	}

	/// Base URL relative request paths are resolved against.
	pub fn base_url(&self) -> &Url {
		&self.base_url
	}

	/// Underlying reqwest client with the cookie installed as a default header.
	pub fn client(&self) -> &Client {
		&self.client
	}

	/// Start a request to `path`, resolved against the base URL.
	pub fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
		Ok(self.client.request(method, resolve_url(&self.base_url, path)?))
	}
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
	headers.get_all(SET_COOKIE).iter().filter_map(|value| value.to_str().ok()).find_map(|cookie| {
		let (name, value) = cookie.split(';').next()?.split_once('=')?;
		let value = value.trim();

		(name.trim() == SESSION_COOKIE && !value.is_empty()).then(|| value.to_owned())
	})
}
