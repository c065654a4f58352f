//! HTTP client that injects a lazily refreshed bearer token into every request.

// crates.io
use http::{
	HeaderMap, HeaderValue, Method,
	header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
};
use reqwest::{Body, Client, Response};
use serde::Serialize;
use tokio::sync::RwLock;
use url::Url;
// self
use crate::{
	_prelude::*,
	config::AuthData,
	dynamic::{AuthMethod, IAM_GRANT_TYPE, IssuedToken, resolve_env_value, resolve_url},
	metrics::{self, RefreshStats, RefreshStatsSnapshot},
};

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bearer-token injecting client for downstream APIs that issue short-lived tokens.
///
/// A token is fetched on the first request and again whenever the cached one reaches its renewal
/// instant. Requests addressed to the token endpoint itself pass through untouched.
#[derive(Debug)]
pub struct DynamicTokenClient {
	base_url: Url,
	client: Client,
	auth_data: Option<AuthData>,
	method: AuthMethod,
	token_endpoint: Option<Url>,
	default_headers: HeaderMap,
	cache: RwLock<TokenCache>,
	stats: Arc<RefreshStats>,
}
impl DynamicTokenClient {
	/// Build a client; the base URL must be non-empty and the timeout positive.
	pub fn new(base_url: &str, auth_data: Option<AuthData>, timeout: Duration) -> Result<Self> {
		if base_url.is_empty() {
			return Err(Error::Config { field: "base_url", reason: "base_url cannot be empty".into() });
		}
		if timeout.is_zero() {
			return Err(Error::Config { field: "timeout", reason: "timeout must be positive".into() });
		}

		let base_url = Url::parse(base_url).map_err(|err| Error::Config {
			field: "base_url",
			reason: format!("Invalid base URL: {err}."),
		})?;
		let client = Client::builder()
			.user_agent(format!("instana-mcp-auth/{}", env!("CARGO_PKG_VERSION")))
			.timeout(timeout)
			.build()?;
		let token_endpoint = auth_data
			.as_ref()
			.and_then(|data| data.token_url.as_deref())
			.filter(|raw| !raw.is_empty())
			.map(|raw| resolve_url(&base_url, raw))
			.transpose()?;
		let method = auth_data.as_ref().map(AuthMethod::from_auth_data).unwrap_or(AuthMethod::Iam);

		Ok(Self {
			base_url,
			client,
			auth_data,
			method,
			token_endpoint,
			default_headers: HeaderMap::new(),
			cache: RwLock::new(TokenCache::default()),
			stats: RefreshStats::new(),
		})
	}

	/// Headers sent with every request, beneath per-request headers.
	pub fn with_headers(mut self, headers: HeaderMap) -> Self {
		self.default_headers = headers;

		self
	}

	/// Base URL relative request paths are resolved against.
	pub fn base_url(&self) -> &Url {
		&self.base_url
	}

	/// Refresh method selected at construction.
	pub fn auth_method(&self) -> &AuthMethod {
		&self.method
	}

	/// Currently cached token, whether or not it is due for renewal.
	pub async fn cached_token(&self) -> Option<String> {
		self.cache.read().await.access_token.clone()
	}

	/// Instant at which the cached token will be renewed.
	pub async fn expires_at(&self) -> Option<Instant> {
		self.cache.read().await.renew_at
	}

	/// Refresh counters for this client.
	pub fn stats(&self) -> RefreshStatsSnapshot {
		self.stats.snapshot()
	}

	/// GET `url` with the bearer token attached.
	pub async fn get(&self, url: &str) -> Result<Response> {
		self.send(Method::GET, url, &HeaderMap::new(), None).await
	}

	/// POST a JSON body to `url` with the bearer token attached.
	pub async fn post_json<T>(&self, url: &str, body: &T) -> Result<Response>
	where
		T: ?Sized + Serialize,
	{
		self.send(Method::POST, url, &HeaderMap::new(), Some(serde_json::to_vec(body)?.into())).await
	}

	/// Send a request, refreshing the token first when needed.
	///
	/// Per-request headers override the defaults. `Authorization` is always replaced with the
	/// cached bearer token and `Content-Type` defaults to `application/json`. The response is
	/// returned whatever its status.
	#[tracing::instrument(skip(self, method, headers, body), fields(method = %method))]
	pub async fn send(
		&self,
		method: Method,
		url: &str,
		headers: &HeaderMap,
		body: Option<Body>,
	) -> Result<Response> {
		let target = resolve_url(&self.base_url, url)?;
		let mut merged = merge_headers(&self.default_headers, headers);

		if self.is_token_endpoint(&target) {
			tracing::debug!("requesting the token endpoint; skipping token injection");

			return self.dispatch(method, target, merged, body).await;
		}

		let token = self.access_token().await?;
		let mut bearer = HeaderValue::from_str(&format!("Bearer {token}"))?;

		bearer.set_sensitive(true);
		merged.insert(AUTHORIZATION, bearer);

		if !merged.contains_key(CONTENT_TYPE) {
			merged.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
		}

		self.dispatch(method, target, merged, body).await
	}

	/// Return the cached token, refreshing it when absent or due.
	///
	/// A failed refresh clears the cache and propagates the error.
	pub async fn access_token(&self) -> Result<String> {
		{
			let cache = self.cache.read().await;

			if let Some(token) = cache.usable() {
				return Ok(token.to_owned());
			}
		}

		let started = Instant::now();

		match self.refresh_token().await {
			Ok(issued) => {
				let elapsed = started.elapsed();
				let token = issued.access_token.clone();
				let mut cache = self.cache.write().await;

				cache.renew_at = Some(issued.renew_at(Instant::now()));
				cache.access_token = Some(issued.access_token);

				self.stats.record_success(elapsed);
				metrics::record_token_refresh(true, elapsed);

				Ok(token)
			},
			Err(err) => {
				tracing::error!(error = %err, "failed to refresh token");

				*self.cache.write().await = TokenCache::default();

				self.stats.record_error();
				metrics::record_token_refresh(false, started.elapsed());

				Err(err)
			},
		}
	}

	#[tracing::instrument(skip(self), fields(method = self.method.name()))]
	async fn refresh_token(&self) -> Result<IssuedToken> {
		let Some(auth_data) = &self.auth_data else {
			return Err(Error::TokenRefresh("Missing auth_data for token refresh.".into()));
		};
		let Some(token_url) = self.token_endpoint.clone() else {
			return Err(Error::TokenRefresh("token_url must be provided in auth_data.".into()));
		};
		let id = resolve_env_value(auth_data.id.as_deref());
		let secret = resolve_env_value(auth_data.secret.as_deref());
		let apikey = resolve_env_value(auth_data.apikey.as_deref());
		let basic = id.zip(secret);

		if apikey.is_none() && basic.is_none() {
			return Err(Error::TokenRefresh(
				"Either apikey or (id and secret) must be provided in auth_data.".into(),
			));
		}

		let request = match &self.method {
			AuthMethod::Jwt => {
				let apikey = apikey.ok_or_else(|| {
					Error::TokenRefresh("The jwt method requires an apikey.".into())
				})?;

				self.client
					.post(token_url.clone())
					.header(ACCEPT, "application/json")
					.json(&serde_json::json!({ "apikey": apikey }))
			},
			AuthMethod::Basic { request_method } => {
				let (id, secret) = basic.ok_or_else(|| {
					Error::TokenRefresh("The basic method requires id and secret.".into())
				})?;

				tracing::debug!(id = %id, secret_len = secret.len(), "requesting token with basic auth");

				self.client
					.request(request_method.clone(), token_url.clone())
					.header(ACCEPT, "application/json")
					.basic_auth(id, Some(secret))
			},
			AuthMethod::Iam => {
				let apikey = apikey.ok_or_else(|| {
					Error::TokenRefresh("The IAM method requires an apikey.".into())
				})?;

				self.client
					.post(token_url.clone())
					.form(&[("grant_type", IAM_GRANT_TYPE), ("apikey", apikey.as_str())])
			},
			AuthMethod::SessionCookie =>
				return Err(Error::Config {
					field: "token_gen_auth_method",
					reason: "Session-cookie authentication has no token endpoint.".into(),
				}),
		};
		let response = request.send().await?;
		let status = response.status();
		let body = response.bytes().await?;

		match IssuedToken::from_body(&body) {
			Some(issued) => {
				if !status.is_success() {
					tracing::warn!(%status, "token endpoint returned a usable token with an error status");
				}

				tracing::debug!(expires_in = issued.expires_in.as_secs(), "token refreshed");

				Ok(issued)
			},
			None if status.is_success() =>
				Err(Error::TokenRefresh("Token endpoint returned no access token.".into())),
			None => {
				let body = String::from_utf8_lossy(&body).into_owned();

				tracing::error!(%status, body = %body, "HTTP error during token refresh");

				Err(Error::HttpStatus { status, url: token_url, body: Some(body) })
			},
		}
	}

	fn is_token_endpoint(&self, target: &Url) -> bool {
		self.token_endpoint.as_ref().is_some_and(|endpoint| target.as_str().starts_with(endpoint.as_str()))
	}

	async fn dispatch(
		&self,
		method: Method,
		target: Url,
		headers: HeaderMap,
		body: Option<Body>,
	) -> Result<Response> {
		let mut request = self.client.request(method, target).headers(headers);

		if let Some(body) = body {
			request = request.body(body);
		}

		Ok(request.send().await?)
	}
}

#[derive(Debug, Default)]
struct TokenCache {
	access_token: Option<String>,
	renew_at: Option<Instant>,
}
impl TokenCache {
	fn usable(&self) -> Option<&str> {
		match (&self.access_token, self.renew_at) {
			(Some(token), Some(renew_at)) if Instant::now() < renew_at => Some(token),
			_ => None,
		}
	}
}

fn merge_headers(defaults: &HeaderMap, overrides: &HeaderMap) -> HeaderMap {
	let mut merged = defaults.clone();

	for name in overrides.keys() {
		merged.remove(name);
	}
	for (name, value) in overrides {
		merged.append(name.clone(), value.clone());
	}

	merged
}
