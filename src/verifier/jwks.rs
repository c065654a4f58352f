//! JWKS retrieval with a fixed cache window.
//!
//! Keys are indexed by `kid`. A failed refresh never surfaces as an error: the previously cached
//! keys (possibly none) are served instead, and the next lookup tries again.

// crates.io
use http::header::ACCEPT;
use jsonwebtoken::jwk::Jwk;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::RwLock;
use url::Url;
// self
use crate::_prelude::*;

/// Default interval between JWKS fetches.
pub const DEFAULT_CACHE_DURATION: Duration = Duration::from_secs(3600);
/// Timeout applied to a single JWKS fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Key-id indexed view of a JWKS document.
pub type KeyMap = HashMap<String, Jwk>;

/// Caches the signing keys published at a JWKS endpoint.
#[derive(Debug)]
pub struct JwksCache {
	uri: Url,
	client: Client,
	cache_duration: Duration,
	state: RwLock<JwksState>,
}
impl JwksCache {
	/// Build a cache with a dedicated reqwest client.
	pub fn new(uri: Url) -> Result<Self> {
		let client = Client::builder()
			.user_agent(format!("instana-mcp-auth/{}", env!("CARGO_PKG_VERSION")))
			.timeout(DEFAULT_FETCH_TIMEOUT)
			.build()?;

		Ok(Self::with_client(uri, client))
	}

	/// Build a cache using the supplied HTTP client.
	pub fn with_client(uri: Url, client: Client) -> Self {
		Self {
			uri,
			client,
			cache_duration: DEFAULT_CACHE_DURATION,
			state: RwLock::new(JwksState::default()),
		}
	}

	/// Override the interval between fetches.
	pub fn with_cache_duration(mut self, cache_duration: Duration) -> Self {
		self.cache_duration = cache_duration;

		self
	}

	/// JWKS endpoint backing this cache.
	pub fn uri(&self) -> &Url {
		&self.uri
	}

	/// Return the cached keys, fetching first when the cache window has elapsed.
	pub async fn keys(&self) -> Arc<KeyMap> {
		{
			let state = self.state.read().await;

			if let Some(fetched_at) = state.fetched_at
				&& fetched_at.elapsed() < self.cache_duration
			{
				return state.keys.clone();
			}
		}

		match self.fetch().await {
			Ok(keys) => {
				let keys = Arc::new(keys);
				let mut state = self.state.write().await;

				state.keys = keys.clone();
				state.fetched_at = Some(Instant::now());

				keys
			},
			Err(err) => {
				tracing::error!(error = %err, uri = %self.uri, "failed to fetch JWKS keys");

				self.state.read().await.keys.clone()
			},
		}
	}

	/// Look up a single key by id.
	pub async fn get(&self, kid: &str) -> Option<Jwk> {
		self.keys().await.get(kid).cloned()
	}

	#[tracing::instrument(skip(self), fields(uri = %self.uri))]
	async fn fetch(&self) -> Result<KeyMap> {
		let response =
			self.client.get(self.uri.clone()).header(ACCEPT, "application/json").send().await?;
		let status = response.status();

		if !status.is_success() {
			let body = response.text().await.ok();

			return Err(Error::HttpStatus { status, url: self.uri.clone(), body });
		}

		let document: JwksDocument = response.json().await?;
		let mut keys = KeyMap::with_capacity(document.keys.len());

		for raw in document.keys {
			match serde_json::from_value::<Jwk>(raw) {
				Ok(jwk) => match jwk.common.key_id.clone() {
					Some(kid) => {
						keys.insert(kid, jwk);
					},
					None => tracing::debug!("skipping JWK without a key id"),
				},
				Err(err) => tracing::warn!(error = %err, "skipping malformed JWK"),
			}
		}

		tracing::debug!(count = keys.len(), "fetched keys from JWKS endpoint");

		Ok(keys)
	}
}

#[derive(Debug, Default)]
struct JwksState {
	keys: Arc<KeyMap>,
	fetched_at: Option<Instant>,
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
	#[serde(default)]
	keys: Vec<serde_json::Value>,
}
