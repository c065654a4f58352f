//! In-memory OAuth provider state machine.

// crates.io
use http::{StatusCode, header::ACCEPT};
use reqwest::Client;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use url::Url;
// self
use crate::{
	_prelude::*,
	config::OAuthSettings,
	metrics,
	oauth::{
		ACCESS_TOKEN_TTL, AUTHORIZATION_CODE_TTL, AccessToken, AuthorizationCode,
		AuthorizationParams, ClientRecord, CodeChallengeMethod, MCP_TOKEN_PREFIX, OAuthToken,
		RegistrationOptions, UPSTREAM_TOKEN_PREFIX, token_hex,
	},
};

/// Timeout applied to the upstream token request.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// OAuth provider that brokers an upstream authorization server for MCP clients.
///
/// All state lives in memory behind one lock that is never held across the upstream request.
#[derive(Debug)]
pub struct SimpleOAuthProvider {
	settings: OAuthSettings,
	client: Client,
	registration: RegistrationOptions,
	state: RwLock<ProviderState>,
}
impl SimpleOAuthProvider {
	/// Build a provider with a dedicated reqwest client.
	pub fn new(settings: OAuthSettings) -> Result<Self> {
		let client = Client::builder()
			.user_agent(format!("instana-mcp-auth/{}", env!("CARGO_PKG_VERSION")))
			.timeout(UPSTREAM_TIMEOUT)
			.build()?;

		Self::with_client(settings, client)
	}

	/// Build a provider using the supplied HTTP client.
	pub fn with_client(settings: OAuthSettings, client: Client) -> Result<Self> {
		settings.validate()?;

		let registration = RegistrationOptions {
			enabled: true,
			valid_scopes: vec![settings.mcp_scope.clone()],
			default_scopes: vec![settings.mcp_scope.clone()],
		};

		Ok(Self { settings, client, registration, state: RwLock::new(ProviderState::default()) })
	}

	/// Build a provider from `OAUTH_*` variables; `None` when OAuth is disabled.
	pub fn from_env() -> Result<Option<Self>> {
		let settings = OAuthSettings::from_env()?;

		if !settings.enabled {
			return Ok(None);
		}

		tracing::info!(server_url = %settings.server_url, "OAuth provider enabled");

		Self::new(settings).map(Some)
	}

	/// Issuer, documentation, and resource server URL.
	pub fn issuer_url(&self) -> &Url {
		&self.settings.server_url
	}

	/// Client registration policy.
	pub fn registration_options(&self) -> &RegistrationOptions {
		&self.registration
	}

	/// Settings the provider was built from.
	pub fn settings(&self) -> &OAuthSettings {
		&self.settings
	}

	/// Register or replace a client.
	pub async fn register_client(&self, client: ClientRecord) {
		tracing::debug!(client_id = %client.client_id, "registering OAuth client");

		self.state.write().await.clients.insert(client.client_id.clone(), client);
	}

	/// Look up a registered client.
	pub async fn get_client(&self, client_id: &str) -> Option<ClientRecord> {
		self.state.read().await.clients.get(client_id).cloned()
	}

	/// Record the authorization attempt and return the upstream authorization URL.
	pub async fn authorize(
		&self,
		client: &ClientRecord,
		params: AuthorizationParams,
	) -> Result<String> {
		let state = params.state.filter(|state| !state.is_empty()).unwrap_or_else(|| token_hex(16));
		let mut url = Url::parse(&self.settings.auth_url)?;

		url.query_pairs_mut()
			.append_pair("client_id", &self.settings.client_id)
			.append_pair("redirect_uri", &self.settings.callback_path)
			.append_pair("scope", &self.settings.provider_scope)
			.append_pair("state", &state)
			.append_pair("response_type", "code");

		tracing::info!(
			client_id = %client.client_id,
			redirect_uri = %params.redirect_uri,
			pkce = params.code_challenge.is_some(),
			"OAuth authorization started"
		);

		self.state.write().await.state_mapping.insert(
			state,
			PendingAuthorization {
				client_id: client.client_id.clone(),
				redirect_uri: params.redirect_uri,
				redirect_uri_provided_explicitly: params.redirect_uri_provided_explicitly,
				code_challenge: params.code_challenge,
				code_challenge_method: params.code_challenge_method,
			},
		);

		Ok(url.into())
	}

	/// Complete the upstream leg and return the client's final redirect URI.
	///
	/// The state entry is consumed before the upstream request, so a state value is never
	/// accepted twice even when the exchange fails.
	pub async fn handle_callback(&self, code: &str, state: &str) -> Result<String> {
		let pending = self.state.write().await.state_mapping.remove(state);
		let Some(pending) = pending else {
			tracing::error!("OAuth callback with an unknown state");
			metrics::record_oauth_exchange("callback", false);

			return Err(Error::InvalidState);
		};
		let upstream = match self.exchange_upstream_code(code).await {
			Ok(upstream) => upstream,
			Err(err) => {
				metrics::record_oauth_exchange("callback", false);

				return Err(err);
			},
		};
		let new_code = format!("{MCP_TOKEN_PREFIX}{}", token_hex(16));
		let record = AuthorizationCode {
			code: new_code.clone(),
			client_id: pending.client_id.clone(),
			redirect_uri: pending.redirect_uri.clone(),
			redirect_uri_provided_explicitly: pending.redirect_uri_provided_explicitly,
			expires_at: Utc::now().timestamp() + AUTHORIZATION_CODE_TTL.as_secs() as i64,
			scopes: vec![self.settings.mcp_scope.clone()],
			code_challenge: pending.code_challenge,
			code_challenge_method: pending.code_challenge_method,
		};

		{
			let mut store = self.state.write().await;

			store.auth_codes.insert(new_code.clone(), record);
			store.insert_upstream(AccessToken {
				token: upstream.clone(),
				client_id: pending.client_id.clone(),
				scopes: vec![self.settings.provider_scope.clone()],
				expires_at: None,
			});
			store.token_mapping.insert(new_code.clone(), upstream.clone());
			store.jwt_mapping.insert(new_code.clone(), upstream);
		}

		let mut redirect = pending.redirect_uri;

		redirect.query_pairs_mut().append_pair("code", &new_code).append_pair("state", state);

		tracing::info!(client_id = %pending.client_id, "issued MCP authorization code");
		metrics::record_oauth_exchange("callback", true);

		Ok(redirect.into())
	}

	/// Return a pending authorization code issued to `client`, if it has not expired.
	pub async fn load_authorization_code(
		&self,
		client: &ClientRecord,
		code: &str,
	) -> Option<AuthorizationCode> {
		let now = Utc::now().timestamp();

		self.state
			.read()
			.await
			.auth_codes
			.get(code)
			.filter(|record| record.client_id == client.client_id && !record.is_expired(now))
			.cloned()
	}

	/// Trade an authorization code for an MCP access token.
	///
	/// Codes are single use. Expired codes are discarded and reported as invalid; a code issued
	/// to another client is rejected without being consumed.
	pub async fn exchange_authorization_code(
		&self,
		client: &ClientRecord,
		code: &str,
	) -> Result<OAuthToken> {
		let now = Utc::now().timestamp();
		let mut state = self.state.write().await;
		let Some(record) = state.auth_codes.get(code).cloned() else {
			tracing::error!("authorization code not found");
			metrics::record_oauth_exchange("exchange", false);

			return Err(Error::InvalidAuthorizationCode);
		};

		if record.is_expired(now) {
			tracing::warn!(expires_at = record.expires_at, "authorization code expired");

			state.discard_code(code);
			metrics::record_oauth_exchange("exchange", false);

			return Err(Error::InvalidAuthorizationCode);
		}
		if record.client_id != client.client_id {
			tracing::error!(
				expected = %record.client_id,
				actual = %client.client_id,
				"authorization code presented by another client"
			);
			metrics::record_oauth_exchange("exchange", false);

			return Err(Error::InvalidAuthorizationCode);
		}

		let mcp_token = format!("{MCP_TOKEN_PREFIX}{}", token_hex(32));

		state.auth_codes.remove(code);
		state.tokens.insert(
			mcp_token.clone(),
			AccessToken {
				token: mcp_token.clone(),
				client_id: client.client_id.clone(),
				scopes: record.scopes.clone(),
				expires_at: Some(now + ACCESS_TOKEN_TTL.as_secs() as i64),
			},
		);

		let recorded = state.token_mapping.remove(code);
		let upstream = match recorded {
			Some(upstream) if state.tokens.contains_key(&upstream_key(&upstream)) => Some(upstream),
			_ => state.first_upstream_for(&client.client_id),
		};

		match upstream {
			Some(upstream) => {
				state.token_mapping.insert(mcp_token.clone(), upstream);
			},
			None => tracing::warn!(client_id = %client.client_id, "no upstream token found for client"),
		}

		if let Some(jwt) = state.jwt_mapping.remove(code) {
			state.jwt_mapping.insert(mcp_token.clone(), jwt);
		}

		drop(state);

		tracing::info!(client_id = %client.client_id, "exchanged authorization code for MCP token");
		metrics::record_oauth_exchange("exchange", true);

		Ok(OAuthToken {
			access_token: mcp_token,
			token_type: "Bearer".into(),
			expires_in: Some(ACCESS_TOKEN_TTL.as_secs()),
			scope: Some(record.scopes.join(" ")),
			refresh_token: None,
		})
	}

	/// Return a stored token, removing it if it has expired.
	pub async fn load_access_token(&self, token: &str) -> Option<AccessToken> {
		let now = Utc::now().timestamp();
		let mut state = self.state.write().await;
		let Some(access) = state.tokens.get(token).cloned() else {
			tracing::debug!("access token not found");

			return None;
		};

		if access.is_expired(now) {
			tracing::warn!(expires_at = ?access.expires_at, "access token expired");

			state.forget_token(token);

			return None;
		}

		Some(access)
	}

	/// Refresh tokens are never issued.
	pub async fn load_refresh_token(
		&self,
		_client: &ClientRecord,
		_refresh_token: &str,
	) -> Option<String> {
		None
	}

	/// Refresh tokens are never issued, so exchanging one always fails.
	pub async fn exchange_refresh_token(
		&self,
		_client: &ClientRecord,
		_refresh_token: &str,
		_scopes: &[String],
	) -> Result<OAuthToken> {
		Err(Error::Unsupported("refresh tokens"))
	}

	/// Forget a token and its mappings. Unknown tokens are ignored.
	pub async fn revoke_token(&self, token: &str) {
		self.state.write().await.forget_token(token);
	}

	/// Downstream JWT recorded for an MCP token.
	pub async fn get_instana_jwt_token(&self, mcp_token: &str) -> Option<String> {
		self.state.read().await.jwt_mapping.get(mcp_token).cloned()
	}

	/// Upstream token recorded for an MCP token.
	pub async fn get_upstream_token(&self, mcp_token: &str) -> Option<String> {
		self.state.read().await.token_mapping.get(mcp_token).cloned()
	}

	#[tracing::instrument(skip_all, fields(token_url = %self.settings.token_url))]
	async fn exchange_upstream_code(&self, code: &str) -> Result<String> {
		let response = self
			.client
			.post(self.settings.token_url.as_str())
			.header(ACCEPT, "application/json")
			.form(&[
				("client_id", self.settings.client_id.as_str()),
				("client_secret", self.settings.client_secret.as_str()),
				("code", code),
				("redirect_uri", self.settings.callback_path.as_str()),
				("grant_type", "authorization_code"),
			])
			.send()
			.await?;
		let status = response.status();

		if status != StatusCode::OK {
			let body = response.text().await.unwrap_or_default();

			tracing::error!(%status, body = %body, "failed to exchange code for token");

			return Err(Error::UpstreamOAuth(format!(
				"Failed to exchange code for token (status {status})."
			)));
		}

		let data: Map<String, Value> = response.json().await?;

		if let Some(error) = data.get("error") {
			let description = data
				.get("error_description")
				.and_then(Value::as_str)
				.or_else(|| error.as_str())
				.unwrap_or("unknown error");

			tracing::error!(error = %description, "upstream OAuth error");

			return Err(Error::UpstreamOAuth(description.to_owned()));
		}

		let token = ["id_token", "access_token"]
			.iter()
			.filter_map(|field| data.get(*field).and_then(Value::as_str))
			.find(|token| !token.is_empty())
			.ok_or(Error::MissingUpstreamToken)?;

		tracing::debug!(token_len = token.len(), "received upstream token");

		Ok(token.to_owned())
	}
}

#[derive(Debug, Default)]
struct ProviderState {
	clients: HashMap<String, ClientRecord>,
	auth_codes: HashMap<String, AuthorizationCode>,
	tokens: HashMap<String, AccessToken>,
	upstream_order: Vec<String>,
	state_mapping: HashMap<String, PendingAuthorization>,
	token_mapping: HashMap<String, String>,
	jwt_mapping: HashMap<String, String>,
}
impl ProviderState {
	fn insert_upstream(&mut self, token: AccessToken) {
		let key = upstream_key(&token.token);

		if self.tokens.insert(key.clone(), token).is_none() {
			self.upstream_order.push(key);
		}
	}

	fn first_upstream_for(&self, client_id: &str) -> Option<String> {
		self.upstream_order
			.iter()
			.filter_map(|key| self.tokens.get(key))
			.find(|token| token.client_id == client_id)
			.map(|token| token.token.clone())
	}

	fn remove_token(&mut self, key: &str) {
		if self.tokens.remove(key).is_some() && key.starts_with(UPSTREAM_TOKEN_PREFIX) {
			self.upstream_order.retain(|existing| existing != key);
		}
	}

	fn forget_token(&mut self, token: &str) {
		self.remove_token(token);
		self.jwt_mapping.remove(token);
		self.token_mapping.remove(token);
	}

	fn discard_code(&mut self, code: &str) {
		self.auth_codes.remove(code);
		self.token_mapping.remove(code);
		self.jwt_mapping.remove(code);
	}
}

#[cfg(test)]
impl SimpleOAuthProvider {
	/// Store an MCP token and its downstream JWT directly.
	pub(crate) async fn insert_mcp_token(&self, token: AccessToken, jwt: &str) {
		let mut state = self.state.write().await;

		state.jwt_mapping.insert(token.token.clone(), jwt.to_owned());
		state.token_mapping.insert(token.token.clone(), jwt.to_owned());
		state.tokens.insert(token.token.clone(), token);
	}
}

#[derive(Debug)]
struct PendingAuthorization {
	client_id: String,
	redirect_uri: Url,
	redirect_uri_provided_explicitly: bool,
	code_challenge: Option<String>,
	code_challenge_method: CodeChallengeMethod,
}

fn upstream_key(token: &str) -> String {
	format!("{UPSTREAM_TOKEN_PREFIX}{token}")
}
