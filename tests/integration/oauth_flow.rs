//! Full OAuth broker flow against a mocked upstream authorization server.

// std
use std::collections::HashMap;
// crates.io
use instana_mcp_auth::{
	Error, Result, SimpleOAuthProvider,
	config::OAuthSettings,
	oauth::{AuthorizationParams, ClientRecord, CodeChallengeMethod, s256_challenge},
};
use serde_json::json;
use url::Url;
use wiremock::{
	Mock, MockServer, ResponseTemplate,
	matchers::{body_string_contains, method, path},
};

const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

pub fn oauth_settings(server: &MockServer) -> OAuthSettings {
	OAuthSettings {
		enabled: true,
		host: "localhost".into(),
		port: "8080".into(),
		server_url: Url::parse("http://localhost:8080").expect("url"),
		client_id: "upstream-client".into(),
		client_secret: "upstream-secret".into(),
		callback_path: "http://localhost:8080/auth/callback".into(),
		auth_url: format!("{}/authorize", server.uri()),
		token_url: format!("{}/token", server.uri()),
		mcp_scope: "user".into(),
		provider_scope: "openid".into(),
	}
}

pub fn mcp_client(client_id: &str) -> ClientRecord {
	ClientRecord::new(client_id)
		.with_redirect_uri(Url::parse("http://localhost:3000/callback").expect("url"))
}

pub async fn mount_upstream_token(server: &MockServer, code: &str, id_token: &str) {
	Mock::given(method("POST"))
		.and(path("/token"))
		.and(body_string_contains(format!("code={code}").as_str()))
		.and(body_string_contains("grant_type=authorization_code"))
		.and(body_string_contains("client_secret=upstream-secret"))
		.respond_with(
			ResponseTemplate::new(200)
				.set_body_json(json!({ "id_token": id_token, "access_token": "opaque-upstream" })),
		)
		.mount(server)
		.await;
}

/// Drive authorize and callback, returning the local authorization code.
pub async fn authorize_and_callback(
	provider: &SimpleOAuthProvider,
	client: &ClientRecord,
	state: &str,
	upstream_code: &str,
) -> Result<String> {
	let params = AuthorizationParams::new(client.redirect_uris[0].clone())
		.state(state)
		.code_challenge(s256_challenge(VERIFIER), CodeChallengeMethod::S256);

	provider.authorize(client, params).await?;

	let redirect = provider.handle_callback(upstream_code, state).await?;
	let pairs: HashMap<String, String> =
		Url::parse(&redirect)?.query_pairs().into_owned().collect();

	assert!(redirect.starts_with("http://localhost:3000/callback?"));
	assert_eq!(pairs["state"], state);

	Ok(pairs["code"].clone())
}

#[tokio::test]
async fn completes_the_brokered_flow() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;

	mount_upstream_token(&server, "upstream-code", "upstream-jwt").await;

	let provider = SimpleOAuthProvider::new(oauth_settings(&server))?;
	let client = mcp_client("mcp-client");

	provider.register_client(client.clone()).await;

	let code = authorize_and_callback(&provider, &client, "state-1", "upstream-code").await?;
	let pending = provider.load_authorization_code(&client, &code).await.expect("pending code");

	assert!(code.starts_with("mcp_"));
	assert!(pending.verify_code_verifier(VERIFIER));
	assert!(!pending.verify_code_verifier("another-verifier"));
	assert!(provider.load_authorization_code(&mcp_client("intruder"), &code).await.is_none());

	let token = provider.exchange_authorization_code(&client, &code).await?;

	assert!(token.access_token.starts_with("mcp_"));
	assert_eq!(token.token_type, "Bearer");
	assert_eq!(token.expires_in, Some(3600));
	assert_eq!(token.scope.as_deref(), Some("user"));
	assert!(token.refresh_token.is_none());
	assert_eq!(
		provider.get_instana_jwt_token(&token.access_token).await.as_deref(),
		Some("upstream-jwt")
	);
	assert_eq!(
		provider.get_upstream_token(&token.access_token).await.as_deref(),
		Some("upstream-jwt")
	);

	let access = provider.load_access_token(&token.access_token).await.expect("access token");

	assert_eq!(access.client_id, "mcp-client");
	assert_eq!(access.scopes, vec!["user"]);
	assert!(matches!(
		provider.exchange_authorization_code(&client, &code).await,
		Err(Error::InvalidAuthorizationCode)
	));

	provider.revoke_token(&token.access_token).await;
	provider.revoke_token(&token.access_token).await;

	assert!(provider.load_access_token(&token.access_token).await.is_none());
	assert!(provider.get_instana_jwt_token(&token.access_token).await.is_none());
	assert!(provider.get_upstream_token(&token.access_token).await.is_none());

	Ok(())
}

#[tokio::test]
async fn client_redirects_keep_their_query_parameters() -> Result<()> {
	let server = MockServer::start().await;

	mount_upstream_token(&server, "upstream-code", "upstream-jwt").await;

	let provider = SimpleOAuthProvider::new(oauth_settings(&server))?;
	let client = ClientRecord::new("mcp-client")
		.with_redirect_uri(Url::parse("http://localhost:3000/callback?session=abc&tab=1")?);
	let params = AuthorizationParams::new(client.redirect_uris[0].clone()).state("state-q");

	provider.authorize(&client, params).await?;

	let redirect = Url::parse(&provider.handle_callback("upstream-code", "state-q").await?)?;
	let pairs: Vec<(String, String)> = redirect.query_pairs().into_owned().collect();

	assert_eq!(redirect.path(), "/callback");
	assert_eq!(pairs[0], ("session".into(), "abc".into()));
	assert_eq!(pairs[1], ("tab".into(), "1".into()));
	assert_eq!(pairs[2].0, "code");
	assert!(pairs[2].1.starts_with("mcp_"));
	assert_eq!(pairs[3], ("state".into(), "state-q".into()));
	assert_eq!(pairs.len(), 4);

	Ok(())
}

#[tokio::test]
async fn state_values_are_single_use() -> Result<()> {
	let server = MockServer::start().await;

	mount_upstream_token(&server, "upstream-code", "upstream-jwt").await;

	let provider = SimpleOAuthProvider::new(oauth_settings(&server))?;
	let client = mcp_client("mcp-client");

	authorize_and_callback(&provider, &client, "state-1", "upstream-code").await?;

	assert!(matches!(
		provider.handle_callback("upstream-code", "state-1").await,
		Err(Error::InvalidState)
	));

	Ok(())
}

#[tokio::test]
async fn codes_presented_by_another_client_are_not_consumed() -> Result<()> {
	let server = MockServer::start().await;

	mount_upstream_token(&server, "upstream-code", "upstream-jwt").await;

	let provider = SimpleOAuthProvider::new(oauth_settings(&server))?;
	let client = mcp_client("mcp-client");
	let code = authorize_and_callback(&provider, &client, "state-1", "upstream-code").await?;

	assert!(matches!(
		provider.exchange_authorization_code(&mcp_client("intruder"), &code).await,
		Err(Error::InvalidAuthorizationCode)
	));
	assert!(provider.exchange_authorization_code(&client, &code).await.is_ok());

	Ok(())
}

#[tokio::test]
async fn upstream_failures_abort_the_callback() -> Result<()> {
	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path("/token"))
		.and(body_string_contains("code=rejected"))
		.respond_with(ResponseTemplate::new(400).set_body_json(json!({ "error": "invalid_grant" })))
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path("/token"))
		.and(body_string_contains("code=denied"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"error": "access_denied",
			"error_description": "User denied access"
		})))
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path("/token"))
		.and(body_string_contains("code=empty"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token_type": "bearer" })))
		.mount(&server)
		.await;

	let provider = SimpleOAuthProvider::new(oauth_settings(&server))?;
	let client = mcp_client("mcp-client");

	for state in ["s-rejected", "s-denied", "s-empty"] {
		let params = AuthorizationParams::new(client.redirect_uris[0].clone()).state(state);

		provider.authorize(&client, params).await?;
	}

	let rejected = provider.handle_callback("rejected", "s-rejected").await;
	let denied = provider.handle_callback("denied", "s-denied").await;
	let empty = provider.handle_callback("empty", "s-empty").await;

	assert!(matches!(rejected, Err(Error::UpstreamOAuth(_))));
	assert!(matches!(
		denied,
		Err(Error::UpstreamOAuth(ref description)) if description == "User denied access"
	));
	assert!(matches!(empty, Err(Error::MissingUpstreamToken)));
	assert!(matches!(
		provider.handle_callback("rejected", "s-rejected").await,
		Err(Error::InvalidState)
	));

	Ok(())
}
