//! Downstream bearer-token refresh against a mocked token endpoint.

// crates.io
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use instana_mcp_auth::{
	DynamicTokenClient, Error, Result, config::AuthData, dynamic::client::DEFAULT_TIMEOUT,
};
use serde_json::json;
use wiremock::{
	Mock, MockServer, ResponseTemplate,
	matchers::{body_json, body_string_contains, header, method, path},
};

const TOKEN_PATH: &str = "/api/iam/token";
const EVENTS_PATH: &str = "/api/events";

fn client(server: &MockServer, auth_data: AuthData) -> DynamicTokenClient {
	DynamicTokenClient::new(&format!("{}/api", server.uri()), Some(auth_data), DEFAULT_TIMEOUT)
		.expect("client")
}

fn iam_data() -> AuthData {
	AuthData { apikey: Some("key-1".into()), token_url: Some("/iam/token".into()), ..AuthData::default() }
}

async fn mount_events(server: &MockServer, token: &str, expected_calls: u64) {
	Mock::given(method("GET"))
		.and(path(EVENTS_PATH))
		.and(header("authorization", format!("Bearer {token}").as_str()))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "items": [] })))
		.expect(expected_calls)
		.mount(server)
		.await;
}

#[tokio::test]
async fn iam_grant_is_cached_until_renewal() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path(TOKEN_PATH))
		.and(body_string_contains("grant_type=urn%3Aibm%3Aparams%3Aoauth%3Agrant-type%3Aapikey"))
		.and(body_string_contains("apikey=key-1"))
		.respond_with(
			ResponseTemplate::new(200).set_body_json(json!({ "access_token": "t1", "expires_in": 3600 })),
		)
		.expect(1)
		.mount(&server)
		.await;
	mount_events(&server, "t1", 2).await;

	let client = client(&server, iam_data());

	assert_eq!(client.get("/events").await?.status(), StatusCode::OK);
	assert_eq!(client.get("events").await?.status(), StatusCode::OK);
	assert_eq!(client.cached_token().await.as_deref(), Some("t1"));
	assert!(client.expires_at().await.is_some());

	let stats = client.stats();

	assert_eq!(stats.refresh_successes, 1);
	assert_eq!(stats.refresh_errors, 0);
	assert!(stats.last_refresh_micros.is_some());

	server.verify().await;

	Ok(())
}

#[tokio::test]
async fn tokens_inside_the_refresh_buffer_are_renewed_every_request() -> Result<()> {
	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path(TOKEN_PATH))
		.respond_with(
			ResponseTemplate::new(200).set_body_json(json!({ "access_token": "t1", "expires_in": "60" })),
		)
		.expect(2)
		.mount(&server)
		.await;
	mount_events(&server, "t1", 2).await;

	let client = client(&server, iam_data());

	client.get("/events").await?;
	client.get("/events").await?;

	server.verify().await;

	Ok(())
}

#[tokio::test]
async fn tokens_in_error_responses_are_still_used() -> Result<()> {
	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path(TOKEN_PATH))
		.respond_with(
			ResponseTemplate::new(401).set_body_json(json!({ "access_token": "t1", "expires_in": 3600 })),
		)
		.expect(1)
		.mount(&server)
		.await;
	mount_events(&server, "t1", 1).await;

	let client = client(&server, iam_data());

	assert_eq!(client.get("/events").await?.status(), StatusCode::OK);

	server.verify().await;

	Ok(())
}

#[tokio::test]
async fn basic_method_sends_credentials_with_the_configured_verb() -> Result<()> {
	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path(TOKEN_PATH))
		.and(header("authorization", "Basic dXNlcjpwYXNz"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "basic-token" })))
		.expect(1)
		.mount(&server)
		.await;
	mount_events(&server, "basic-token", 1).await;

	let client = client(
		&server,
		AuthData {
			id: Some("user".into()),
			secret: Some("pass".into()),
			token_url: Some("/iam/token".into()),
			token_gen_auth_method: Some("basic".into()),
			token_gen_method: Some("POST".into()),
			..AuthData::default()
		},
	);

	client.get("/events").await?;

	server.verify().await;

	Ok(())
}

#[tokio::test]
async fn jwt_method_posts_the_apikey_as_json() -> Result<()> {
	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path(TOKEN_PATH))
		.and(header("accept", "application/json"))
		.and(body_json(json!({ "apikey": "key-1" })))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "access_token": "jwt-token" })))
		.expect(1)
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path(EVENTS_PATH))
		.and(header("authorization", "Bearer jwt-token"))
		.and(header("content-type", "application/json"))
		.and(body_json(json!({ "query": "all" })))
		.respond_with(ResponseTemplate::new(201))
		.expect(1)
		.mount(&server)
		.await;

	let client =
		client(&server, AuthData { token_gen_auth_method: Some("jwt".into()), ..iam_data() });
	let response = client.post_json("/events", &json!({ "query": "all" })).await?;

	assert_eq!(response.status(), StatusCode::CREATED);

	server.verify().await;

	Ok(())
}

#[tokio::test]
async fn failed_refresh_clears_the_cache_and_counts_the_error() {
	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path(TOKEN_PATH))
		.respond_with(ResponseTemplate::new(500).set_body_string("boom"))
		.mount(&server)
		.await;

	let client = client(&server, iam_data());
	let err = client.get("/events").await.expect_err("refresh must fail");

	assert!(matches!(err, Error::HttpStatus { status, .. } if status == StatusCode::INTERNAL_SERVER_ERROR));
	assert!(client.cached_token().await.is_none());
	assert_eq!(client.stats().refresh_errors, 1);
}

#[tokio::test]
async fn successful_responses_without_a_token_fail_the_refresh() {
	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path(TOKEN_PATH))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "expires_in": 3600 })))
		.mount(&server)
		.await;

	let err = client(&server, iam_data()).access_token().await.expect_err("refresh must fail");

	assert!(matches!(err, Error::TokenRefresh(_)));
}

#[tokio::test]
async fn requests_to_the_token_endpoint_skip_injection() -> Result<()> {
	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path(TOKEN_PATH))
		.and(header("x-trace", "1"))
		.respond_with(ResponseTemplate::new(204))
		.expect(1)
		.mount(&server)
		.await;

	let mut defaults = HeaderMap::new();

	defaults.insert("x-trace", HeaderValue::from_static("1"));

	let client = client(&server, iam_data()).with_headers(defaults);
	let response = client.send(Method::GET, "/iam/token", &HeaderMap::new(), None).await?;

	assert_eq!(response.status(), StatusCode::NO_CONTENT);
	assert!(client.cached_token().await.is_none());
	assert_eq!(client.stats().attempts(), 0);

	let requests = server.received_requests().await.expect("recording enabled");

	assert!(requests.iter().all(|request| !request.headers.contains_key("authorization")));

	Ok(())
}
