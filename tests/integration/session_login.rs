//! Session-cookie login against a mocked login endpoint.

// crates.io
use http::{Method, StatusCode};
use instana_mcp_auth::{
	DynamicTokenManager, Error, Result, config::SessionSettings, dynamic::client::DEFAULT_TIMEOUT,
};
use wiremock::{
	Mock, MockServer, ResponseTemplate,
	matchers::{body_string_contains, header, method, path},
};

const LOGIN_PATH: &str = "/auth/login";

fn settings() -> SessionSettings {
	SessionSettings {
		auth_strategy: Some("jsessionid".into()),
		login_url: Some(LOGIN_PATH.into()),
		username: Some("operator".into()),
		password: Some("s3cret".into()),
	}
}

fn manager(server: &MockServer, settings: SessionSettings) -> DynamicTokenManager {
	DynamicTokenManager::new(&server.uri(), settings, DEFAULT_TIMEOUT).expect("manager")
}

#[tokio::test]
async fn login_yields_a_cookie_authenticated_client() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path(LOGIN_PATH))
		.and(header("content-type", "application/x-www-form-urlencoded"))
		.and(body_string_contains("username=operator"))
		.and(body_string_contains("password=s3cret"))
		.respond_with(
			ResponseTemplate::new(200)
				.append_header("set-cookie", "theme=dark; Path=/")
				.append_header("set-cookie", "JSESSIONID=session-42; Path=/; HttpOnly"),
		)
		.expect(1)
		.mount(&server)
		.await;
	Mock::given(method("GET"))
		.and(path("/api/application-monitoring/applications"))
		.and(header("cookie", "JSESSIONID=session-42"))
		.respond_with(ResponseTemplate::new(200))
		.expect(1)
		.mount(&server)
		.await;

	let session = manager(&server, settings()).authenticated_client().await?.expect("session");

	assert_eq!(session.session_id(), "session-42");

	let response =
		session.request(Method::GET, "/api/application-monitoring/applications")?.send().await?;

	assert_eq!(response.status(), StatusCode::OK);

	server.verify().await;

	Ok(())
}

#[tokio::test]
async fn rejected_logins_yield_no_client() -> Result<()> {
	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path(LOGIN_PATH))
		.respond_with(ResponseTemplate::new(401).set_body_string("bad credentials"))
		.expect(1)
		.mount(&server)
		.await;

	assert!(manager(&server, settings()).authenticated_client().await?.is_none());

	server.verify().await;

	Ok(())
}

#[tokio::test]
async fn successful_logins_without_a_session_cookie_fail() {
	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path(LOGIN_PATH))
		.respond_with(ResponseTemplate::new(200).append_header("set-cookie", "other=1"))
		.mount(&server)
		.await;

	let err = manager(&server, settings()).authenticated_client().await.expect_err("no cookie");

	assert!(matches!(err, Error::MissingSessionCookie));
}

#[tokio::test]
async fn missing_credentials_skip_the_login_request() -> Result<()> {
	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path(LOGIN_PATH))
		.respond_with(ResponseTemplate::new(200))
		.expect(0)
		.mount(&server)
		.await;

	let without_password = SessionSettings { password: None, ..settings() };
	let empty_username = SessionSettings { username: Some(String::new()), ..settings() };

	assert!(manager(&server, without_password).authenticated_client().await?.is_none());
	assert!(manager(&server, empty_username).authenticated_client().await?.is_none());

	server.verify().await;

	Ok(())
}

#[tokio::test]
async fn every_call_logs_in_again() -> Result<()> {
	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path(LOGIN_PATH))
		.respond_with(ResponseTemplate::new(200).append_header("set-cookie", "JSESSIONID=abc"))
		.expect(2)
		.mount(&server)
		.await;

	let manager = manager(&server, settings());

	assert!(manager.authenticated_client().await?.is_some());
	assert!(manager.authenticated_client().await?.is_some());

	server.verify().await;

	Ok(())
}
