//! Integration tests against mocked identity, token, and downstream servers.

mod dynamic_token;
mod oauth_flow;
mod session_login;
