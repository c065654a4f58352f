//! Credential and token mediation for the Instana MCP server: JWT/JWKS validation, dynamic
//! downstream token refresh, session-cookie login, an OAuth broker, and per-request arbitration
//! between HTTP-header and stdio credentials.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod arbitration;
pub mod config;
pub mod dynamic;
pub mod metrics;
pub mod oauth;
pub mod verifier;

mod error;
mod _prelude {
	pub use std::{collections::HashMap, sync::Arc, time::Duration};

	pub use chrono::Utc;
	pub use tokio::time::Instant;

	pub use crate::{Error, Result};
}

#[cfg(feature = "prometheus")] pub use crate::metrics::install_default_exporter;
pub use crate::{
	arbitration::{AuthContext, CredentialResolution, ErrorPayload},
	dynamic::{DynamicTokenClient, DynamicTokenManager},
	error::{Error, Result},
	oauth::SimpleOAuthProvider,
	verifier::TokenVerifier,
};
