//! Bearer JWT validation and downstream credential extraction.
//!
//! A [`TokenVerifier`] checks signature, expiry, audience, issued-at, and required scopes against
//! either a static key or a JWKS endpoint. Validation never returns an error: the outcome is
//! reported as a [`VerificationResult`] so callers can log it and move on.

pub mod jwks;

pub use jwks::JwksCache;

// std
use std::fmt::{Display, Formatter, Result as FmtResult};
// crates.io
use http::{HeaderMap, header::AUTHORIZATION};
use jsonwebtoken::{
	Algorithm, DecodingKey, Header, Validation,
	errors::{Error as JwtError, ErrorKind},
};
use reqwest::Client;
use serde::Serialize;
use serde_json::{Map, Value};
use url::Url;
// self
use crate::{_prelude::*, config::JwtSettings, metrics};

/// Claims that may carry the downstream API token, in priority order.
pub const TOKEN_CLAIMS: [&str; 2] = ["instana_token", "instana_api_token"];
/// Claims that may carry the downstream base URL, in priority order.
pub const BASE_URL_CLAIMS: [&str; 2] = ["instana_base_url", "instana_url"];
/// Client id reported for access resolved from a bearer JWT.
pub const JWT_CLIENT_ID: &str = "instana-mcp-client";

/// Decoded JWT payload.
pub type Claims = Map<String, Value>;

/// Why a token was rejected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationFailure {
	/// The `exp` claim is in the past.
	Expired,
	/// The `aud` claim does not match the configured audience.
	InvalidAudience {
		/// Configured audience.
		expected: Option<String>,
	},
	/// The signature does not verify against the selected key.
	InvalidSignature,
	/// The token is malformed or carries an invalid claim.
	InvalidToken(String),
	/// The `scope` claim lacks one or more required scopes.
	MissingScopes(Vec<String>),
	/// The token's `kid` is absent from the JWKS document.
	KeyNotFound(Option<String>),
	/// Key material could not be loaded, or another unexpected failure occurred.
	Unexpected(String),
}
impl ValidationFailure {
	/// Stable label used for metrics.
	pub fn label(&self) -> &'static str {
		match self {
			Self::Expired => "expired",
			Self::InvalidAudience { .. } => "invalid_audience",
			Self::InvalidSignature => "invalid_signature",
			Self::InvalidToken(_) => "invalid_token",
			Self::MissingScopes(_) => "missing_scopes",
			Self::KeyNotFound(_) => "key_not_found",
			Self::Unexpected(_) => "error",
		}
	}
}
impl Display for ValidationFailure {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		match self {
			Self::Expired => write!(f, "Token has expired"),
			Self::InvalidAudience { expected } =>
				write!(f, "Invalid audience. Expected: {}", expected.as_deref().unwrap_or("none")),
			Self::InvalidSignature => write!(f, "Invalid token signature"),
			Self::InvalidToken(reason) => write!(f, "Invalid token: {reason}"),
			Self::MissingScopes(required) => write!(f, "Missing required scopes: {required:?}"),
			Self::KeyNotFound(kid) =>
				write!(f, "Signing key {} not found in JWKS", kid.as_deref().unwrap_or("<none>")),
			Self::Unexpected(reason) => write!(f, "Validation error: {reason}"),
		}
	}
}

/// Outcome of [`TokenVerifier::validate_jwt_token`].
///
/// Claims are populated whenever the token decoded, including when scope checks fail.
#[derive(Clone, Debug, Default)]
pub struct VerificationResult {
	/// Whether every check passed.
	pub valid: bool,
	/// Decoded claims, empty when decoding failed.
	pub claims: Claims,
	/// Failure reason when `valid` is false.
	pub error: Option<ValidationFailure>,
}
impl VerificationResult {
	fn success(claims: Claims) -> Self {
		Self { valid: true, claims, error: None }
	}

	fn failure(error: ValidationFailure) -> Self {
		Self { valid: false, claims: Claims::new(), error: Some(error) }
	}

	fn failure_with_claims(error: ValidationFailure, claims: Claims) -> Self {
		Self { valid: false, claims, error: Some(error) }
	}

	/// Human-readable failure message.
	pub fn error_message(&self) -> Option<String> {
		self.error.as_ref().map(ToString::to_string)
	}

	fn outcome(&self) -> &'static str {
		self.error.as_ref().map(ValidationFailure::label).unwrap_or("valid")
	}
}

/// Downstream API credentials carried inside a token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InstanaCredentials {
	/// Downstream API token.
	pub token: String,
	/// Downstream base URL.
	pub base_url: String,
}

/// Access granted to a validated bearer JWT.
#[derive(Clone, Debug, Serialize)]
pub struct VerifiedAccess {
	/// The raw bearer token.
	pub token: String,
	/// Client id the access is attributed to.
	pub client_id: String,
	/// Scopes from the `scope` claim.
	pub scopes: Vec<String>,
	/// Expiry from the `exp` claim, in seconds since the epoch.
	pub expires_at: Option<i64>,
	/// Downstream credentials extracted from the claims.
	pub credentials: InstanaCredentials,
}

/// Validates bearer JWTs against a static key or a JWKS endpoint.
#[derive(Debug)]
pub struct TokenVerifier {
	key_source: KeySource,
	audience: Option<String>,
	algorithm: Algorithm,
	required_scopes: Vec<String>,
}
impl TokenVerifier {
	/// Build a verifier; a JWKS URI takes precedence over a static key.
	pub fn new(settings: JwtSettings) -> Result<Self> {
		let key_source = KeySource::resolve(&settings, JwksCache::new)?;

		Ok(Self::with_key_source(settings, key_source))
	}

	/// Build a verifier whose JWKS fetches go through the supplied client.
	pub fn with_client(settings: JwtSettings, client: Client) -> Result<Self> {
		let key_source =
			KeySource::resolve(&settings, |uri| Ok(JwksCache::with_client(uri, client)))?;

		Ok(Self::with_key_source(settings, key_source))
	}

	/// Build a verifier around an existing JWKS cache.
	pub fn with_jwks_cache(settings: JwtSettings, cache: JwksCache) -> Self {
		Self::with_key_source(settings, KeySource::Jwks(cache))
	}

	fn with_key_source(settings: JwtSettings, key_source: KeySource) -> Self {
		Self {
			key_source,
			audience: settings.audience,
			algorithm: settings.algorithm,
			required_scopes: settings.required_scopes,
		}
	}

	/// Build a verifier from `FASTMCP_AUTH_JWT_*` variables.
	///
	/// Returns `None` when JWT validation is disabled or no key source is configured.
	pub fn from_env() -> Result<Option<Self>> {
		let settings = JwtSettings::from_env()?;

		if !settings.enabled {
			return Ok(None);
		}
		if let Err(err) = settings.validate() {
			tracing::error!(error = %err, "JWT authentication enabled without a key source");

			return Ok(None);
		}
		if settings.audience.is_none() {
			tracing::warn!("JWT audience not configured; audience validation is disabled");
		}

		tracing::info!(
			algorithm = ?settings.algorithm,
			jwks = settings.jwks_uri.is_some(),
			required_scopes = ?settings.required_scopes,
			"JWT authentication enabled"
		);

		Self::new(settings).map(Some)
	}

	/// Accepted signature algorithm.
	pub fn algorithm(&self) -> Algorithm {
		self.algorithm
	}

	/// Expected audience, if any.
	pub fn audience(&self) -> Option<&str> {
		self.audience.as_deref()
	}

	/// Scopes every token must carry.
	pub fn required_scopes(&self) -> &[String] {
		&self.required_scopes
	}

	/// Validate a token and report the outcome.
	#[tracing::instrument(skip_all)]
	pub async fn validate_jwt_token(&self, token: &str) -> VerificationResult {
		let result = match self.decode(token).await {
			Ok(claims) => self.check_scopes(claims),
			Err(failure) => VerificationResult::failure(failure),
		};

		match &result.error {
			None => tracing::debug!("JWT validated"),
			Some(failure) => tracing::warn!(reason = %failure, "JWT rejected"),
		}

		metrics::record_jwt_validation(result.outcome());

		result
	}

	/// Extract downstream credentials from validated claims.
	///
	/// Both a token and a base URL must be present; partial credentials yield `None`.
	pub fn get_instana_credentials_from_jwt(claims: &Claims) -> Option<InstanaCredentials> {
		let token = first_claim(claims, &TOKEN_CLAIMS);
		let base_url = first_claim(claims, &BASE_URL_CLAIMS);

		match (token, base_url) {
			(Some(token), Some(base_url)) =>
				Some(InstanaCredentials { token: token.to_owned(), base_url: base_url.to_owned() }),
			(token, base_url) => {
				tracing::warn!(
					has_token = token.is_some(),
					has_base_url = base_url.is_some(),
					"JWT lacks downstream credentials"
				);

				None
			},
		}
	}

	/// Resolve a bearer JWT into access carrying downstream credentials.
	pub async fn load_access_token(&self, token: &str) -> Option<VerifiedAccess> {
		let result = self.validate_jwt_token(token).await;

		if !result.valid {
			tracing::error!(reason = ?result.error_message(), "bearer JWT failed validation");

			return None;
		}

		let credentials = Self::get_instana_credentials_from_jwt(&result.claims)?;
		let scopes = result
			.claims
			.get("scope")
			.and_then(Value::as_str)
			.map(|scope| scope.split_whitespace().map(str::to_owned).collect())
			.unwrap_or_default();
		let expires_at = result.claims.get("exp").and_then(Value::as_i64);

		Some(VerifiedAccess {
			token: token.to_owned(),
			client_id: JWT_CLIENT_ID.into(),
			scopes,
			expires_at,
			credentials,
		})
	}

	async fn decode(&self, token: &str) -> std::result::Result<Claims, ValidationFailure> {
		let header = jsonwebtoken::decode_header(token).map_err(|err| self.classify(err))?;
		let key = self.verification_key(&header).await?;
		let data = jsonwebtoken::decode::<Claims>(token, &key, &self.validation())
			.map_err(|err| self.classify(err))?;

		check_issued_at(&data.claims)?;

		Ok(data.claims)
	}

	async fn verification_key(
		&self,
		header: &Header,
	) -> std::result::Result<DecodingKey, ValidationFailure> {
		match &self.key_source {
			KeySource::Static(material) => static_key(self.algorithm, material)
				.map_err(|err| ValidationFailure::Unexpected(err.to_string())),
			KeySource::Jwks(cache) => {
				let jwk = match header.kid.as_deref() {
					Some(kid) => cache.get(kid).await,
					None => None,
				};
				let Some(jwk) = jwk else {
					tracing::error!(kid = ?header.kid, uri = %cache.uri(), "signing key not found in JWKS");

					return Err(ValidationFailure::KeyNotFound(header.kid.clone()));
				};

				DecodingKey::from_jwk(&jwk).map_err(|err| ValidationFailure::Unexpected(err.to_string()))
			},
		}
	}

	fn validation(&self) -> Validation {
		let mut validation = Validation::new(self.algorithm);

		validation.leeway = 0;
		validation.required_spec_claims.clear();

		match &self.audience {
			Some(audience) => validation.set_audience(&[audience]),
			None => validation.validate_aud = false,
		}

		validation
	}

	fn classify(&self, err: JwtError) -> ValidationFailure {
		match err.kind() {
			ErrorKind::ExpiredSignature => ValidationFailure::Expired,
			ErrorKind::InvalidAudience =>
				ValidationFailure::InvalidAudience { expected: self.audience.clone() },
			ErrorKind::InvalidSignature => ValidationFailure::InvalidSignature,
			ErrorKind::InvalidKeyFormat | ErrorKind::InvalidRsaKey(_) | ErrorKind::InvalidEcdsaKey =>
				ValidationFailure::Unexpected(err.to_string()),
			_ => ValidationFailure::InvalidToken(err.to_string()),
		}
	}

	fn check_scopes(&self, claims: Claims) -> VerificationResult {
		if self.required_scopes.is_empty() {
			return VerificationResult::success(claims);
		}

		let granted: Vec<&str> = claims
			.get("scope")
			.and_then(Value::as_str)
			.map(|scope| scope.split_whitespace().collect())
			.unwrap_or_default();

		if self.required_scopes.iter().all(|required| granted.contains(&required.as_str())) {
			VerificationResult::success(claims)
		} else {
			VerificationResult::failure_with_claims(
				ValidationFailure::MissingScopes(self.required_scopes.clone()),
				claims,
			)
		}
	}
}

#[derive(Debug)]
enum KeySource {
	Static(String),
	Jwks(JwksCache),
}
impl KeySource {
	fn resolve<F>(settings: &JwtSettings, jwks: F) -> Result<Self>
	where
		F: FnOnce(Url) -> Result<JwksCache>,
	{
		match (&settings.jwks_uri, &settings.public_key) {
			(Some(uri), _) => Ok(Self::Jwks(jwks(uri.clone())?)),
			(None, Some(key)) => Ok(Self::Static(key.clone())),
			(None, None) => Err(Error::Config {
				field: "public_key",
				reason: "No verification key configured.".into(),
			}),
		}
	}
}

/// Extract the bearer token from an `Authorization: Bearer <token>` header.
pub fn extract_jwt_token(headers: &HeaderMap) -> Option<&str> {
	headers
		.get(AUTHORIZATION)?
		.to_str()
		.ok()?
		.strip_prefix("Bearer ")
		.filter(|token| !token.is_empty())
}

fn static_key(algorithm: Algorithm, material: &str) -> jsonwebtoken::errors::Result<DecodingKey> {
	match algorithm {
		Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 =>
			Ok(DecodingKey::from_secret(material.as_bytes())),
		Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(material.as_bytes()),
		Algorithm::EdDSA => DecodingKey::from_ed_pem(material.as_bytes()),
		_ => DecodingKey::from_rsa_pem(material.as_bytes()),
	}
}

fn check_issued_at(claims: &Claims) -> std::result::Result<(), ValidationFailure> {
	match claims.get("iat") {
		None => Ok(()),
		Some(Value::Number(iat)) => {
			let iat = iat.as_f64().unwrap_or(f64::MAX);

			if iat > Utc::now().timestamp() as f64 {
				Err(ValidationFailure::InvalidToken("The token is not yet valid (iat)".into()))
			} else {
				Ok(())
			}
		},
		Some(_) =>
			Err(ValidationFailure::InvalidToken("Issued At claim (iat) must be an integer.".into())),
	}
}

fn first_claim<'a>(claims: &'a Claims, names: &[&str]) -> Option<&'a str> {
	names
		.iter()
		.filter_map(|name| claims.get(*name).and_then(Value::as_str))
		.find(|value| !value.is_empty())
}
