//! Metrics helpers and per-client refresh bookkeeping.
//!
//! The `record_*` helpers emit through the `metrics` facade when the `metrics` feature is enabled
//! and compile to no-ops otherwise. [`RefreshStats`] is always available.

// std
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "prometheus")] use std::sync::OnceLock;
// crates.io
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
// self
use crate::_prelude::*;

#[cfg(feature = "metrics")]
const METRIC_JWT_VALIDATIONS_TOTAL: &str = "instana_auth_jwt_validations_total";
#[cfg(feature = "metrics")]
const METRIC_TOKEN_REFRESH_TOTAL: &str = "instana_auth_token_refresh_total";
#[cfg(feature = "metrics")]
const METRIC_TOKEN_REFRESH_DURATION: &str = "instana_auth_token_refresh_duration_seconds";
#[cfg(feature = "metrics")]
const METRIC_SESSION_LOGINS_TOTAL: &str = "instana_auth_session_login_total";
#[cfg(feature = "metrics")]
const METRIC_OAUTH_EXCHANGES_TOTAL: &str = "instana_auth_oauth_exchanges_total";

/// Shared Prometheus handle installed by [`install_default_exporter`].
#[cfg(feature = "prometheus")]
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Thread-safe refresh accumulator for a single dynamic token client.
#[derive(Debug, Default)]
pub struct RefreshStats {
	refresh_successes: AtomicU64,
	refresh_errors: AtomicU64,
	last_refresh_micros: AtomicU64,
}
impl RefreshStats {
	/// Create a new accumulator.
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Record a successful refresh and its latency.
	pub fn record_success(&self, duration: Duration) {
		self.refresh_successes.fetch_add(1, Ordering::Relaxed);
		self.last_refresh_micros.store(duration.as_micros() as u64, Ordering::Relaxed);
	}

	/// Record a failed refresh.
	pub fn record_error(&self) {
		self.refresh_errors.fetch_add(1, Ordering::Relaxed);
	}

	/// Take a point-in-time snapshot for status reporting.
	pub fn snapshot(&self) -> RefreshStatsSnapshot {
		RefreshStatsSnapshot {
			refresh_successes: self.refresh_successes.load(Ordering::Relaxed),
			refresh_errors: self.refresh_errors.load(Ordering::Relaxed),
			last_refresh_micros: match self.last_refresh_micros.load(Ordering::Relaxed) {
				0 => None,
				value => Some(value),
			},
		}
	}
}

/// Read-only snapshot of refresh counters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshStatsSnapshot {
	/// Count of refreshes that produced a token.
	pub refresh_successes: u64,
	/// Count of refreshes that failed.
	pub refresh_errors: u64,
	/// Microsecond latency of the most recent successful refresh.
	pub last_refresh_micros: Option<u64>,
}
impl RefreshStatsSnapshot {
	/// Total refresh attempts observed.
	pub fn attempts(&self) -> u64 {
		self.refresh_successes + self.refresh_errors
	}
}

/// Install the default Prometheus recorder backed by `metrics`.
///
/// Multiple invocations are safe; subsequent calls become no-ops once the recorder is installed.
#[cfg(feature = "prometheus")]
pub fn install_default_exporter() -> Result<()> {
	if PROMETHEUS_HANDLE.get().is_some() {
		return Ok(());
	}

	let handle = PrometheusBuilder::new()
		.install_recorder()
		.map_err(|err| Error::Metrics(err.to_string()))?;
	let _ = PROMETHEUS_HANDLE.set(handle);

	Ok(())
}

/// Access the global Prometheus exporter handle when installed.
#[cfg(feature = "prometheus")]
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
	PROMETHEUS_HANDLE.get()
}

/// Record the outcome of a JWT validation.
pub fn record_jwt_validation(outcome: &'static str) {
	#[cfg(feature = "metrics")]
	metrics::counter!(METRIC_JWT_VALIDATIONS_TOTAL, "outcome" => outcome).increment(1);
	#[cfg(not(feature = "metrics"))]
	let _ = outcome;
}

/// Record a dynamic token refresh attempt, with latency on success.
pub fn record_token_refresh(success: bool, duration: Duration) {
	#[cfg(feature = "metrics")]
	{
		metrics::counter!(METRIC_TOKEN_REFRESH_TOTAL, "status" => status(success)).increment(1);

		if success {
			metrics::histogram!(METRIC_TOKEN_REFRESH_DURATION).record(duration.as_secs_f64());
		}
	}
	#[cfg(not(feature = "metrics"))]
	let _ = (success, duration);
}

/// Record a session-cookie login attempt.
pub fn record_session_login(success: bool) {
	#[cfg(feature = "metrics")]
	metrics::counter!(METRIC_SESSION_LOGINS_TOTAL, "status" => status(success)).increment(1);
	#[cfg(not(feature = "metrics"))]
	let _ = success;
}

/// Record an OAuth stage (`callback` or `exchange`) outcome.
pub fn record_oauth_exchange(stage: &'static str, success: bool) {
	#[cfg(feature = "metrics")]
	metrics::counter!(METRIC_OAUTH_EXCHANGES_TOTAL, "stage" => stage, "status" => status(success))
		.increment(1);
	#[cfg(not(feature = "metrics"))]
	let _ = (stage, success);
}

#[cfg(feature = "metrics")]
fn status(success: bool) -> &'static str {
	if success { "success" } else { "error" }
}
