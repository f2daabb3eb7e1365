//! Ambient component A4: a `prometheus-client` registry exposed over an
//! `axum` `/metrics` endpoint, grounded directly in the teacher's
//! `App { registry: Arc<Registry> }` + `encode(&mut buffer, &registry)`
//! pattern.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

use crate::model::DecisionKind;

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
struct DecisionLabels {
	kind: String,
}

/// The metrics surface the data plane updates as connections move through
/// their lifecycle. Pure side channel — never consulted for forwarding
/// decisions (§4.4 "never gate forwarding").
pub struct Metrics {
	registry: Registry,
	connections_accepted: Counter,
	connections_blocked: Counter,
	connections_allowed: Counter,
	decisions_by_kind: Family<DecisionLabels, Counter>,
	bytes_forwarded: Counter,
	telemetry_dropped: Counter,
	telemetry_submitted: Counter,
}

impl Metrics {
	pub fn new() -> Metrics {
		let mut registry = Registry::default();

		let connections_accepted = Counter::default();
		registry.register(
			"proxysentry_connections_accepted",
			"Total TCP connections accepted by the listener",
			connections_accepted.clone(),
		);

		let connections_blocked = Counter::default();
		registry.register(
			"proxysentry_connections_blocked",
			"Total connections that received a 403 from the policy gate",
			connections_blocked.clone(),
		);

		let connections_allowed = Counter::default();
		registry.register(
			"proxysentry_connections_allowed",
			"Total connections forwarded or tunneled upstream",
			connections_allowed.clone(),
		);

		let decisions_by_kind = Family::default();
		registry.register(
			"proxysentry_policy_decisions",
			"Policy decisions broken down by the check that produced them",
			decisions_by_kind.clone(),
		);

		let bytes_forwarded = Counter::default();
		registry.register(
			"proxysentry_bytes_forwarded",
			"Total response bytes forwarded to clients",
			bytes_forwarded.clone(),
		);

		let telemetry_dropped = Counter::default();
		registry.register(
			"proxysentry_telemetry_dropped",
			"Telemetry rows dropped because the channel was full",
			telemetry_dropped.clone(),
		);

		let telemetry_submitted = Counter::default();
		registry.register(
			"proxysentry_telemetry_submitted",
			"Telemetry rows submitted to the async sink",
			telemetry_submitted.clone(),
		);

		Metrics {
			registry,
			connections_accepted,
			connections_blocked,
			connections_allowed,
			decisions_by_kind,
			bytes_forwarded,
			telemetry_dropped,
			telemetry_submitted,
		}
	}

	pub fn record_accepted(&self) {
		self.connections_accepted.inc();
	}

	pub fn record_decision(&self, kind: DecisionKind, blocked: bool) {
		self.decisions_by_kind.get_or_create(&DecisionLabels { kind: kind.to_string() }).inc();
		if blocked {
			self.connections_blocked.inc();
		} else {
			self.connections_allowed.inc();
		}
	}

	pub fn record_bytes_forwarded(&self, bytes: u64) {
		self.bytes_forwarded.inc_by(bytes);
	}

	pub fn record_telemetry_submitted(&self) {
		self.telemetry_submitted.inc();
	}

	pub fn record_telemetry_dropped(&self) {
		self.telemetry_dropped.inc();
	}
}

impl Default for Metrics {
	fn default() -> Self {
		Metrics::new()
	}
}

/// `GET /metrics` handler state.
#[derive(Clone)]
struct MetricsState {
	metrics: Arc<Metrics>,
}

pub fn router(metrics: Arc<Metrics>) -> Router {
	Router::new().route("/metrics", get(metrics_handler)).with_state(MetricsState { metrics })
}

async fn metrics_handler(State(state): State<MetricsState>) -> impl IntoResponse {
	let mut buffer = String::new();
	match encode(&mut buffer, &state.metrics.registry) {
		Ok(()) => (
			StatusCode::OK,
			[(header::CONTENT_TYPE, "application/openmetrics-text; version=1.0.0; charset=utf-8")],
			buffer,
		)
			.into_response(),
		Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, format!("failed to encode metrics: {err}")).into_response(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn encode_produces_registered_metric_names() {
		let metrics = Metrics::new();
		metrics.record_accepted();
		metrics.record_decision(DecisionKind::Domain, true);
		let mut buffer = String::new();
		encode(&mut buffer, &metrics.registry).unwrap();
		assert!(buffer.contains("proxysentry_connections_accepted"));
		assert!(buffer.contains("proxysentry_policy_decisions"));
	}
}
