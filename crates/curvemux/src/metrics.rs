//! Prometheus recording plus the liveness and readiness endpoints.
//!
//! `/ready` follows the worker session: it answers 503 until the worker's
//! READY command has been relayed.

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Serialize)]
struct Liveness {
    status: &'static str,
}

#[derive(Serialize)]
struct Readiness {
    worker_session: &'static str,
    ready: bool,
}

/// Set by the relay when the worker session completes its handshake.
#[derive(Clone, Debug, Default)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
}

impl HealthState {
    /// Starts out not ready.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records whether the worker session is ready.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Whether the worker session is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

/// Installs the Prometheus recorder and serves `/metrics`, `/health` and
/// `/ready` on `addr` until the process exits.
///
/// # Errors
///
/// Returns an error if a recorder is already installed or `addr` cannot be
/// bound.
pub async fn start_metrics_server(addr: SocketAddr, health: HealthState) -> anyhow::Result<()> {
    let recorder = PrometheusBuilder::new().install_recorder()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", listener.local_addr()?);
    axum::serve(listener, routes(recorder, health)).await?;
    Ok(())
}

fn routes(recorder: PrometheusHandle, health: HealthState) -> Router {
    Router::new()
        .route(
            "/metrics",
            get(move || std::future::ready(recorder.render())),
        )
        .route("/health", get(liveness))
        .route("/ready", get(readiness))
        .with_state(health)
}

async fn liveness() -> (StatusCode, Json<Liveness>) {
    (StatusCode::OK, Json(Liveness { status: "relaying" }))
}

async fn readiness(State(health): State<HealthState>) -> (StatusCode, Json<Readiness>) {
    if health.is_ready() {
        let body = Readiness {
            worker_session: "handshake complete",
            ready: true,
        };
        (StatusCode::OK, Json(body))
    } else {
        let body = Readiness {
            worker_session: "awaiting worker handshake",
            ready: false,
        };
        (StatusCode::SERVICE_UNAVAILABLE, Json(body))
    }
}

/// Connection and worker gauges.
pub mod gauges {
    /// A connection was accepted on `endpoint`.
    pub fn inc_connections_active(endpoint: &'static str) {
        metrics::gauge!("curvemux_connections_active", "endpoint" => endpoint).increment(1.0);
    }

    /// A connection on `endpoint` closed.
    pub fn dec_connections_active(endpoint: &'static str) {
        metrics::gauge!("curvemux_connections_active", "endpoint" => endpoint).decrement(1.0);
    }

    /// Workers registered since start.
    pub fn workers_registered(count: usize) {
        metrics::gauge!("curvemux_workers_registered").set(count as f64);
    }
}

/// Relay counters.
pub mod counters {
    /// Record one relayed message of `frames` frames and `bytes` payload bytes.
    pub fn message_relayed(direction: &'static str, frames: u64, bytes: u64) {
        metrics::counter!("curvemux_messages_relayed_total", "direction" => direction)
            .increment(1);
        metrics::counter!("curvemux_frames_relayed_total", "direction" => direction)
            .increment(frames);
        metrics::counter!("curvemux_payload_bytes_total", "direction" => direction)
            .increment(bytes);
    }

    /// A message was dropped for `reason`.
    pub fn messages_dropped_total(reason: &'static str) {
        metrics::counter!("curvemux_messages_dropped_total", "reason" => reason).increment(1);
    }

    /// A control message arrived; `command` is `malformed` if it did not parse.
    pub fn control_commands_total(command: &'static str) {
        metrics::counter!("curvemux_control_commands_total", "command" => command).increment(1);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Record how long relaying one message took, in seconds.
    pub fn relay_latency_seconds(value: f64) {
        metrics::histogram!("curvemux_relay_latency_seconds").record(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_readiness() {
        let health = HealthState::new();
        assert!(!health.is_ready());
        health.clone().set_ready(true);
        assert!(health.is_ready());
    }

    #[tokio::test]
    async fn readiness_is_503_until_worker_handshake_completes() {
        let health = HealthState::new();
        let (status, Json(body)) = readiness(State(health.clone())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.worker_session, "awaiting worker handshake");
        assert!(!body.ready);

        health.set_ready(true);
        let (status, Json(body)) = readiness(State(health)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.ready);
    }

    #[tokio::test]
    async fn liveness_does_not_depend_on_the_worker() {
        let (status, Json(body)) = liveness().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.status, "relaying");
    }
}
