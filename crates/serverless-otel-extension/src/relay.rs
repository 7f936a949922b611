//! Telemetry relay server.
//!
//! Accepts JSON records pushed by the instrumented function and forwards
//! `eventData` and `telemetryData` records to the collector. Every inbound
//! `POST` is acknowledged with `200 OK`, whatever its path, size or content,
//! so that a collector outage never blocks or fails an invocation.

use crate::config::ListenerConfig;
use crate::forwarder::{CollectorForwarder, ForwardResult, RecordType};
use crate::gate::Gate;
use crate::listener;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Status of the relay.
    pub status: &'static str,
    /// Number of records received.
    pub records_received: u64,
    /// Number of records the collector accepted.
    pub records_forwarded: u64,
}

/// Counters shared between the relay's handlers and its owner.
#[derive(Debug, Default)]
pub struct RelayStats {
    records_received: AtomicU64,
    records_forwarded: AtomicU64,
}

impl RelayStats {
    /// Returns the number of records received.
    pub fn records_received(&self) -> u64 {
        self.records_received.load(Ordering::Relaxed)
    }

    /// Returns the number of records the collector accepted.
    pub fn records_forwarded(&self) -> u64 {
        self.records_forwarded.load(Ordering::Relaxed)
    }
}

/// HTTP listener relaying function telemetry to the collector.
pub struct TelemetryRelay {
    config: ListenerConfig,
    forwarder: Arc<CollectorForwarder>,
    stats: Arc<RelayStats>,
    cancel_token: CancellationToken,
}

impl TelemetryRelay {
    /// Creates a new telemetry relay.
    ///
    /// # Arguments
    ///
    /// * `config` - Listener configuration
    /// * `forwarder` - Forwarder posting records to the collector
    /// * `cancel_token` - Token for graceful shutdown
    pub fn new(
        config: ListenerConfig,
        forwarder: Arc<CollectorForwarder>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            config,
            forwarder,
            stats: Arc::new(RelayStats::default()),
            cancel_token,
        }
    }

    /// Returns the relay's counters.
    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    /// Binds the listener, opens `ready` with the bound address and serves
    /// until the cancellation token is triggered.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound or the server fails.
    pub async fn run(self, ready: &Gate<SocketAddr>) -> Result<(), std::io::Error> {
        let listener = listener::bind(&self.config).await?;
        let local_addr = listener.local_addr()?;

        let state = Arc::new(RelayState {
            forwarder: self.forwarder,
            stats: self.stats,
        });

        // Records are accepted on any path and at any size.
        let app = Router::new()
            .route("/", post(handle_record))
            .route("/health", get(handle_health))
            .fallback(post(handle_record))
            .layer(DefaultBodyLimit::disable())
            .with_state(state);

        tracing::info!(addr = %local_addr, "Telemetry relay listening");
        ready.signal(local_addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel_token.cancelled_owned())
            .await
    }
}

struct RelayState {
    forwarder: Arc<CollectorForwarder>,
    stats: Arc<RelayStats>,
}

async fn handle_health(State(state): State<Arc<RelayState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ready",
        records_received: state.stats.records_received(),
        records_forwarded: state.stats.records_forwarded(),
    })
}

async fn handle_record(State(state): State<Arc<RelayState>>, body: Bytes) -> StatusCode {
    state.stats.records_received.fetch_add(1, Ordering::Relaxed);

    let payload = parse_payload(&body);
    tracing::debug!(%payload, "Received telemetry record");

    if let Some(record_type) = RecordType::from_payload(&payload)
        && state.forwarder.forward(record_type, payload).await == ForwardResult::Success
    {
        state.stats.records_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    StatusCode::OK
}

/// Parses an inbound body, treating malformed JSON as an empty object.
fn parse_payload(body: &[u8]) -> serde_json::Value {
    serde_json::from_slice(body).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to parse telemetry payload");
        serde_json::Value::Object(serde_json::Map::new())
    })
}
