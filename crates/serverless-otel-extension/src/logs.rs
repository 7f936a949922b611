//! Logs API listener.
//!
//! The Logs API pushes batches of platform, function and extension records to
//! the destination declared in the subscription. The platform stalls or drops
//! records when the destination is slow or refuses connections, so every
//! `POST` or `PUT` is acknowledged with `200 OK` immediately, whatever its
//! path, size or content.

use crate::config::ListenerConfig;
use crate::gate::Gate;
use crate::listener;
use axum::{
    Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    routing::post,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

/// A single record in a Logs API batch.
///
/// # Example
///
/// ```json
/// {"time": "2022-06-05T23:53:22.289Z", "type": "platform.start", "record": {"requestId": "00bbcc13"}}
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct LogRecord {
    /// Record time in ISO 8601 format.
    #[serde(default)]
    pub time: Option<String>,
    /// Record type, e.g. `platform.start` or `function`.
    #[serde(rename = "type")]
    pub record_type: String,
    /// Record content: a string for log lines, an object for platform records.
    #[serde(default)]
    pub record: serde_json::Value,
}

/// Counters shared between the listener's handler and its owner.
#[derive(Debug, Default)]
pub struct LogStats {
    batches_received: AtomicU64,
    records_received: AtomicU64,
}

impl LogStats {
    /// Returns the number of batches received.
    pub fn batches_received(&self) -> u64 {
        self.batches_received.load(Ordering::Relaxed)
    }

    /// Returns the number of records received in well-formed batches.
    pub fn records_received(&self) -> u64 {
        self.records_received.load(Ordering::Relaxed)
    }
}

/// HTTP listener acknowledging Logs API deliveries.
pub struct LogListener {
    config: ListenerConfig,
    stats: Arc<LogStats>,
    cancel_token: CancellationToken,
}

impl LogListener {
    /// Creates a new Logs API listener.
    pub fn new(config: ListenerConfig, cancel_token: CancellationToken) -> Self {
        Self {
            config,
            stats: Arc::new(LogStats::default()),
            cancel_token,
        }
    }

    /// Returns the listener's counters.
    pub fn stats(&self) -> Arc<LogStats> {
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

        // Some runtimes deliver with PUT rather than POST. Batches of up to
        // `max_bytes` can exceed axum's default body limit.
        let app = Router::new()
            .route("/", post(handle_logs).put(handle_logs))
            .fallback(post(handle_logs).put(handle_logs))
            .layer(DefaultBodyLimit::disable())
            .with_state(self.stats);

        tracing::info!(addr = %local_addr, "Logs API listener listening");
        ready.signal(local_addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel_token.cancelled_owned())
            .await
    }
}

async fn handle_logs(State(stats): State<Arc<LogStats>>, body: Bytes) -> StatusCode {
    stats.batches_received.fetch_add(1, Ordering::Relaxed);

    match serde_json::from_slice::<Vec<LogRecord>>(&body) {
        Ok(records) => {
            stats
                .records_received
                .fetch_add(records.len() as u64, Ordering::Relaxed);
            tracing::debug!(
                count = records.len(),
                types = ?count_by_type(&records),
                "Received log batch"
            );
        }
        Err(e) => {
            tracing::debug!(error = %e, bytes = body.len(), "Received unparseable log batch");
        }
    }

    StatusCode::OK
}

fn count_by_type(records: &[LogRecord]) -> BTreeMap<&str, usize> {
    let mut counts = BTreeMap::new();
    for record in records {
        *counts.entry(record.record_type.as_str()).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_batch() {
        let json = r#"[
            {"time": "2022-06-05T23:53:22.289Z", "type": "platform.start", "record": {"requestId": "00bbcc13", "version": "$LATEST"}},
            {"time": "2022-06-05T23:53:22.296Z", "type": "function", "record": "Hello from Lambda!\n"},
            {"time": "2022-06-05T23:53:22.296Z", "type": "function", "record": "second line\n"},
            {"time": "2022-06-05T23:53:22.309Z", "type": "platform.runtimeDone", "record": {"requestId": "00bbcc13", "status": "success"}}
        ]"#;

        let records: Vec<LogRecord> = serde_json::from_str(json).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].record["requestId"], "00bbcc13");
        assert_eq!(records[1].record, "Hello from Lambda!\n");

        let counts = count_by_type(&records);
        assert_eq!(counts.get("function"), Some(&2));
        assert_eq!(counts.get("platform.start"), Some(&1));
        assert_eq!(counts.get("platform.runtimeDone"), Some(&1));
    }

    #[test]
    fn test_parse_record_without_time() {
        let records: Vec<LogRecord> =
            serde_json::from_str(r#"[{"type": "extension", "record": "ready"}]"#).unwrap();

        assert!(records[0].time.is_none());
        assert_eq!(records[0].record_type, "extension");
    }

    #[tokio::test]
    async fn test_handler_acknowledges_any_body() {
        let stats = Arc::new(LogStats::default());

        let status = handle_logs(
            State(Arc::clone(&stats)),
            Bytes::from_static(br#"[{"type": "function", "record": "line"}]"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let status = handle_logs(State(Arc::clone(&stats)), Bytes::from_static(b"not json")).await;
        assert_eq!(status, StatusCode::OK);

        assert_eq!(stats.batches_received(), 2);
        assert_eq!(stats.records_received(), 1);
    }
}
