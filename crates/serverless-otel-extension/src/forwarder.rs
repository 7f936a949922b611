//! Collector forwarder.
//!
//! Wraps telemetry records received from the instrumented function in an
//! envelope identifying this extension instance and posts them to the
//! configured collector. Forwarding is a single attempt; failures are reported
//! to the caller as [`ForwardResult::Failed`] and never propagated further.

use crate::config::CollectorConfig;
use crate::context::ExtensionContext;
use crate::extensions_api::{EXTENSION_ID_HEADER, EXTENSION_NAME_HEADER};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Kinds of records the relay forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordType {
    /// Invocation event data emitted before the handler runs.
    EventData,
    /// Telemetry emitted after the handler completes.
    TelemetryData,
}

impl RecordType {
    /// Returns the wire name of the record type.
    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::EventData => "eventData",
            RecordType::TelemetryData => "telemetryData",
        }
    }

    /// Extracts the record type from a payload's `recordType` field.
    pub fn from_payload(payload: &serde_json::Value) -> Option<Self> {
        match payload.get("recordType")?.as_str()? {
            "eventData" => Some(RecordType::EventData),
            "telemetryData" => Some(RecordType::TelemetryData),
            _ => None,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity attached to every forwarded record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeContext {
    /// Identifier assigned by the Extensions API, `null` before registration.
    pub extension_id: Option<String>,
    /// Execution identifier of this process.
    pub execution_id: String,
}

/// Body posted to the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEnvelope {
    /// Extension identity.
    pub context: EnvelopeContext,
    /// The inbound payload, unmodified.
    pub payload: serde_json::Value,
}

impl TelemetryEnvelope {
    /// Wraps `payload` with the identity held in `context`.
    pub fn new(context: &ExtensionContext, payload: serde_json::Value) -> Self {
        Self {
            context: EnvelopeContext {
                extension_id: context.extension_id(),
                execution_id: context.execution_id().to_string(),
            },
            payload,
        }
    }
}

/// Result of a forward attempt.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardResult {
    /// The collector accepted the record.
    Success,
    /// The request failed or the collector returned an error status.
    Failed,
    /// No collector endpoint is configured.
    Skipped,
}

/// Error during forwarding.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// HTTP request failed.
    #[error("HTTP request failed")]
    Http(#[from] reqwest::Error),

    /// Collector returned an error status.
    #[error("collector returned {status}: {body}")]
    Status {
        /// HTTP status code returned by the collector.
        status: u16,
        /// Response body from the collector.
        body: String,
    },
}

/// Posts telemetry envelopes to the collector.
pub struct CollectorForwarder {
    config: CollectorConfig,
    client: Client,
    extension_name: String,
    context: Arc<ExtensionContext>,
}

impl CollectorForwarder {
    /// Creates a forwarder for the given collector configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(
        config: CollectorConfig,
        extension_name: impl Into<String>,
        context: Arc<ExtensionContext>,
    ) -> Result<Self, ForwardError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(ForwardError::Http)?;

        Ok(Self {
            config,
            client,
            extension_name: extension_name.into(),
            context,
        })
    }

    /// Returns the URL records of `record_type` are posted to.
    pub fn record_url(&self, record_type: RecordType) -> Option<String> {
        self.config
            .endpoint
            .as_deref()
            .map(|endpoint| format!("{}/{}", endpoint.trim_end_matches('/'), record_type))
    }

    /// Forwards one record to the collector.
    pub async fn forward(
        &self,
        record_type: RecordType,
        payload: serde_json::Value,
    ) -> ForwardResult {
        let Some(url) = self.record_url(record_type) else {
            tracing::debug!(%record_type, "No collector endpoint configured, skipping forward");
            return ForwardResult::Skipped;
        };

        let envelope = TelemetryEnvelope::new(&self.context, payload);

        match self.try_forward(&url, &envelope).await {
            Ok(()) => {
                tracing::debug!(%record_type, "Forwarded record to collector");
                ForwardResult::Success
            }
            Err(e) => {
                tracing::warn!(%record_type, %url, error = %e, "Failed to forward record");
                ForwardResult::Failed
            }
        }
    }

    async fn try_forward(&self, url: &str, envelope: &TelemetryEnvelope) -> Result<(), ForwardError> {
        let mut request = self
            .client
            .post(url)
            .header(EXTENSION_NAME_HEADER, &self.extension_name)
            .json(envelope);

        if let Some(extension_id) = envelope.context.extension_id.as_deref() {
            request = request.header(EXTENSION_ID_HEADER, extension_id);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            // Drain the body so the connection can be reused.
            let _ = response.bytes().await;
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ForwardError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}
