//! AWS Lambda extension relaying locally emitted telemetry to a collector.
//!
//! The extension registers with the Lambda Extensions API, subscribes to the
//! Logs API, and runs two local HTTP servers: a telemetry relay that forwards
//! `eventData` and `telemetryData` records from the instrumented function to a
//! collector, and a listener that acknowledges Logs API deliveries. Startup is
//! ordered by one-shot readiness gates; see [`gate`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod context;
pub mod error;
pub mod event_loop;
pub mod extensions_api;
pub mod forwarder;
pub mod gate;
pub mod listener;
pub mod logs;
pub mod registration;
pub mod relay;
pub mod runtime;

pub use config::{
    CollectorConfig, Config, ConfigBuilder, ExtensionConfig, ListenerConfig, LogsApiConfig,
};
pub use context::ExtensionContext;
pub use error::{ExtensionError, Result};
pub use event_loop::{EventLoop, LoopState};
pub use extensions_api::{
    ApiError, EventType, ExtensionsApiClient, InvokeEvent, LogSubscription, LogType, NextEvent,
    RegisterResponse, ShutdownEvent,
};
pub use forwarder::{CollectorForwarder, ForwardError, ForwardResult, RecordType, TelemetryEnvelope};
pub use gate::{Gate, ReadinessGates};
pub use logs::{LogListener, LogRecord, LogStats};
pub use relay::{HealthResponse, RelayStats, TelemetryRelay};
pub use runtime::{ExtensionRuntime, RunOutcome, RuntimeBuilder, RuntimeError};
