//! Serverless OTel extension binary.
//!
//! Relays telemetry emitted by the instrumented function to a collector and
//! acknowledges Logs API deliveries for the lifetime of the execution
//! environment.
//!
//! # Configuration
//!
//! Configuration is loaded from (in order of priority):
//! 1. Default values
//! 2. Config file: `/var/task/sls-otel-extension.toml`
//! 3. `AWS_LAMBDA_RUNTIME_API`, `SLS_OTEL_SERVER_HOST`/`PORT`, `SLS_LOG_SERVER_HOST`/`PORT`
//! 4. Environment variables with `SLS_OTEL_EXTENSION_` prefix
//!
//! # Environment Variables
//!
//! - `SLS_OTEL_EXTENSION_COLLECTOR__ENDPOINT` - Collector base URL
//! - `SLS_OTEL_EXTENSION_COLLECTOR__TIMEOUT` - Collector request timeout in milliseconds
//! - `SLS_OTEL_EXTENSION_EXTENSION__NAME` - Name registered with the Extensions API
//!
//! The process exits with status 0 after `SHUTDOWN` or an interrupt and with
//! status 1 on any fatal failure.

use anyhow::{Context, Result};
use serverless_otel_extension::{ExtensionRuntime, RunOutcome};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing().context("failed to initialise tracing subscriber")?;

    let outcome = ExtensionRuntime::from_env()
        .context("failed to load configuration")?
        .run()
        .await
        .context("extension runtime failed")?;

    match outcome {
        RunOutcome::Shutdown(event) => {
            tracing::info!(reason = %event.shutdown_reason, "Shut down by platform");
        }
        RunOutcome::Interrupted => tracing::info!("Interrupted"),
    }

    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,serverless_otel_extension=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).without_time())
        .with(filter)
        .try_init()
        .context("failed to initialise tracing registry")?;

    Ok(())
}
