//! Extension runtime orchestrator.
//!
//! Runs the extension's five tasks in one group:
//! - Telemetry relay server
//! - Logs API listener
//! - Lifecycle registration
//! - Log delivery registration
//! - Event loop
//!
//! The run ends when the event loop receives `SHUTDOWN`, when the process is
//! interrupted, or when any task fails. The remaining tasks are then aborted.

use crate::config::Config;
use crate::context::ExtensionContext;
use crate::event_loop::EventLoop;
use crate::extensions_api::{ApiError, ExtensionsApiClient, ShutdownEvent};
use crate::forwarder::{CollectorForwarder, ForwardError};
use crate::gate::ReadinessGates;
use crate::logs::LogListener;
use crate::registration;
use crate::relay::TelemetryRelay;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The platform sent `SHUTDOWN`.
    Shutdown(ShutdownEvent),
    /// SIGINT, SIGTERM, or the cancellation token.
    Interrupted,
}

/// What a task in the group finished with.
enum TaskExit {
    Stopped(&'static str),
    Shutdown(ShutdownEvent),
}

/// Extension runtime that orchestrates all components.
pub struct ExtensionRuntime {
    config: Config,
    cancel_token: CancellationToken,
    gates: Arc<ReadinessGates>,
    context: Arc<ExtensionContext>,
}

impl ExtensionRuntime {
    /// Creates a new extension runtime with the given configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            cancel_token: CancellationToken::new(),
            gates: ReadinessGates::new_shared(),
            context: Arc::new(ExtensionContext::new()),
        }
    }

    /// Creates a runtime with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(Config::default())
    }

    /// Creates a runtime from configuration loaded from the default file and
    /// the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ExtensionError::Config`](crate::ExtensionError::Config) if
    /// configuration loading fails.
    pub fn from_env() -> crate::Result<Self> {
        let config = Config::load()?;
        tracing::debug!(?config, "Configuration loaded");
        Ok(Self::new(config))
    }

    /// Returns the runtime's configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns a handle to the cancellation token.
    ///
    /// Cancelling it ends the run with [`RunOutcome::Interrupted`].
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Returns the readiness gates shared by the runtime's tasks.
    pub fn gates(&self) -> Arc<ReadinessGates> {
        Arc::clone(&self.gates)
    }

    /// Returns the shared extension context.
    pub fn context(&self) -> Arc<ExtensionContext> {
        Arc::clone(&self.context)
    }

    /// Runs the extension until shutdown, interruption or failure.
    ///
    /// # Errors
    ///
    /// Returns an error if no Runtime API address is configured, a listener
    /// cannot be bound, registration fails, or polling for events fails.
    pub async fn run(self) -> Result<RunOutcome, RuntimeError> {
        let runtime_api = self
            .config
            .extension
            .runtime_api
            .clone()
            .ok_or(RuntimeError::MissingRuntimeApi)?;

        let client = ExtensionsApiClient::new(
            &runtime_api,
            self.config.extension.name.clone(),
            self.config.extension.next_event_timeout,
        )
        .map_err(RuntimeError::Client)?;

        let forwarder = Arc::new(CollectorForwarder::new(
            self.config.collector.clone(),
            self.config.extension.name.clone(),
            Arc::clone(&self.context),
        )?);

        tracing::debug!(
            %runtime_api,
            name = %self.config.extension.name,
            execution_id = %self.context.execution_id(),
            "Starting extension"
        );

        let mut tasks = self.spawn_tasks(client, forwarder);
        let result = self.supervise(&mut tasks).await;

        self.cancel_token.cancel();
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}

        match &result {
            Ok(outcome) => tracing::info!(?outcome, "Extension finished"),
            Err(e) => tracing::error!(error = %e, "Extension failed"),
        }
        result
    }

    fn spawn_tasks(
        &self,
        client: ExtensionsApiClient,
        forwarder: Arc<CollectorForwarder>,
    ) -> JoinSet<Result<TaskExit, RuntimeError>> {
        let mut tasks = JoinSet::new();

        let relay = TelemetryRelay::new(
            self.config.telemetry_listener.clone(),
            forwarder,
            self.cancel_token.clone(),
        );
        let gates = Arc::clone(&self.gates);
        tasks.spawn(async move {
            relay
                .run(&gates.telemetry_server_ready)
                .await
                .map(|()| TaskExit::Stopped("telemetry relay"))
                .map_err(|source| RuntimeError::Listener {
                    name: "telemetry relay",
                    source,
                })
        });

        let log_listener =
            LogListener::new(self.config.log_listener.clone(), self.cancel_token.clone());
        let gates = Arc::clone(&self.gates);
        tasks.spawn(async move {
            log_listener
                .run(&gates.log_server_ready)
                .await
                .map(|()| TaskExit::Stopped("log listener"))
                .map_err(|source| RuntimeError::Listener {
                    name: "log listener",
                    source,
                })
        });

        let (task_client, context, gates) = (
            client.clone(),
            Arc::clone(&self.context),
            Arc::clone(&self.gates),
        );
        tasks.spawn(async move {
            registration::register_lifecycle(&task_client, &context, &gates)
                .await
                .map(|_| TaskExit::Stopped("lifecycle registration"))
                .map_err(RuntimeError::LifecycleRegistration)
        });

        let (task_client, context, gates) = (
            client.clone(),
            Arc::clone(&self.context),
            Arc::clone(&self.gates),
        );
        let logs_api = self.config.logs_api.clone();
        tasks.spawn(async move {
            registration::register_log_delivery(&task_client, &context, &gates, &logs_api)
                .await
                .map(|()| TaskExit::Stopped("log delivery registration"))
                .map_err(RuntimeError::LogRegistration)
        });

        let mut event_loop =
            EventLoop::new(client, Arc::clone(&self.context), Arc::clone(&self.gates));
        tasks.spawn(async move {
            event_loop
                .run()
                .await
                .map(TaskExit::Shutdown)
                .map_err(RuntimeError::EventLoop)
        });

        tasks
    }

    async fn supervise(
        &self,
        tasks: &mut JoinSet<Result<TaskExit, RuntimeError>>,
    ) -> Result<RunOutcome, RuntimeError> {
        let interrupt = interrupt_signal();
        tokio::pin!(interrupt);
        let mut interrupt_armed = true;

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    tracing::info!("Cancellation requested");
                    return Ok(RunOutcome::Interrupted);
                }
                result = &mut interrupt, if interrupt_armed => match result {
                    Ok(()) => {
                        tracing::info!("Received interrupt signal");
                        return Ok(RunOutcome::Interrupted);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to install signal handlers");
                        interrupt_armed = false;
                    }
                },
                joined = tasks.join_next() => match joined {
                    Some(Ok(Ok(TaskExit::Shutdown(event)))) => {
                        return Ok(RunOutcome::Shutdown(event));
                    }
                    Some(Ok(Ok(TaskExit::Stopped(task)))) => {
                        tracing::debug!(task, "Task completed");
                    }
                    Some(Ok(Err(e))) => return Err(e),
                    Some(Err(e)) => return Err(RuntimeError::TaskPanicked(e)),
                    // The event loop only returns through one of the arms above.
                    None => return Ok(RunOutcome::Interrupted),
                },
            }
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn interrupt_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = sigterm.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

/// Errors from the extension runtime.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Neither `AWS_LAMBDA_RUNTIME_API` nor `extension.runtime_api` is set.
    #[error("Runtime API address is not configured")]
    MissingRuntimeApi,

    /// Failed to create the Extensions API client.
    #[error("failed to create Extensions API client")]
    Client(#[source] reqwest::Error),

    /// Failed to create the collector forwarder.
    #[error("failed to create collector forwarder")]
    Forwarder(#[from] ForwardError),

    /// A listener failed to bind or serve.
    #[error("{name} failed")]
    Listener {
        /// Which listener failed.
        name: &'static str,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Extensions API registration failed.
    #[error("lifecycle registration failed")]
    LifecycleRegistration(#[source] ApiError),

    /// Logs API subscription failed.
    #[error("log delivery registration failed")]
    LogRegistration(#[source] ApiError),

    /// Polling for the next event failed.
    #[error("event loop failed")]
    EventLoop(#[source] ApiError),

    /// A task panicked or was cancelled unexpectedly.
    #[error("runtime task panicked")]
    TaskPanicked(#[source] JoinError),
}

/// Builder for configuring the extension runtime.
#[must_use = "builders do nothing unless .build() is called"]
pub struct RuntimeBuilder {
    config: Config,
}

impl RuntimeBuilder {
    /// Creates a new runtime builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Sets the configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Sets the Runtime API address (`host:port`).
    pub fn runtime_api(mut self, runtime_api: impl Into<String>) -> Self {
        self.config.extension.runtime_api = Some(runtime_api.into());
        self
    }

    /// Sets the name the extension registers under.
    pub fn extension_name(mut self, name: impl Into<String>) -> Self {
        self.config.extension.name = name.into();
        self
    }

    /// Sets the collector endpoint records are forwarded to.
    pub fn collector_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.collector.endpoint = Some(endpoint.into());
        self
    }

    /// Sets the long-poll timeout for the next-event request.
    pub fn next_event_timeout(mut self, timeout: Duration) -> Self {
        self.config.extension.next_event_timeout = timeout;
        self
    }

    /// Binds both listeners to ephemeral loopback ports.
    pub fn ephemeral_listeners(mut self) -> Self {
        self.config.telemetry_listener.host = "127.0.0.1".to_string();
        self.config.telemetry_listener.port = 0;
        self.config.log_listener.host = "127.0.0.1".to_string();
        self.config.log_listener.port = 0;
        self
    }

    /// Builds the extension runtime.
    pub fn build(self) -> ExtensionRuntime {
        ExtensionRuntime::new(self.config)
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
