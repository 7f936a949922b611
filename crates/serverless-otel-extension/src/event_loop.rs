//! Lifecycle event loop.
//!
//! Once both registrations have completed, repeatedly long-polls the
//! Extensions API for the next event. `INVOKE` events are logged and polling
//! continues; a `SHUTDOWN` event ends the loop.

use crate::context::ExtensionContext;
use crate::extensions_api::{ApiError, ExtensionsApiClient, NextEvent, ShutdownEvent};
use crate::gate::ReadinessGates;
use std::sync::Arc;

/// State of the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Waiting for or processing the next event.
    Polling,
    /// A `SHUTDOWN` event has been received.
    Terminated,
}

/// Long-polls the Extensions API until shutdown.
pub struct EventLoop {
    client: ExtensionsApiClient,
    context: Arc<ExtensionContext>,
    gates: Arc<ReadinessGates>,
    state: LoopState,
    invocations: u64,
}

impl EventLoop {
    /// Creates an event loop.
    pub fn new(
        client: ExtensionsApiClient,
        context: Arc<ExtensionContext>,
        gates: Arc<ReadinessGates>,
    ) -> Self {
        Self {
            client,
            context,
            gates,
            state: LoopState::Polling,
            invocations: 0,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Returns the number of `INVOKE` events received.
    pub fn invocations(&self) -> u64 {
        self.invocations
    }

    /// Runs until a `SHUTDOWN` event is received and returns it.
    ///
    /// No poll is issued before both registrations have completed.
    ///
    /// # Errors
    ///
    /// Any failed poll ends the loop. The platform only delivers events to
    /// extensions that keep polling, so a failed poll is not retried.
    pub async fn run(&mut self) -> Result<ShutdownEvent, ApiError> {
        self.gates.wait_registered().await;

        let extension_id = self
            .context
            .extension_id()
            .ok_or(ApiError::MissingExtensionId)?;

        tracing::debug!(%extension_id, "Starting event loop");

        loop {
            match self.client.next_event(&extension_id).await? {
                NextEvent::Invoke(invoke) => {
                    self.invocations += 1;
                    tracing::debug!(
                        request_id = %invoke.request_id,
                        deadline_ms = invoke.deadline_ms,
                        "Received INVOKE event"
                    );
                }
                NextEvent::Shutdown(shutdown) => {
                    self.state = LoopState::Terminated;
                    tracing::info!(
                        reason = %shutdown.shutdown_reason,
                        invocations = self.invocations,
                        "Received SHUTDOWN event"
                    );
                    return Ok(shutdown);
                }
                NextEvent::Unknown => {
                    tracing::warn!("Ignoring unknown event type");
                }
            }
        }
    }
}
