//! Extensions API and Logs API registration.
//!
//! Lifecycle registration waits until the telemetry relay is bound so that the
//! function never starts emitting telemetry before something is listening.
//! Log delivery registration additionally needs the extension identifier, so
//! it waits until lifecycle registration has stored one.

use crate::config::LogsApiConfig;
use crate::context::ExtensionContext;
use crate::extensions_api::{
    ApiError, EventType, ExtensionsApiClient, LogSubscription, RegisterResponse,
};
use crate::gate::ReadinessGates;
use crate::listener;

/// Events the extension subscribes to.
pub const LIFECYCLE_EVENTS: [EventType; 2] = [EventType::Invoke, EventType::Shutdown];

/// Registers the extension for `INVOKE` and `SHUTDOWN` events.
///
/// Waits for `telemetry_server_ready`, stores the assigned identifier in
/// `context`, then opens `lifecycle_registered`.
///
/// # Errors
///
/// Returns an error if the registration request fails. The gate is left
/// closed in that case.
pub async fn register_lifecycle(
    client: &ExtensionsApiClient,
    context: &ExtensionContext,
    gates: &ReadinessGates,
) -> Result<RegisterResponse, ApiError> {
    let relay_addr = gates.telemetry_server_ready.wait().await;
    tracing::debug!(%relay_addr, "Telemetry relay ready, registering extension");

    let response = client.register(&LIFECYCLE_EVENTS).await?;
    context.set_extension_id(response.extension_id.as_str());

    tracing::info!(
        extension_id = %response.extension_id,
        function_name = response.function_name.as_deref().unwrap_or("unknown"),
        "Extension registered"
    );

    gates.lifecycle_registered.signal(());
    Ok(response)
}

/// Subscribes to the Logs API with the log listener as destination.
///
/// Waits for `log_server_ready` and `lifecycle_registered`, then opens
/// `log_delivery_registered`.
///
/// # Errors
///
/// Returns an error if the subscription request fails or no extension
/// identifier has been stored.
pub async fn register_log_delivery(
    client: &ExtensionsApiClient,
    context: &ExtensionContext,
    gates: &ReadinessGates,
    config: &LogsApiConfig,
) -> Result<(), ApiError> {
    let (log_addr, ()) = tokio::join!(
        gates.log_server_ready.wait(),
        gates.lifecycle_registered.wait()
    );

    let extension_id = context.extension_id().ok_or(ApiError::MissingExtensionId)?;
    let subscription = LogSubscription::new(config, listener::destination_uri(log_addr));

    client.subscribe_logs(&extension_id, &subscription).await?;

    tracing::info!(
        destination = %subscription.destination.uri,
        types = ?subscription.types,
        "Subscribed to Logs API"
    );

    gates.log_delivery_registered.signal(());
    Ok(())
}
