//! Extensions API and Logs API client.
//!
//! Implements the client side of the Lambda platform APIs the extension talks to:
//! - `POST /2020-01-01/extension/register`
//! - `GET /2020-01-01/extension/event/next`
//! - `PUT /2020-08-15/logs`
//!
//! See <https://docs.aws.amazon.com/lambda/latest/dg/runtimes-extensions-api.html>
//! and <https://docs.aws.amazon.com/lambda/latest/dg/runtimes-logs-api.html>.

use crate::config::LogsApiConfig;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Header carrying the extension's name on registration.
pub const EXTENSION_NAME_HEADER: &str = "Lambda-Extension-Name";
/// Header carrying the identifier assigned on registration.
pub const EXTENSION_ID_HEADER: &str = "Lambda-Extension-Identifier";

const REGISTER_PATH: &str = "2020-01-01/extension/register";
const NEXT_EVENT_PATH: &str = "2020-01-01/extension/event/next";
const LOGS_PATH: &str = "2020-08-15/logs";

/// Lifecycle events an extension can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    /// Function invocation.
    Invoke,
    /// Execution environment shutdown.
    Shutdown,
}

/// Log streams available from the Logs API.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    /// Platform records (start, end, report, fault, extension).
    Platform,
    /// Function logs from stdout/stderr.
    Function,
    /// Extension logs.
    Extension,
}

/// Body of the registration request.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    /// Events the extension wants to receive.
    pub events: Vec<EventType>,
}

/// Result of a successful registration.
///
/// # Example body
///
/// ```json
/// {
///    "functionName": "helloWorld",
///    "functionVersion": "$LATEST",
///    "handler": "lambda_function.lambda_handler"
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterResponse {
    /// Identifier assigned by the platform, from the `Lambda-Extension-Identifier` header.
    #[serde(skip)]
    pub extension_id: String,
    /// The name of the function.
    pub function_name: Option<String>,
    /// The version of the function.
    pub function_version: Option<String>,
    /// The handler the function invokes.
    pub handler: Option<String>,
}

/// Tracing header attached to an `INVOKE` event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Tracing {
    /// Header type, usually `X-Amzn-Trace-Id`.
    #[serde(rename = "type")]
    pub ty: String,
    /// Header value.
    pub value: String,
}

/// Payload of an `INVOKE` event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InvokeEvent {
    /// Invocation deadline in Unix milliseconds.
    pub deadline_ms: u64,
    /// Request identifier of the invocation.
    pub request_id: String,
    /// ARN of the invoked function.
    pub invoked_function_arn: String,
    /// Tracing header, when active tracing is enabled.
    pub tracing: Option<Tracing>,
}

/// Payload of a `SHUTDOWN` event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShutdownEvent {
    /// Reason for the shutdown (`spindown`, `timeout`, `failure`).
    pub shutdown_reason: String,
    /// Shutdown deadline in Unix milliseconds.
    pub deadline_ms: u64,
}

/// Event returned by the next-event endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "eventType", rename_all = "UPPERCASE")]
pub enum NextEvent {
    /// `INVOKE` event.
    Invoke(InvokeEvent),
    /// `SHUTDOWN` event.
    Shutdown(ShutdownEvent),
    /// Any event type this extension does not know about.
    #[serde(other)]
    Unknown,
}

/// Buffering limits for log delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferingConfig {
    /// Maximum number of records to buffer before sending.
    pub max_items: u32,
    /// Maximum size in bytes to buffer before sending.
    pub max_bytes: u32,
    /// Maximum time in milliseconds to buffer before sending.
    pub timeout_ms: u32,
}

/// Destination of log delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Protocol to use (`HTTP`).
    pub protocol: String,
    /// URI to send records to.
    #[serde(rename = "URI")]
    pub uri: String,
}

/// Subscription request for the Logs API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSubscription {
    /// Schema version.
    pub schema_version: String,
    /// Log streams to subscribe to.
    pub types: Vec<LogType>,
    /// Buffering configuration.
    pub buffering: BufferingConfig,
    /// Destination for records.
    pub destination: DestinationConfig,
}

impl LogSubscription {
    /// Builds a subscription delivering to `destination_uri` over HTTP.
    pub fn new(config: &LogsApiConfig, destination_uri: impl Into<String>) -> Self {
        Self {
            schema_version: config.schema_version.clone(),
            types: config.types.clone(),
            buffering: BufferingConfig {
                max_items: config.max_items,
                max_bytes: config.max_bytes,
                timeout_ms: config.timeout_ms,
            },
            destination: DestinationConfig {
                protocol: "HTTP".to_string(),
                uri: destination_uri.into(),
            },
        }
    }
}

/// Errors from Extensions API and Logs API calls.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// HTTP request failed.
    #[error("{operation} request failed")]
    Http {
        /// API operation that failed.
        operation: &'static str,
        /// Underlying transport error.
        #[source]
        source: reqwest::Error,
    },

    /// The API returned a non-success status.
    #[error("{operation} returned {status}: {body}")]
    Status {
        /// API operation that failed.
        operation: &'static str,
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// A required response header was missing or not valid UTF-8.
    #[error("{operation} response is missing the {header} header")]
    MissingHeader {
        /// API operation that failed.
        operation: &'static str,
        /// Name of the missing header.
        header: &'static str,
    },

    /// The response body could not be decoded.
    #[error("failed to decode {operation} response")]
    Decode {
        /// API operation that failed.
        operation: &'static str,
        /// Underlying decode error.
        #[source]
        source: serde_json::Error,
    },

    /// The extension identifier was not available when it was required.
    #[error("extension identifier has not been assigned")]
    MissingExtensionId,
}

/// Client for the Extensions API and Logs API.
#[derive(Debug, Clone)]
pub struct ExtensionsApiClient {
    client: Client,
    base_url: String,
    extension_name: String,
    next_event_timeout: Duration,
}

impl ExtensionsApiClient {
    /// Creates a client for the Runtime API at `runtime_api` (`host:port`).
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(
        runtime_api: &str,
        extension_name: impl Into<String>,
        next_event_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        // No client-wide timeout: the long poll may legitimately block while
        // the environment is frozen.
        let client = Client::builder().pool_idle_timeout(None).build()?;

        let base_url = if runtime_api.starts_with("http://") || runtime_api.starts_with("https://")
        {
            runtime_api.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", runtime_api.trim_end_matches('/'))
        };

        Ok(Self {
            client,
            base_url,
            extension_name: extension_name.into(),
            next_event_timeout,
        })
    }

    /// Returns the base URL of the Runtime API.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the name the extension registers under.
    pub fn extension_name(&self) -> &str {
        &self.extension_name
    }

    /// Registers the extension for the given lifecycle events.
    ///
    /// # Errors
    ///
    /// Fails on transport errors, non-success status, or a missing
    /// `Lambda-Extension-Identifier` header.
    pub async fn register(&self, events: &[EventType]) -> Result<RegisterResponse, ApiError> {
        const OPERATION: &str = "register";

        let url = format!("{}/{}", self.base_url, REGISTER_PATH);
        tracing::debug!(%url, name = %self.extension_name, "Registering extension");

        let response = self
            .client
            .post(&url)
            .header(EXTENSION_NAME_HEADER, &self.extension_name)
            .json(&RegisterRequest {
                events: events.to_vec(),
            })
            .send()
            .await
            .map_err(|source| ApiError::Http {
                operation: OPERATION,
                source,
            })?;

        let response = check_status(OPERATION, response).await?;

        let extension_id = response
            .headers()
            .get(EXTENSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or(ApiError::MissingHeader {
                operation: OPERATION,
                header: EXTENSION_ID_HEADER,
            })?;

        let body = response.bytes().await.map_err(|source| ApiError::Http {
            operation: OPERATION,
            source,
        })?;

        // The body is informational; an empty or unexpected body does not fail registration.
        let mut register = serde_json::from_slice::<RegisterResponse>(&body).unwrap_or_else(|e| {
            tracing::debug!(error = %e, "Ignoring undecodable registration body");
            RegisterResponse::default()
        });
        register.extension_id = extension_id;

        Ok(register)
    }

    /// Blocks until the platform delivers the next lifecycle event.
    ///
    /// # Errors
    ///
    /// Fails on transport errors (including the long poll timeout),
    /// non-success status, or an undecodable body.
    pub async fn next_event(&self, extension_id: &str) -> Result<NextEvent, ApiError> {
        const OPERATION: &str = "next event";

        let url = format!("{}/{}", self.base_url, NEXT_EVENT_PATH);

        let response = self
            .client
            .get(&url)
            .header(EXTENSION_ID_HEADER, extension_id)
            .timeout(self.next_event_timeout)
            .send()
            .await
            .map_err(|source| ApiError::Http {
                operation: OPERATION,
                source,
            })?;

        let response = check_status(OPERATION, response).await?;

        let body = response.bytes().await.map_err(|source| ApiError::Http {
            operation: OPERATION,
            source,
        })?;

        serde_json::from_slice(&body).map_err(|source| ApiError::Decode {
            operation: OPERATION,
            source,
        })
    }

    /// Subscribes to the Logs API.
    ///
    /// # Errors
    ///
    /// Fails on transport errors or non-success status.
    pub async fn subscribe_logs(
        &self,
        extension_id: &str,
        subscription: &LogSubscription,
    ) -> Result<(), ApiError> {
        const OPERATION: &str = "logs subscribe";

        let url = format!("{}/{}", self.base_url, LOGS_PATH);
        tracing::debug!(%url, destination = %subscription.destination.uri, "Subscribing to Logs API");

        let response = self
            .client
            .put(&url)
            .header(EXTENSION_ID_HEADER, extension_id)
            .json(subscription)
            .send()
            .await
            .map_err(|source| ApiError::Http {
                operation: OPERATION,
                source,
            })?;

        check_status(OPERATION, response).await?;
        Ok(())
    }
}

async fn check_status(
    operation: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(ApiError::Status {
        operation,
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_request_body() {
        let request = RegisterRequest {
            events: vec![EventType::Invoke, EventType::Shutdown],
        };

        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({"events": ["INVOKE", "SHUTDOWN"]})
        );
    }

    #[test]
    fn test_parse_invoke_event() {
        let json = r#"{
            "eventType": "INVOKE",
            "deadlineMs": 1654468766618,
            "requestId": "dbdb0d38-24e5-45eb-ad4f-3234faaa30d5",
            "invokedFunctionArn": "arn:aws:lambda:us-east-1:123456789012:function:hello",
            "tracing": {
                "type": "X-Amzn-Trace-Id",
                "value": "Root=1-629d3097-1edcadf06b4c097a50faa7a1;Parent=2a68d66d2a726db8;Sampled=0"
            }
        }"#;

        match serde_json::from_str::<NextEvent>(json).unwrap() {
            NextEvent::Invoke(invoke) => {
                assert_eq!(invoke.deadline_ms, 1654468766618);
                assert_eq!(invoke.request_id, "dbdb0d38-24e5-45eb-ad4f-3234faaa30d5");
                assert_eq!(invoke.tracing.unwrap().ty, "X-Amzn-Trace-Id");
            }
            other => panic!("Expected Invoke event, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_shutdown_event() {
        let json = r#"{"eventType": "SHUTDOWN", "deadlineMs": 1654469121614, "shutdownReason": "spindown"}"#;

        assert_eq!(
            serde_json::from_str::<NextEvent>(json).unwrap(),
            NextEvent::Shutdown(ShutdownEvent {
                shutdown_reason: "spindown".to_string(),
                deadline_ms: 1654469121614,
            })
        );
    }

    #[test]
    fn test_parse_minimal_events() {
        let invoke: NextEvent = serde_json::from_str(r#"{"eventType": "INVOKE"}"#).unwrap();
        assert!(matches!(invoke, NextEvent::Invoke(_)));

        let shutdown: NextEvent = serde_json::from_str(r#"{"eventType": "SHUTDOWN"}"#).unwrap();
        assert!(matches!(shutdown, NextEvent::Shutdown(_)));
    }

    #[test]
    fn test_parse_unknown_event_type() {
        let event: NextEvent =
            serde_json::from_str(r#"{"eventType": "RESTORE", "deadlineMs": 1}"#).unwrap();
        assert_eq!(event, NextEvent::Unknown);
    }

    #[test]
    fn test_parse_missing_event_type_fails() {
        assert!(serde_json::from_str::<NextEvent>(r#"{"deadlineMs": 1}"#).is_err());
    }

    #[test]
    fn test_log_subscription_body() {
        let subscription =
            LogSubscription::new(&LogsApiConfig::default(), "http://sandbox.localdomain:2773/");

        assert_eq!(
            serde_json::to_value(&subscription).unwrap(),
            serde_json::json!({
                "schemaVersion": "2021-03-18",
                "types": ["platform", "extension", "function"],
                "buffering": {"maxItems": 1000, "maxBytes": 262144, "timeoutMs": 100},
                "destination": {"protocol": "HTTP", "URI": "http://sandbox.localdomain:2773/"}
            })
        );
    }

    #[test]
    fn test_base_url_normalisation() {
        let timeout = Duration::from_secs(1);

        let client = ExtensionsApiClient::new("127.0.0.1:9001", "ext", timeout).unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:9001");

        let client = ExtensionsApiClient::new("http://127.0.0.1:9001/", "ext", timeout).unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:9001");
        assert_eq!(client.extension_name(), "ext");
    }

    #[test]
    fn test_api_error_display() {
        let err = ApiError::Status {
            operation: "register",
            status: 500,
            body: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "register returned 500: boom");

        let err = ApiError::MissingHeader {
            operation: "register",
            header: EXTENSION_ID_HEADER,
        };
        assert!(err.to_string().contains("Lambda-Extension-Identifier"));
    }
}
