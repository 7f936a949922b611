//! Shared test utilities for serverless-otel-extension integration tests.
//!
//! Provides an in-process mock of the Lambda Runtime API (Extensions API and
//! Logs API), a recording mock collector, and event-driven waiting helpers
//! used instead of arbitrary sleeps.

#![allow(dead_code)]

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use parking_lot::Mutex;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Identifier the mock Runtime API assigns on registration.
pub const MOCK_EXTENSION_ID: &str = "ext-0b4c-mock";

/// A request captured by one of the mock servers.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Request path.
    pub path: String,
    /// Request headers.
    pub headers: HeaderMap,
    /// Request body parsed as JSON, `Value::Null` if it was not JSON.
    pub body: Value,
}

impl RecordedRequest {
    fn new(uri: &Uri, headers: HeaderMap, body: &[u8]) -> Self {
        Self {
            path: uri.path().to_string(),
            headers,
            body: serde_json::from_slice(body).unwrap_or(Value::Null),
        }
    }

    /// Returns a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

struct RuntimeApiState {
    register_status: StatusCode,
    subscribe_status: StatusCode,
    calls: Mutex<Vec<&'static str>>,
    register_requests: Mutex<Vec<RecordedRequest>>,
    subscribe_requests: Mutex<Vec<RecordedRequest>>,
    next_requests: Mutex<Vec<RecordedRequest>>,
    next_calls: AtomicUsize,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>,
}

/// Builder for [`MockRuntimeApi`].
pub struct MockRuntimeApiBuilder {
    register_status: StatusCode,
    subscribe_status: StatusCode,
}

impl MockRuntimeApiBuilder {
    /// Sets the status returned by the register endpoint.
    pub fn register_status(mut self, status: StatusCode) -> Self {
        self.register_status = status;
        self
    }

    /// Sets the status returned by the Logs API subscribe endpoint.
    pub fn subscribe_status(mut self, status: StatusCode) -> Self {
        self.subscribe_status = status;
        self
    }

    /// Starts the mock on an ephemeral loopback port.
    pub async fn start(self) -> MockRuntimeApi {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RuntimeApiState {
            register_status: self.register_status,
            subscribe_status: self.subscribe_status,
            calls: Mutex::new(Vec::new()),
            register_requests: Mutex::new(Vec::new()),
            subscribe_requests: Mutex::new(Vec::new()),
            next_requests: Mutex::new(Vec::new()),
            next_calls: AtomicUsize::new(0),
            events: tokio::sync::Mutex::new(events_rx),
        });

        let app = Router::new()
            .route("/2020-01-01/extension/register", post(handle_register))
            .route("/2020-01-01/extension/event/next", get(handle_next))
            .route("/2020-08-15/logs", put(handle_subscribe))
            .with_state(Arc::clone(&state));

        let (addr, cancel) = serve(app).await;

        MockRuntimeApi {
            addr,
            state,
            events: events_tx,
            cancel,
        }
    }
}

/// In-process mock of the Extensions API and Logs API.
///
/// The next-event endpoint blocks until an event is queued with
/// [`MockRuntimeApi::push_event`], mirroring the platform's long poll.
pub struct MockRuntimeApi {
    addr: SocketAddr,
    state: Arc<RuntimeApiState>,
    events: mpsc::UnboundedSender<Value>,
    cancel: CancellationToken,
}

impl MockRuntimeApi {
    /// Returns a builder with `200 OK` for every endpoint.
    pub fn builder() -> MockRuntimeApiBuilder {
        MockRuntimeApiBuilder {
            register_status: StatusCode::OK,
            subscribe_status: StatusCode::OK,
        }
    }

    /// Starts a mock that accepts every request.
    pub async fn start() -> Self {
        Self::builder().start().await
    }

    /// Returns the `host:port` authority, as found in `AWS_LAMBDA_RUNTIME_API`.
    pub fn authority(&self) -> String {
        self.addr.to_string()
    }

    /// Queues an event for the next-event endpoint.
    pub fn push_event(&self, event: Value) {
        let _ = self.events.send(event);
    }

    /// Queues an `INVOKE` event.
    pub fn push_invoke(&self, request_id: &str) {
        self.push_event(serde_json::json!({
            "eventType": "INVOKE",
            "deadlineMs": 1_654_468_766_618_u64,
            "requestId": request_id,
            "invokedFunctionArn": "arn:aws:lambda:us-east-1:123456789012:function:test",
        }));
    }

    /// Queues a `SHUTDOWN` event.
    pub fn push_shutdown(&self, reason: &str) {
        self.push_event(serde_json::json!({
            "eventType": "SHUTDOWN",
            "deadlineMs": 1_654_469_121_614_u64,
            "shutdownReason": reason,
        }));
    }

    /// Returns the endpoints called so far, in order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.state.calls.lock().clone()
    }

    /// Returns the number of next-event requests received.
    pub fn next_calls(&self) -> usize {
        self.state.next_calls.load(Ordering::SeqCst)
    }

    /// Returns the registration requests received.
    pub fn register_requests(&self) -> Vec<RecordedRequest> {
        self.state.register_requests.lock().clone()
    }

    /// Returns the Logs API subscription requests received.
    pub fn subscribe_requests(&self) -> Vec<RecordedRequest> {
        self.state.subscribe_requests.lock().clone()
    }

    /// Returns the next-event requests received.
    pub fn next_requests(&self) -> Vec<RecordedRequest> {
        self.state.next_requests.lock().clone()
    }
}

impl Drop for MockRuntimeApi {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn handle_register(
    State(state): State<Arc<RuntimeApiState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.calls.lock().push("register");
    state
        .register_requests
        .lock()
        .push(RecordedRequest::new(&uri, headers, &body));

    if !state.register_status.is_success() {
        return (state.register_status, "registration rejected").into_response();
    }

    (
        [("Lambda-Extension-Identifier", MOCK_EXTENSION_ID)],
        Json(serde_json::json!({
            "functionName": "test-function",
            "functionVersion": "$LATEST",
            "handler": "index.handler",
        })),
    )
        .into_response()
}

async fn handle_subscribe(
    State(state): State<Arc<RuntimeApiState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.calls.lock().push("subscribe");
    state
        .subscribe_requests
        .lock()
        .push(RecordedRequest::new(&uri, headers, &body));

    if !state.subscribe_status.is_success() {
        return (state.subscribe_status, "subscription rejected").into_response();
    }
    (StatusCode::OK, "OK").into_response()
}

async fn handle_next(
    State(state): State<Arc<RuntimeApiState>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    state.calls.lock().push("next");
    state.next_calls.fetch_add(1, Ordering::SeqCst);
    state
        .next_requests
        .lock()
        .push(RecordedRequest::new(&uri, headers, &[]));

    let event = state.events.lock().await.recv().await;
    match event {
        Some(event) => Json(event).into_response(),
        None => std::future::pending().await,
    }
}

struct CollectorState {
    status: StatusCode,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// Collector that records every request it receives.
pub struct MockCollector {
    addr: SocketAddr,
    state: Arc<CollectorState>,
    cancel: CancellationToken,
}

impl MockCollector {
    /// Starts a collector answering `200 OK`.
    pub async fn start() -> Self {
        Self::start_with_status(StatusCode::OK).await
    }

    /// Starts a collector answering with `status`.
    pub async fn start_with_status(status: StatusCode) -> Self {
        let state = Arc::new(CollectorState {
            status,
            requests: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .fallback(handle_collect)
            .layer(DefaultBodyLimit::disable())
            .with_state(Arc::clone(&state));

        let (addr, cancel) = serve(app).await;
        Self {
            addr,
            state,
            cancel,
        }
    }

    /// Returns the collector's base URL.
    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Returns the requests received so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().clone()
    }

    /// Waits until at least `count` requests have been received.
    pub async fn wait_for_requests(
        &self,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<RecordedRequest>, String> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let requests = self.requests();
            if requests.len() >= count {
                return Ok(requests);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Err(format!(
            "collector received {} of {} requests within {:?}",
            self.requests().len(),
            count,
            timeout
        ))
    }
}

impl Drop for MockCollector {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn handle_collect(
    State(state): State<Arc<CollectorState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    state
        .requests
        .lock()
        .push(RecordedRequest::new(&uri, headers, &body));
    state.status
}

async fn serve(app: Router) -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind mock server");
    let addr = listener.local_addr().expect("Failed to read mock address");

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await;
    });

    (addr, cancel)
}

/// Polls the telemetry relay's health endpoint until it responds successfully.
///
/// # Examples
///
/// ```ignore
/// wait_for_http_ready(addr, Duration::from_secs(5)).await?;
/// ```
pub async fn wait_for_http_ready(addr: SocketAddr, timeout: Duration) -> Result<(), String> {
    let deadline = Instant::now() + timeout;
    let url = format!("http://{}/health", addr);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(100))
        .build()
        .map_err(|e| format!("Failed to create HTTP client: {}", e))?;

    while Instant::now() < deadline {
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                return Ok(());
            }
            _ => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    Err(format!(
        "HTTP server health check timed out after {:?} on {}",
        timeout, addr
    ))
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
