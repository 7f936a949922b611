//! One-shot readiness gates.
//!
//! A [`Gate`] is signalled at most once and releases every current and future
//! waiter with the signalled value. Gates order the extension's startup: the
//! listeners open their gates once bound, registration waits on them, and the
//! event loop waits on the registration gates.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

/// One-shot broadcast signal carrying a value.
#[derive(Debug)]
pub struct Gate<T = ()> {
    name: &'static str,
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> Gate<T> {
    /// Creates an unset gate.
    pub fn new(name: &'static str) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { name, tx }
    }

    /// Returns the gate's name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Opens the gate with `value`.
    ///
    /// Returns `false` without changing the stored value if the gate was
    /// already open.
    pub fn signal(&self, value: T) -> bool {
        let mut value = Some(value);
        let applied = self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = value.take();
            true
        });

        if applied {
            tracing::debug!(gate = self.name, "Gate opened");
        } else {
            tracing::debug!(gate = self.name, "Gate already open, ignoring signal");
        }
        applied
    }

    /// Returns whether the gate has been opened.
    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Returns the signalled value without waiting.
    pub fn get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// Waits until the gate is opened and returns the signalled value.
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        loop {
            if let Some(value) = rx.borrow_and_update().as_ref() {
                return value.clone();
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// The four gates that order the extension's startup.
#[derive(Debug)]
pub struct ReadinessGates {
    /// Telemetry relay listener is bound; carries its local address.
    pub telemetry_server_ready: Gate<SocketAddr>,
    /// Log listener is bound; carries its local address.
    pub log_server_ready: Gate<SocketAddr>,
    /// Extensions API registration completed and the extension id is stored.
    pub lifecycle_registered: Gate,
    /// Logs API subscription completed.
    pub log_delivery_registered: Gate,
}

impl ReadinessGates {
    /// Creates a set of unopened gates.
    pub fn new() -> Self {
        Self {
            telemetry_server_ready: Gate::new("telemetry_server_ready"),
            log_server_ready: Gate::new("log_server_ready"),
            lifecycle_registered: Gate::new("lifecycle_registered"),
            log_delivery_registered: Gate::new("log_delivery_registered"),
        }
    }

    /// Creates a new set of gates wrapped in an `Arc`.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Waits until both registrations have completed.
    pub async fn wait_registered(&self) {
        tokio::join!(
            self.lifecycle_registered.wait(),
            self.log_delivery_registered.wait()
        );
    }
}

impl Default for ReadinessGates {
    fn default() -> Self {
        Self::new()
    }
}
