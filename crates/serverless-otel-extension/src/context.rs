//! Process-wide extension context.
//!
//! Holds the identifier assigned by the Extensions API at registration time
//! and the execution identifier generated when the process starts. The context
//! is constructed once by the runtime and shared with every task through an
//! `Arc`.

use parking_lot::Mutex;
use uuid::Uuid;

/// Identity of this extension instance.
#[derive(Debug)]
pub struct ExtensionContext {
    extension_id: Mutex<Option<String>>,
    execution_id: String,
}

impl ExtensionContext {
    /// Creates a context with a freshly generated execution identifier.
    pub fn new() -> Self {
        Self::with_execution_id(Uuid::new_v4().to_string())
    }

    /// Creates a context with a fixed execution identifier.
    pub fn with_execution_id(execution_id: impl Into<String>) -> Self {
        Self {
            extension_id: Mutex::new(None),
            execution_id: execution_id.into(),
        }
    }

    /// Stores the identifier returned by the Extensions API.
    ///
    /// Returns the previously stored identifier, if any. Registration happens
    /// once per process, so a replaced value indicates a second registration.
    pub fn set_extension_id(&self, extension_id: impl Into<String>) -> Option<String> {
        let extension_id = extension_id.into();
        let mut guard = self.extension_id.lock();

        tracing::debug!(extension_id = %extension_id, "Setting extension identifier");
        if let Some(previous) = guard.as_deref()
            && previous != extension_id
        {
            tracing::warn!(
                previous = %previous,
                extension_id = %extension_id,
                "Replacing previously assigned extension identifier"
            );
        }

        guard.replace(extension_id)
    }

    /// Returns the identifier assigned at registration, if registration has completed.
    pub fn extension_id(&self) -> Option<String> {
        self.extension_id.lock().clone()
    }

    /// Returns the execution identifier of this process.
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }
}

impl Default for ExtensionContext {
    fn default() -> Self {
        Self::new()
    }
}
