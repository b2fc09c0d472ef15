//! Integration adapter contract.
//!
//! The orchestrator hands outside work (issue creation, generation runs) to an
//! [`IntegrationAdapter`] and gets back a handle immediately. Results arrive
//! later through `Orchestrator::on_operation_result`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

/// Correlates an invocation with its eventual result.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationHandle(pub String);

impl OperationHandle {
    /// A fresh handle.
    pub fn new() -> Self {
        Self(format!("op_{}", ulid::Ulid::new()))
    }
}

impl Default for OperationHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Invocation failures reported synchronously by the adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    /// The adapter does not know this operation
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// The call was refused or could not be sent
    #[error("operation failed: {message}")]
    Failed {
        /// Description
        message: String,
        /// Worth trying again later
        retryable: bool,
    },
}

impl AdapterError {
    /// Whether the scheduler should retry the owning task.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::Failed { retryable: true, .. })
    }
}

/// Asynchronous outcome of an invoked operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OperationResult {
    /// Finished successfully
    Succeeded {
        /// Operation output
        #[serde(default)]
        output: serde_json::Value,
    },
    /// Finished with an error
    Failed {
        /// Error message
        message: String,
    },
}

/// Outside work triggered by the orchestrator.
///
/// Implementations must return quickly; long-running work continues in the
/// background and reports back through its handle.
#[async_trait]
pub trait IntegrationAdapter: Send + Sync {
    /// Start `operation` with `payload`.
    async fn invoke(&self, operation: &str, payload: serde_json::Value) -> Result<OperationHandle, AdapterError>;
}

/// A recorded call to [`RecordingAdapter`].
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// Returned handle
    pub handle: OperationHandle,
    /// Operation name
    pub operation: String,
    /// Payload
    pub payload: serde_json::Value,
}

/// Adapter that accepts every call and remembers it.
///
/// Used by the CLI, where results are reported by hand, and by tests.
#[derive(Default, Clone)]
pub struct RecordingAdapter {
    invocations: Arc<Mutex<Vec<Invocation>>>,
    rejected: Arc<Mutex<Vec<(String, AdapterError)>>>,
}

impl RecordingAdapter {
    /// Create an adapter that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every future call to `operation` fail with `error`.
    pub async fn reject(&self, operation: impl Into<String>, error: AdapterError) {
        self.rejected.lock().await.push((operation.into(), error));
    }

    /// Calls seen so far.
    pub async fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().await.clone()
    }
}

#[async_trait]
impl IntegrationAdapter for RecordingAdapter {
    async fn invoke(&self, operation: &str, payload: serde_json::Value) -> Result<OperationHandle, AdapterError> {
        if let Some((_, error)) = self.rejected.lock().await.iter().find(|(op, _)| op == operation) {
            return Err(error.clone());
        }

        let handle = OperationHandle::new();
        debug!("Invoked {} as {}", operation, handle);
        self.invocations.lock().await.push(Invocation {
            handle: handle.clone(),
            operation: operation.to_string(),
            payload,
        });
        Ok(handle)
    }
}
