//! Neutral action dispatch (spec §4.4): the only component allowed to block
//! on external I/O without going through the Tool Invoker.
//!
//! Grounded on the teacher's `Tool` trait shape (`async_trait`, scoped
//! execution context, structured result), generalized from file/bash tools
//! to device actions against a sandbox or local display.

mod local;
mod mock;

pub use local::LocalNullBackend;
pub use mock::MockBackend;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::domain::BackendAction;

/// Per-call timeout for backend actions (spec §5: 30s default).
pub const BACKEND_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Max transient-error retries a `Backend` implementation performs before
/// surfacing the failure (spec §4.4: "up to 2x").
pub const MAX_TRANSIENT_RETRIES: u32 = 2;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend action timed out after {0:?}")]
    Timeout(Duration),

    #[error("transient transport error: {0}")]
    Transient(String),

    #[error("backend cancelled")]
    Cancelled,

    #[error("backend fault: {0}")]
    Fault(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Timeout(_) | BackendError::Transient(_))
    }
}

/// Outcome of one action execution. Logical failures (missing element,
/// permission denied) surface as `success: false`, not as a `BackendError`
/// — only transport-level failures are errors (spec §4.4).
#[derive(Debug, Clone)]
pub struct BackendResult {
    pub success: bool,
    pub observation: Option<Vec<u8>>,
    pub error: Option<String>,
}

impl BackendResult {
    pub fn ok(observation: Option<Vec<u8>>) -> Self {
        Self {
            success: true,
            observation,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            observation: None,
            error: Some(error.into()),
        }
    }
}

/// The sandbox/device backend interface. Real hardware/sandbox backends are
/// out of scope (spec §1); this crate ships test/demo-grade implementations
/// only.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Execute one neutral action, honoring `cancel` and the per-call
    /// timeout. Implementations retry only transient transport errors, up
    /// to [`MAX_TRANSIENT_RETRIES`] times.
    async fn execute(&self, action: &BackendAction, cancel: &CancellationToken) -> Result<BackendResult, BackendError>;

    /// Release a sandbox/device resource (spec §5 cancellation semantics:
    /// invoked when `destroy_sandbox_on_exit` is set). No-op for backends
    /// with no external resource to release.
    async fn release_sandbox(&self, _sandbox_id: &str) -> Result<(), BackendError> {
        Ok(())
    }

    /// Provision a sandbox of the given shape, returning its id. Real
    /// hardware/cloud provisioning is out of scope; implementations here
    /// hand back a synthetic id so the Task Manager's `create_sandbox`
    /// surface has something to call.
    async fn create_sandbox(&self, shape: &str) -> Result<String, BackendError> {
        Ok(format!("sandbox-{shape}-{}", uuid::Uuid::new_v4()))
    }
}

/// Wraps a single execution attempt in the shared timeout/cancellation
/// handling every `Backend` impl needs, so implementations only write the
/// actual device logic.
pub async fn with_backend_timeout<F, Fut>(cancel: &CancellationToken, f: F) -> Result<BackendResult, BackendError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<BackendResult, BackendError>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(BackendError::Cancelled),
        result = tokio::time::timeout(BACKEND_CALL_TIMEOUT, f()) => {
            result.unwrap_or(Err(BackendError::Timeout(BACKEND_CALL_TIMEOUT)))
        }
    }
}
