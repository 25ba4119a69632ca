//! `ServiceError`: the §7 error-kind taxonomy every public operation on
//! [`crate::manager::TaskManager`] surfaces through. Component-local
//! `thiserror` enums (`WorkspaceError`, `BackendError`, `ToolError`,
//! `EventBusError`, `taskstore::StoreError`) convert into this via `From`;
//! everything above the component boundary (Dispatcher, Task Manager, CLI)
//! works in terms of `ServiceError` or `eyre::Result`.

use thiserror::Error;

use crate::backend::BackendError;
use crate::eventbus::EventBusError;
use crate::tools::{ToolError, ToolErrorKind};
use crate::workspace::WorkspaceError;

/// The error-kind taxonomy from spec §7. Not every kind maps to a distinct
/// Rust type upstream of here — `Cancelled` in particular is a terminal
/// [`crate::domain::TaskStatus`], not a thrown error, but call sites that
/// need to report "the task was cancelled" as an operation result use this
/// variant.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("task {0} has already reached a terminal state")]
    AlreadyTerminal(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("tool budget exhausted: {0}")]
    ToolBudgetExhausted(String),

    #[error("task {0} was cancelled")]
    Cancelled(String),

    #[error("internal fault: {0}")]
    Fatal(String),
}

impl ServiceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::Transient(_))
    }
}

impl From<taskstore::StoreError> for ServiceError {
    fn from(err: taskstore::StoreError) -> Self {
        match err {
            taskstore::StoreError::AlreadyExists(id) => {
                ServiceError::Validation(format!("record {id} already exists"))
            }
            taskstore::StoreError::NotFound(id) => ServiceError::NotFound(id),
            taskstore::StoreError::Transient(msg) => ServiceError::Transient(msg),
            taskstore::StoreError::Fatal(msg) => ServiceError::Fatal(msg),
            taskstore::StoreError::Serde(err) => ServiceError::Fatal(err.to_string()),
        }
    }
}

impl From<WorkspaceError> for ServiceError {
    fn from(err: WorkspaceError) -> Self {
        ServiceError::Fatal(err.to_string())
    }
}

impl From<BackendError> for ServiceError {
    fn from(err: BackendError) -> Self {
        if err.is_retryable() {
            ServiceError::Transient(err.to_string())
        } else {
            ServiceError::Fatal(err.to_string())
        }
    }
}

impl From<ToolError> for ServiceError {
    fn from(err: ToolError) -> Self {
        if err.retryable {
            ServiceError::Transient(err.to_string())
        } else {
            match err.kind {
                ToolErrorKind::RateLimited | ToolErrorKind::BudgetExhausted => {
                    ServiceError::ToolBudgetExhausted(err.to_string())
                }
                ToolErrorKind::Network | ToolErrorKind::InvalidResponse | ToolErrorKind::Timeout => {
                    ServiceError::Fatal(err.to_string())
                }
            }
        }
    }
}

impl From<EventBusError> for ServiceError {
    fn from(err: EventBusError) -> Self {
        ServiceError::AlreadyTerminal(err.to_string())
    }
}
