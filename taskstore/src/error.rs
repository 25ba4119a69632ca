use thiserror::Error;

/// Errors surfaced by any [`crate::StoreBackend`] backend.
///
/// Mirrors the error-kind taxonomy the service layer expects (`NotFound`,
/// `AlreadyExists` map onto `Validation`/`NotFound` at the call site;
/// `Transient`/`Fatal` map directly).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {0} already exists")]
    AlreadyExists(String),

    #[error("record {0} not found")]
    NotFound(String),

    #[error("transient store error: {0}")]
    Transient(String),

    #[error("store error: {0}")]
    Fatal(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether this error represents a transient condition the caller may
    /// retry after backing off.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}
