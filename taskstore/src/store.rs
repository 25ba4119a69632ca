//! The [`StoreBackend`] trait every persistence backend implements, plus the
//! small result types `list`/`list_filtered` return.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::record::{Filter, Record};

/// A page of records plus the total count matching the query (ignoring
/// `limit`/`offset`), so callers can render pagination without a second count
/// query.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub records: Vec<T>,
    pub total: usize,
}

/// Durable persistence for one record type `T`.
///
/// Implementations must be safe under concurrent readers and a single active
/// writer per record id — the typical caller is one dispatcher task per
/// `task_id`, so cross-id writes may be fully concurrent but same-id writes
/// are expected to be serialized by the caller, not by the backend.
#[async_trait]
pub trait StoreBackend<T: Record>: Send + Sync {
    /// Insert a new record. Fails [`StoreError::AlreadyExists`] if `record.id()`
    /// is already present.
    async fn create(&self, record: T) -> Result<(), StoreError>;

    /// Replace a record wholesale. Fails [`StoreError::NotFound`] if absent.
    ///
    /// There is no partial-patch API at this layer: callers read the current
    /// record, mutate their copy, and call `update` with the full value. This
    /// matches how every call site in this workspace actually uses the store.
    async fn update(&self, record: T) -> Result<(), StoreError>;

    /// Fetch one record by id.
    async fn get(&self, id: &str) -> Result<T, StoreError>;

    /// Reverse-chronological page by `created_at`.
    async fn list(&self, limit: usize, offset: usize) -> Result<Page<T>, StoreError>;

    /// Same as `list`, restricted to records matching every filter.
    async fn list_filtered(&self, filters: &[Filter], limit: usize, offset: usize) -> Result<Page<T>, StoreError>;

    /// Remove a record. Fails [`StoreError::NotFound`] if absent.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}
