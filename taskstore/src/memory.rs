//! In-memory [`StoreBackend`]: a guarded map plus an auxiliary sorted index
//! for reverse-chronological `list()`.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::record::{Filter, Record};
use crate::store::{Page, StoreBackend};

struct Inner<T> {
    records: std::collections::HashMap<String, T>,
    /// (created_at, id) so iterating in reverse order yields newest-first
    /// without re-sorting on every `list()` call.
    by_created_at: BTreeMap<(i64, String), ()>,
}

/// A process-local store backed by a `RwLock<HashMap<..>>`. Writes are
/// synchronous; there is no durability across restarts.
pub struct MemoryStore<T> {
    inner: RwLock<Inner<T>>,
}

impl<T: Record> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                records: std::collections::HashMap::new(),
                by_created_at: BTreeMap::new(),
            }),
        }
    }
}

impl<T: Record> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Record> StoreBackend<T> for MemoryStore<T> {
    async fn create(&self, record: T) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("MemoryStore lock poisoned");
        if inner.records.contains_key(record.id()) {
            return Err(StoreError::AlreadyExists(record.id().to_string()));
        }
        inner
            .by_created_at
            .insert((record.created_at(), record.id().to_string()), ());
        inner.records.insert(record.id().to_string(), record);
        Ok(())
    }

    async fn update(&self, record: T) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("MemoryStore lock poisoned");
        if !inner.records.contains_key(record.id()) {
            return Err(StoreError::NotFound(record.id().to_string()));
        }
        inner.records.insert(record.id().to_string(), record);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<T, StoreError> {
        let inner = self.inner.read().expect("MemoryStore lock poisoned");
        inner
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Page<T>, StoreError> {
        self.list_filtered(&[], limit, offset).await
    }

    async fn list_filtered(&self, filters: &[Filter], limit: usize, offset: usize) -> Result<Page<T>, StoreError> {
        let inner = self.inner.read().expect("MemoryStore lock poisoned");
        let matching: Vec<&T> = inner
            .by_created_at
            .keys()
            .rev()
            .filter_map(|(_, id)| inner.records.get(id))
            .filter(|r| filters.iter().all(|f| f.matches(&r.indexed_fields())))
            .collect();
        let total = matching.len();
        let records = matching.into_iter().skip(offset).take(limit).cloned().collect();
        Ok(Page { records, total })
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("MemoryStore lock poisoned");
        let record = inner
            .records
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        inner.by_created_at.remove(&(record.created_at(), id.to_string()));
        Ok(())
    }
}
