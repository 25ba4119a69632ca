//! SQLite-backed [`StoreBackend`].
//!
//! One table per `Record::collection_name()`, with `indexed_fields()`
//! flattened into queryable columns is overkill for this workspace's single
//! `Task` record type, so indexed fields are stored as a JSON side-column and
//! filtered in Rust after the row scan — simple, and the row counts in this
//! domain (tasks per process) never justify a real query planner.
//!
//! Schema is created idempotently at `open()` and tracked in
//! `schema_migrations(version, applied_at)` so future column additions can be
//! applied in order without a separate migration tool.

use std::marker::PhantomData;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::Connection;

use crate::error::StoreError;
use crate::record::{Filter, IndexValue, Record};
use crate::store::{Page, StoreBackend};

const RETRY_BACKOFFS_MS: [u64; 3] = [100, 400, 1600];

/// Runs once at `open()`: creates `schema_migrations` and the collection
/// table if they don't exist yet, then records this version as applied.
const SCHEMA_VERSION: i64 = 1;

pub struct SqliteStore<T> {
    conn: Arc<Mutex<Connection>>,
    _marker: PhantomData<T>,
}

impl<T: Record> SqliteStore<T> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::Fatal(e.to_string()))?;
        Self::migrate(&conn, T::collection_name())?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            _marker: PhantomData,
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Fatal(e.to_string()))?;
        Self::migrate(&conn, T::collection_name())?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            _marker: PhantomData,
        })
    }

    fn migrate(conn: &Connection, table: &str) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            );",
        )
        .map_err(|e| StoreError::Fatal(e.to_string()))?;

        let applied: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM schema_migrations WHERE version = ?1",
                [SCHEMA_VERSION],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::Fatal(e.to_string()))?;

        if applied == 0 {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    indexed TEXT NOT NULL,
                    data TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS {table}_created_at_idx ON {table}(created_at);"
            ))
            .map_err(|e| StoreError::Fatal(e.to_string()))?;

            conn.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![SCHEMA_VERSION, crate::record::now_ms()],
            )
            .map_err(|e| StoreError::Fatal(e.to_string()))?;
        }
        Ok(())
    }

    /// Runs `f` against the locked connection on a blocking-pool thread,
    /// retrying transient busy/locked errors up to three times with the
    /// 100/400/1600ms backoff the State Store contract specifies.
    /// Non-transient errors surface immediately, with the raw
    /// `rusqlite::Error` intact so callers can distinguish e.g. "no such
    /// row" from a genuine storage fault. The whole loop, sleeps included,
    /// runs inside `spawn_blocking` so a contested write never parks a
    /// tokio worker thread.
    async fn with_retry<R, F>(&self, mut f: F) -> rusqlite::Result<R>
    where
        R: Send + 'static,
        F: FnMut(&Connection) -> rusqlite::Result<R> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("SqliteStore connection lock poisoned");
            let mut attempt = 0;
            loop {
                match f(&conn) {
                    Ok(value) => return Ok(value),
                    Err(e) if is_transient(&e) && attempt < RETRY_BACKOFFS_MS.len() => {
                        std::thread::sleep(Duration::from_millis(RETRY_BACKOFFS_MS[attempt]));
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
        .await
        .expect("sqlite worker thread panicked")
    }

    fn row_to_record(data: String) -> Result<T, StoreError> {
        serde_json::from_str(&data).map_err(StoreError::from)
    }
}

fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}

#[async_trait]
impl<T: Record> StoreBackend<T> for SqliteStore<T> {
    async fn create(&self, record: T) -> Result<(), StoreError> {
        let table = T::collection_name();
        let id = record.id().to_string();
        let created_at = record.created_at();
        let updated_at = record.updated_at();
        let indexed = serde_json::to_string(&index_map(&record.indexed_fields()))?;
        let data = serde_json::to_string(&record)?;

        let existing = self.get(&id).await;
        if existing.is_ok() {
            return Err(StoreError::AlreadyExists(id));
        }

        self.with_retry(move |conn| {
            conn.execute(
                &format!("INSERT INTO {table} (id, created_at, updated_at, indexed, data) VALUES (?1, ?2, ?3, ?4, ?5)"),
                rusqlite::params![id, created_at, updated_at, indexed, data],
            )
        })
        .await
        .map_err(sql_err)?;
        Ok(())
    }

    async fn update(&self, record: T) -> Result<(), StoreError> {
        let table = T::collection_name();
        let id = record.id().to_string();
        let update_id = id.clone();
        let updated_at = record.updated_at();
        let indexed = serde_json::to_string(&index_map(&record.indexed_fields()))?;
        let data = serde_json::to_string(&record)?;

        let changed = self
            .with_retry(move |conn| {
                conn.execute(
                    &format!("UPDATE {table} SET updated_at = ?1, indexed = ?2, data = ?3 WHERE id = ?4"),
                    rusqlite::params![updated_at, indexed, data, update_id],
                )
            })
            .await
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<T, StoreError> {
        let table = T::collection_name();
        let id = id.to_string();
        let query_id = id.clone();
        let data = self
            .with_retry(move |conn| {
                conn.query_row(&format!("SELECT data FROM {table} WHERE id = ?1"), [&query_id], |row| {
                    row.get::<_, String>(0)
                })
            })
            .await;
        let data = match data {
            Ok(data) => data,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Err(StoreError::NotFound(id)),
            Err(e) => return Err(sql_err(e)),
        };
        Self::row_to_record(data)
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Page<T>, StoreError> {
        self.list_filtered(&[], limit, offset).await
    }

    async fn list_filtered(&self, filters: &[Filter], limit: usize, offset: usize) -> Result<Page<T>, StoreError> {
        let table = T::collection_name();
        let rows: Vec<(String, String)> = self
            .with_retry(move |conn| {
                let mut stmt = conn.prepare(&format!("SELECT indexed, data FROM {table} ORDER BY created_at DESC"))?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(sql_err)?;

        let mut matching = Vec::new();
        for (indexed_json, data) in rows {
            let indexed: std::collections::HashMap<String, IndexValue> =
                serde_json::from_str::<std::collections::HashMap<String, String>>(&indexed_json)
                    .map(|m| m.into_iter().map(|(k, v)| (k, IndexValue::String(v))).collect())
                    .unwrap_or_default();
            if filters.iter().all(|f| f.matches(&indexed)) {
                matching.push(Self::row_to_record(data)?);
            }
        }
        let total = matching.len();
        let records = matching.into_iter().skip(offset).take(limit).collect();
        Ok(Page { records, total })
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let table = T::collection_name();
        let id = id.to_string();
        let delete_id = id.clone();
        let changed = self
            .with_retry(move |conn| conn.execute(&format!("DELETE FROM {table} WHERE id = ?1"), [&delete_id]))
            .await
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }
}

/// Maps a raw rusqlite error to the store taxonomy: busy/locked surfaces as
/// [`StoreError::Transient`] (the caller already exhausted retries to get
/// here), anything else is a [`StoreError::Fatal`] storage fault.
fn sql_err(err: rusqlite::Error) -> StoreError {
    if is_transient(&err) {
        StoreError::Transient(err.to_string())
    } else {
        StoreError::Fatal(err.to_string())
    }
}

fn index_map(fields: &std::collections::HashMap<String, IndexValue>) -> std::collections::HashMap<String, String> {
    fields.iter().map(|(k, v)| (k.clone(), v.to_sql_text())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::IndexValue;
    use std::collections::HashMap as Map;

    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
    struct Thing {
        id: String,
        created_at: i64,
        updated_at: i64,
        status: String,
    }

    impl Record for Thing {
        fn id(&self) -> &str {
            &self.id
        }
        fn created_at(&self) -> i64 {
            self.created_at
        }
        fn updated_at(&self) -> i64 {
            self.updated_at
        }
        fn collection_name() -> &'static str {
            "things"
        }
        fn indexed_fields(&self) -> Map<String, IndexValue> {
            let mut m = Map::new();
            m.insert("status".to_string(), IndexValue::String(self.status.clone()));
            m
        }
    }

    fn thing(id: &str, created_at: i64, status: &str) -> Thing {
        Thing {
            id: id.to_string(),
            created_at,
            updated_at: created_at,
            status: status.to_string(),
        }
    }

    #[tokio::test]
    async fn create_then_get_roundtrips() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create(thing("a", 1, "pending")).await.unwrap();
        let got = store.get("a").await.unwrap();
        assert_eq!(got, thing("a", 1, "pending"));
    }

    #[tokio::test]
    async fn create_rejects_duplicate() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create(thing("a", 1, "pending")).await.unwrap();
        let err = store.create(thing("a", 2, "pending")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn update_rejects_missing() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store.update(thing("missing", 1, "pending")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store.get("missing").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_orders_reverse_chronologically() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create(thing("a", 1, "pending")).await.unwrap();
        store.create(thing("b", 3, "pending")).await.unwrap();
        store.create(thing("c", 2, "pending")).await.unwrap();

        let page = store.list(10, 0).await.unwrap();
        let ids: Vec<&str> = page.records.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn list_filtered_matches_status() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create(thing("a", 1, "running")).await.unwrap();
        store.create(thing("b", 2, "completed")).await.unwrap();

        let page = store
            .list_filtered(
                &[Filter::eq("status", IndexValue::String("completed".to_string()))],
                10,
                0,
            )
            .await
            .unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].id, "b");
    }

    #[tokio::test]
    async fn reopening_the_same_file_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        {
            let store = SqliteStore::<Thing>::open(&path).unwrap();
            store.create(thing("a", 1, "pending")).await.unwrap();
        }
        let store = SqliteStore::<Thing>::open(&path).unwrap();
        let got = store.get("a").await.unwrap();
        assert_eq!(got.id, "a");
    }
}
