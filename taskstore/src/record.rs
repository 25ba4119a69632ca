//! The `Record` trait every persisted entity implements, plus the small
//! indexed-field vocabulary the store backends use to answer filtered
//! queries without deserializing every row.

use std::collections::HashMap;

use serde::{Serialize, de::DeserializeOwned};

/// A value that can be indexed and compared for filtering.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexValue {
    String(String),
    Int(i64),
    Bool(bool),
}

impl IndexValue {
    pub(crate) fn to_sql_text(&self) -> String {
        match self {
            IndexValue::String(s) => s.clone(),
            IndexValue::Int(i) => i.to_string(),
            IndexValue::Bool(b) => b.to_string(),
        }
    }
}

/// Comparison operator for a `Filter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
}

/// A single equality/inequality filter over an indexed field.
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: IndexValue,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: IndexValue) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            value,
        }
    }

    pub(crate) fn matches(&self, fields: &HashMap<String, IndexValue>) -> bool {
        let actual = fields.get(&self.field);
        match self.op {
            FilterOp::Eq => actual == Some(&self.value),
            FilterOp::Ne => actual != Some(&self.value),
        }
    }
}

/// A durable record. Any type stored through [`crate::StoreBackend`] must be
/// `Clone + Send + Sync + Serialize + DeserializeOwned` and implement this
/// trait so the store can place it in a collection, order it, and answer
/// indexed queries without knowing its shape.
pub trait Record: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Stable identifier, unique within the record's collection.
    fn id(&self) -> &str;

    /// Creation timestamp (Unix milliseconds). Used for reverse-chronological
    /// `list()` ordering.
    fn created_at(&self) -> i64;

    /// Last-write timestamp (Unix milliseconds).
    fn updated_at(&self) -> i64;

    /// Table / collection name this record type is stored under.
    fn collection_name() -> &'static str;

    /// Fields the store should index for filtered queries (status, etc).
    fn indexed_fields(&self) -> HashMap<String, IndexValue>;
}

/// Current time in Unix milliseconds, matching the teacher's `now_ms()` helper.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
