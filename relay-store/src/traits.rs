use async_trait::async_trait;
use relay_common::Result;
use serde_json::{Map, Value};
use std::fmt;

/// Identity of one row within a table.
///
/// `partition` groups rows belonging to one conversation; `sort` orders them.
/// Single-row records (one per partition) use sort 0.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowKey {
    pub partition: String,
    pub sort: i64,
}

impl RowKey {
    /// Key for a record that exists once per partition.
    pub fn single(partition: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort: 0,
        }
    }

    /// Key for one entry in an ordered partition.
    pub fn indexed(partition: impl Into<String>, sort: i64) -> Self {
        Self {
            partition: partition.into(),
            sort,
        }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.partition, self.sort)
    }
}

/// Which rows a delete applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowSelector {
    /// Exactly one row.
    Exact(RowKey),
    /// Every row in the partition.
    Partition(String),
    /// Rows in the partition whose sort key is strictly below the bound.
    Before { partition: String, sort: i64 },
}

/// Ordering and size of a partition scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RangeQuery {
    pub limit: Option<usize>,
    pub descending: bool,
}

impl RangeQuery {
    /// Whole partition, oldest first.
    pub fn all() -> Self {
        Self::default()
    }

    /// The `limit` highest sort keys, newest first.
    pub fn latest(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            descending: true,
        }
    }
}

/// A stored row as returned by a scan.
///
/// `record` is untyped on purpose; callers decode it into their own schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub key: RowKey,
    pub record: Value,
}

/// Durable keyed row storage.
///
/// Implementations must make each single-row write atomic. `insert_row` must
/// reject an existing key with `Error::Conflict`, and `increment_field` must
/// not lose updates when called concurrently for the same key. Engine
/// failures surface as `Error::StoreUnavailable`; nothing is retried here.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Backend name
    fn name(&self) -> &str;

    /// Fetch one record.
    async fn get_row(&self, table: &str, key: &RowKey) -> Result<Option<Value>>;

    /// Create or fully replace one record.
    async fn put_row(&self, table: &str, key: &RowKey, record: Value) -> Result<()>;

    /// Create a record, failing with `Error::Conflict` if the key is taken.
    async fn insert_row(&self, table: &str, key: &RowKey, record: Value) -> Result<()>;

    /// Merge fields into a record, creating it if absent.
    ///
    /// A `null` value removes the field. Returns the merged record.
    async fn merge_row(&self, table: &str, key: &RowKey, patch: Map<String, Value>)
        -> Result<Value>;

    /// Atomically add `delta` to an integer field, creating the record and the
    /// field (starting from 0) if absent. Returns the new value.
    async fn increment_field(&self, table: &str, key: &RowKey, field: &str, delta: i64)
        -> Result<i64>;

    /// Delete the selected rows, returning how many were removed.
    async fn delete_rows(&self, table: &str, selector: &RowSelector) -> Result<usize>;

    /// Scan one partition ordered by sort key.
    async fn query_range(&self, table: &str, partition: &str, query: RangeQuery)
        -> Result<Vec<Row>>;

    /// Health check
    async fn health_check(&self) -> bool;
}
