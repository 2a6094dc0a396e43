//! Process-local row store.

use crate::traits::{RangeQuery, Row, RowKey, RowSelector, RowStore};
use async_trait::async_trait;
use relay_common::{Error, Result};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

type Table = BTreeMap<(String, i64), Value>;

/// Row store held in memory. Each write holds the table lock for its whole
/// read-modify-write, which gives the same atomicity as the SQLite engine.
#[derive(Default)]
pub struct InMemoryRowStore {
    tables: RwLock<HashMap<String, Table>>,
}

impl InMemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn slot(key: &RowKey) -> (String, i64) {
    (key.partition.clone(), key.sort)
}

fn object_for(table: &str, key: &RowKey, value: Option<&Value>) -> Result<Map<String, Value>> {
    match value {
        None => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(_) => Err(Error::MalformedRecord(format!(
            "{table}/{key} is not a JSON object"
        ))),
    }
}

#[async_trait]
impl RowStore for InMemoryRowStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_row(&self, table: &str, key: &RowKey) -> Result<Option<Value>> {
        let tables = self.tables.read().await;
        Ok(tables.get(table).and_then(|t| t.get(&slot(key))).cloned())
    }

    async fn put_row(&self, table: &str, key: &RowKey, record: Value) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.entry(table.to_string()).or_default().insert(slot(key), record);
        Ok(())
    }

    async fn insert_row(&self, table: &str, key: &RowKey, record: Value) -> Result<()> {
        let mut tables = self.tables.write().await;
        let rows = tables.entry(table.to_string()).or_default();
        if rows.contains_key(&slot(key)) {
            return Err(Error::Conflict(format!("{table}/{key} already exists")));
        }
        rows.insert(slot(key), record);
        Ok(())
    }

    async fn merge_row(
        &self,
        table: &str,
        key: &RowKey,
        patch: Map<String, Value>,
    ) -> Result<Value> {
        let mut tables = self.tables.write().await;
        let rows = tables.entry(table.to_string()).or_default();
        let mut merged = object_for(table, key, rows.get(&slot(key)))?;
        for (field, value) in patch {
            if value.is_null() {
                merged.remove(&field);
            } else {
                merged.insert(field, value);
            }
        }
        let merged = Value::Object(merged);
        rows.insert(slot(key), merged.clone());
        Ok(merged)
    }

    async fn increment_field(
        &self,
        table: &str,
        key: &RowKey,
        field: &str,
        delta: i64,
    ) -> Result<i64> {
        let mut tables = self.tables.write().await;
        let rows = tables.entry(table.to_string()).or_default();
        let mut record = object_for(table, key, rows.get(&slot(key)))?;
        let base = match record.get(field) {
            None | Some(Value::Null) => 0,
            Some(v) => v.as_i64().ok_or_else(|| {
                Error::MalformedRecord(format!("{table}/{key}: field '{field}' is not an integer"))
            })?,
        };
        let next = base.checked_add(delta).ok_or_else(|| {
            Error::MalformedRecord(format!("{table}/{key}: field '{field}' overflowed"))
        })?;
        record.insert(field.to_string(), Value::from(next));
        rows.insert(slot(key), Value::Object(record));
        Ok(next)
    }

    async fn delete_rows(&self, table: &str, selector: &RowSelector) -> Result<usize> {
        let mut tables = self.tables.write().await;
        let Some(rows) = tables.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        match selector {
            RowSelector::Exact(key) => {
                rows.remove(&slot(key));
            }
            RowSelector::Partition(partition) => rows.retain(|(p, _), _| p != partition),
            RowSelector::Before { partition, sort } => {
                rows.retain(|(p, s), _| !(p == partition && s < sort));
            }
        }
        Ok(before - rows.len())
    }

    async fn query_range(
        &self,
        table: &str,
        partition: &str,
        query: RangeQuery,
    ) -> Result<Vec<Row>> {
        let tables = self.tables.read().await;
        let Some(rows) = tables.get(table) else {
            return Ok(Vec::new());
        };

        let matching = rows
            .range((partition.to_string(), i64::MIN)..=(partition.to_string(), i64::MAX))
            .map(|((p, s), record)| Row {
                key: RowKey::indexed(p.clone(), *s),
                record: record.clone(),
            });

        let limit = query.limit.unwrap_or(usize::MAX);
        let out: Vec<Row> = if query.descending {
            matching.rev().take(limit).collect()
        } else {
            matching.take(limit).collect()
        };
        Ok(out)
    }

    async fn health_check(&self) -> bool {
        true
    }
}
