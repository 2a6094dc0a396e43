//! SQLite-backed row store.
//!
//! All tables share one physical table keyed by
//! `(table_name, partition_key, sort_key)`. Every operation opens its own
//! connection on the blocking pool, and every write runs in a
//! `BEGIN IMMEDIATE` transaction so concurrent writers (tasks or processes)
//! queue on the database lock instead of racing.

use crate::traits::{RangeQuery, Row, RowKey, RowSelector, RowStore};
use async_trait::async_trait;
use relay_common::{Error, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite row store.
pub struct SqliteRowStore {
    db_path: PathBuf,
}

impl SqliteRowStore {
    /// Open (or create) the database at `db_path` and initialize the schema.
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = open(db_path).map_err(map_sqlite_err)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;

            CREATE TABLE IF NOT EXISTS relay_rows (
                table_name TEXT NOT NULL,
                partition_key TEXT NOT NULL,
                sort_key INTEGER NOT NULL,
                record TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (table_name, partition_key, sort_key)
            ) WITHOUT ROWID;
            "#,
        )
        .map_err(map_sqlite_err)?;

        Ok(Self {
            db_path: db_path.to_path_buf(),
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Run `op` against a fresh connection on the blocking pool.
    async fn with_conn<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = open(&db_path).map_err(map_sqlite_err)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::StoreUnavailable(format!("{op}: blocking task failed: {e}")))?
        .map_err(|e| {
            tracing::debug!(op, error = %e, "SQLite row store operation failed");
            e
        })
    }
}

fn open(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

fn map_sqlite_err(e: rusqlite::Error) -> Error {
    match &e {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            Error::Conflict(e.to_string())
        }
        _ => Error::StoreUnavailable(e.to_string()),
    }
}

/// Stored text that is not JSON is handed back as a string so the caller's
/// decoder rejects it like any other malformed record.
fn parse_record(raw: String) -> Value {
    match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(_) => Value::String(raw),
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn read_record(
    conn: &Connection,
    table: &str,
    key: &RowKey,
) -> rusqlite::Result<Option<Value>> {
    conn.query_row(
        "SELECT record FROM relay_rows WHERE table_name = ?1 AND partition_key = ?2 AND sort_key = ?3",
        params![table, key.partition, key.sort],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map(|raw| raw.map(parse_record))
}

fn write_record(
    conn: &Connection,
    table: &str,
    key: &RowKey,
    record: &Value,
) -> Result<()> {
    let text = serde_json::to_string(record)?;
    conn.execute(
        "INSERT INTO relay_rows (table_name, partition_key, sort_key, record, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(table_name, partition_key, sort_key) DO UPDATE SET
            record = excluded.record,
            updated_at = excluded.updated_at",
        params![table, key.partition, key.sort, text, now()],
    )
    .map_err(map_sqlite_err)?;
    Ok(())
}

fn existing_object(table: &str, key: &RowKey, value: Option<Value>) -> Result<Map<String, Value>> {
    match value {
        None => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(Error::MalformedRecord(format!(
            "{table}/{key} is not a JSON object"
        ))),
    }
}

#[async_trait]
impl RowStore for SqliteRowStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get_row(&self, table: &str, key: &RowKey) -> Result<Option<Value>> {
        let table = table.to_string();
        let key = key.clone();
        self.with_conn("get_row", move |conn| {
            read_record(conn, &table, &key).map_err(map_sqlite_err)
        })
        .await
    }

    async fn put_row(&self, table: &str, key: &RowKey, record: Value) -> Result<()> {
        let table = table.to_string();
        let key = key.clone();
        self.with_conn("put_row", move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sqlite_err)?;
            write_record(&tx, &table, &key, &record)?;
            tx.commit().map_err(map_sqlite_err)
        })
        .await
    }

    async fn insert_row(&self, table: &str, key: &RowKey, record: Value) -> Result<()> {
        let table = table.to_string();
        let key = key.clone();
        self.with_conn("insert_row", move |conn| {
            let text = serde_json::to_string(&record)?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sqlite_err)?;
            tx.execute(
                "INSERT INTO relay_rows (table_name, partition_key, sort_key, record, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![table, key.partition, key.sort, text, now()],
            )
            .map_err(|e| match map_sqlite_err(e) {
                Error::Conflict(_) => Error::Conflict(format!("{table}/{key} already exists")),
                other => other,
            })?;
            tx.commit().map_err(map_sqlite_err)
        })
        .await
    }

    async fn merge_row(
        &self,
        table: &str,
        key: &RowKey,
        patch: Map<String, Value>,
    ) -> Result<Value> {
        let table = table.to_string();
        let key = key.clone();
        self.with_conn("merge_row", move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sqlite_err)?;
            let current = read_record(&tx, &table, &key).map_err(map_sqlite_err)?;
            let mut merged = existing_object(&table, &key, current)?;
            for (field, value) in patch {
                if value.is_null() {
                    merged.remove(&field);
                } else {
                    merged.insert(field, value);
                }
            }
            let merged = Value::Object(merged);
            write_record(&tx, &table, &key, &merged)?;
            tx.commit().map_err(map_sqlite_err)?;
            Ok(merged)
        })
        .await
    }

    async fn increment_field(
        &self,
        table: &str,
        key: &RowKey,
        field: &str,
        delta: i64,
    ) -> Result<i64> {
        let table = table.to_string();
        let key = key.clone();
        let field = field.to_string();
        self.with_conn("increment_field", move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sqlite_err)?;
            let current = read_record(&tx, &table, &key).map_err(map_sqlite_err)?;
            let mut record = existing_object(&table, &key, current)?;
            let base = match record.get(&field) {
                None | Some(Value::Null) => 0,
                Some(v) => v.as_i64().ok_or_else(|| {
                    Error::MalformedRecord(format!("{table}/{key}: field '{field}' is not an integer"))
                })?,
            };
            let next = base.checked_add(delta).ok_or_else(|| {
                Error::MalformedRecord(format!("{table}/{key}: field '{field}' overflowed"))
            })?;
            record.insert(field, Value::from(next));
            write_record(&tx, &table, &key, &Value::Object(record))?;
            tx.commit().map_err(map_sqlite_err)?;
            Ok(next)
        })
        .await
    }

    async fn delete_rows(&self, table: &str, selector: &RowSelector) -> Result<usize> {
        let table = table.to_string();
        let selector = selector.clone();
        self.with_conn("delete_rows", move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sqlite_err)?;
            let removed = match &selector {
                RowSelector::Exact(key) => tx.execute(
                    "DELETE FROM relay_rows WHERE table_name = ?1 AND partition_key = ?2 AND sort_key = ?3",
                    params![table, key.partition, key.sort],
                ),
                RowSelector::Partition(partition) => tx.execute(
                    "DELETE FROM relay_rows WHERE table_name = ?1 AND partition_key = ?2",
                    params![table, partition],
                ),
                RowSelector::Before { partition, sort } => tx.execute(
                    "DELETE FROM relay_rows WHERE table_name = ?1 AND partition_key = ?2 AND sort_key < ?3",
                    params![table, partition, sort],
                ),
            }
            .map_err(map_sqlite_err)?;
            tx.commit().map_err(map_sqlite_err)?;
            Ok(removed)
        })
        .await
    }

    async fn query_range(
        &self,
        table: &str,
        partition: &str,
        query: RangeQuery,
    ) -> Result<Vec<Row>> {
        let table = table.to_string();
        let partition = partition.to_string();
        self.with_conn("query_range", move |conn| {
            let order = if query.descending { "DESC" } else { "ASC" };
            let limit = query
                .limit
                .map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
            let sql = format!(
                "SELECT sort_key, record FROM relay_rows
                 WHERE table_name = ?1 AND partition_key = ?2
                 ORDER BY sort_key {order}
                 LIMIT ?3"
            );
            let mut stmt = conn.prepare(&sql).map_err(map_sqlite_err)?;
            let rows = stmt
                .query_map(params![table, partition, limit], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(map_sqlite_err)?;

            let mut out = Vec::new();
            for row in rows {
                let (sort, raw) = row.map_err(map_sqlite_err)?;
                out.push(Row {
                    key: RowKey::indexed(partition.clone(), sort),
                    record: parse_record(raw),
                });
            }
            Ok(out)
        })
        .await
    }

    async fn health_check(&self) -> bool {
        self.with_conn("health_check", |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(map_sqlite_err)
        })
        .await
        .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup() -> (TempDir, SqliteRowStore) {
        let tmp = TempDir::new().unwrap();
        let store = SqliteRowStore::new(&tmp.path().join("relay.db")).unwrap();
        (tmp, store)
    }

    #[tokio::test]
    async fn put_and_get() {
        let (_tmp, store) = setup();
        let key = RowKey::single("42");

        store.put_row("settings", &key, json!({"a": 1})).await.unwrap();
        assert_eq!(store.get_row("settings", &key).await.unwrap(), Some(json!({"a": 1})));

        store.put_row("settings", &key, json!({"b": 2})).await.unwrap();
        assert_eq!(store.get_row("settings", &key).await.unwrap(), Some(json!({"b": 2})));
    }

    #[tokio::test]
    async fn get_nonexistent_returns_none() {
        let (_tmp, store) = setup();
        assert!(store.get_row("settings", &RowKey::single("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tables_are_isolated() {
        let (_tmp, store) = setup();
        let key = RowKey::single("42");
        store.put_row("a", &key, json!(1)).await.unwrap();
        assert!(store.get_row("b", &key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn insert_rejects_existing_key() {
        let (_tmp, store) = setup();
        let key = RowKey::indexed("42", 0);

        store.insert_row("turns", &key, json!({"n": 1})).await.unwrap();
        let err = store.insert_row("turns", &key, json!({"n": 2})).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        assert_eq!(store.get_row("turns", &key).await.unwrap(), Some(json!({"n": 1})));
    }

    #[tokio::test]
    async fn merge_creates_and_patches() {
        let (_tmp, store) = setup();
        let key = RowKey::single("42");

        let mut patch = Map::new();
        patch.insert("model".into(), json!("m1"));
        patch.insert("key".into(), json!("k1"));
        let merged = store.merge_row("s", &key, patch).await.unwrap();
        assert_eq!(merged, json!({"model": "m1", "key": "k1"}));

        let mut patch = Map::new();
        patch.insert("key".into(), Value::Null);
        patch.insert("count".into(), json!(0));
        let merged = store.merge_row("s", &key, patch).await.unwrap();
        assert_eq!(merged, json!({"model": "m1", "count": 0}));
        assert_eq!(store.get_row("s", &key).await.unwrap(), Some(merged));
    }

    #[tokio::test]
    async fn increment_creates_field() {
        let (_tmp, store) = setup();
        let key = RowKey::single("42");

        assert_eq!(store.increment_field("s", &key, "count", 1).await.unwrap(), 1);
        assert_eq!(store.increment_field("s", &key, "count", 1).await.unwrap(), 2);
        assert_eq!(store.get_row("s", &key).await.unwrap(), Some(json!({"count": 2})));
    }

    #[tokio::test]
    async fn increment_rejects_non_integer_field() {
        let (_tmp, store) = setup();
        let key = RowKey::single("42");
        store.put_row("s", &key, json!({"count": "many"})).await.unwrap();

        let err = store.increment_field("s", &key, "count", 1).await.unwrap_err();
        assert!(matches!(err, Error::MalformedRecord(_)));
    }

    #[tokio::test]
    async fn query_range_orders_and_limits() {
        let (_tmp, store) = setup();
        for i in 0..5 {
            store
                .insert_row("t", &RowKey::indexed("42", i), json!({ "i": i }))
                .await
                .unwrap();
        }
        store.insert_row("t", &RowKey::indexed("other", 0), json!({})).await.unwrap();

        let all = store.query_range("t", "42", RangeQuery::all()).await.unwrap();
        let sorts: Vec<i64> = all.iter().map(|r| r.key.sort).collect();
        assert_eq!(sorts, vec![0, 1, 2, 3, 4]);

        let latest = store.query_range("t", "42", RangeQuery::latest(2)).await.unwrap();
        let sorts: Vec<i64> = latest.iter().map(|r| r.key.sort).collect();
        assert_eq!(sorts, vec![4, 3]);
    }

    #[tokio::test]
    async fn delete_selectors() {
        let (_tmp, store) = setup();
        for i in 0..5 {
            store.insert_row("t", &RowKey::indexed("42", i), json!(i)).await.unwrap();
        }

        let removed = store
            .delete_rows("t", &RowSelector::Before { partition: "42".into(), sort: 2 })
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let removed = store
            .delete_rows("t", &RowSelector::Exact(RowKey::indexed("42", 4)))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let left = store.query_range("t", "42", RangeQuery::all()).await.unwrap();
        assert_eq!(left.len(), 2);

        assert_eq!(store.delete_rows("t", &RowSelector::Partition("42".into())).await.unwrap(), 2);
        assert_eq!(store.delete_rows("t", &RowSelector::Partition("42".into())).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn non_json_text_is_returned_as_string() {
        let (_tmp, store) = setup();
        let conn = Connection::open(store.path()).unwrap();
        conn.execute(
            "INSERT INTO relay_rows (table_name, partition_key, sort_key, record, updated_at)
             VALUES ('t', '42', 0, '{broken', 'now')",
            [],
        )
        .unwrap();

        let rows = store.query_range("t", "42", RangeQuery::all()).await.unwrap();
        assert_eq!(rows[0].record, Value::String("{broken".into()));
    }

    #[tokio::test]
    async fn increment_overflow_rolls_back() {
        let (_tmp, store) = setup();
        let key = RowKey::single("42");
        store.put_row("s", &key, json!({"count": i64::MIN})).await.unwrap();

        let err = store.increment_field("s", &key, "count", -1).await.unwrap_err();
        assert!(matches!(err, Error::MalformedRecord(_)));
        assert_eq!(
            store.get_row("s", &key).await.unwrap(),
            Some(json!({"count": i64::MIN}))
        );
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("relay.db");
        {
            let store = SqliteRowStore::new(&path).unwrap();
            store.put_row("s", &RowKey::single("1"), json!({"x": 1})).await.unwrap();
        }
        let store = SqliteRowStore::new(&path).unwrap();
        assert_eq!(store.get_row("s", &RowKey::single("1")).await.unwrap(), Some(json!({"x": 1})));
    }

    #[tokio::test]
    async fn health_check_passes() {
        let (_tmp, store) = setup();
        assert!(store.health_check().await);
    }
}
