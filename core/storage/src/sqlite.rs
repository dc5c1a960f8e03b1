//! SQLite store for disconnected nodes.
//!
//! The connection is owned exclusively by this process and guarded by a
//! mutex; every call runs on tokio's blocking pool.

use async_trait::async_trait;
use rusqlite::types::{Value as SqliteValue, ValueRef};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use fleetsync_common::{Error, Result, Secret};

use crate::dialect::Dialect;
use crate::provider::Store;
use crate::value::{Row, SqlValue};

/// How long a statement waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn sqlite_err(e: rusqlite::Error) -> Error {
    Error::Storage(format!("sqlite: {}", e))
}

/// Local embedded store backed by a single SQLite file.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open or create the database file at `path`.
    ///
    /// # Preconditions
    /// - The parent directory exists
    ///
    /// # Postconditions
    /// - WAL journaling and a busy timeout are configured
    /// - If `encryption_key` is given it is applied before any other
    ///   statement; when the linked SQLite has no cipher support the key is
    ///   ignored with a warning
    pub fn open(path: impl AsRef<Path>, encryption_key: Option<&Secret>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(sqlite_err)?;
        Self::configure(&conn, encryption_key)?;

        info!("Opened local store at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sqlite_err)?;
        Self::configure(&conn, None)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    fn configure(conn: &Connection, encryption_key: Option<&Secret>) -> Result<()> {
        if let Some(key) = encryption_key.filter(|k| !k.is_empty()) {
            conn.pragma_update(None, "key", key.expose())
                .map_err(sqlite_err)?;
            let cipher: Option<String> = conn
                .query_row("PRAGMA cipher_version", [], |row| row.get(0))
                .optional()
                .map_err(sqlite_err)?;
            match cipher {
                Some(version) => info!("At-rest encryption enabled (cipher {})", version),
                None => warn!(
                    "Encryption key configured but the linked SQLite has no cipher support; \
                     local store is NOT encrypted"
                ),
            }
        }

        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(sqlite_err)?;
        debug!("SQLite journal mode: {}", mode);
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(sqlite_err)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(sqlite_err)?;
        Ok(())
    }

    /// Path of the database file, if not in-memory.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` against the raw connection on the blocking pool.
    ///
    /// For operations the uniform [`Store`] interface does not cover.
    pub async fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| Error::Storage("sqlite: connection mutex poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| Error::Storage(format!("sqlite: worker task failed: {}", e)))?
    }

    /// Run parameterized statements in one transaction.
    ///
    /// Either every statement takes effect or none does. Returns the total
    /// number of affected rows.
    pub async fn transaction(&self, statements: Vec<(String, Vec<SqlValue>)>) -> Result<u64> {
        self.with_connection(move |conn| {
            let tx = conn.transaction().map_err(sqlite_err)?;
            let mut affected = 0u64;
            for (sql, params) in &statements {
                let values: Vec<SqliteValue> = params.iter().map(to_sqlite).collect();
                let mut stmt = tx.prepare_cached(sql).map_err(sqlite_err)?;
                affected += stmt
                    .execute(params_from_iter(values.iter()))
                    .map_err(sqlite_err)? as u64;
            }
            tx.commit().map_err(sqlite_err)?;
            Ok(affected)
        })
        .await
    }

    /// Execute several semicolon-separated statements without parameters.
    pub async fn execute_batch(&self, sql: &str) -> Result<()> {
        let sql = sql.to_string();
        self.with_connection(move |conn| conn.execute_batch(&sql).map_err(sqlite_err))
            .await
    }
}

fn to_sqlite(value: &SqlValue) -> SqliteValue {
    match value {
        SqlValue::Null => SqliteValue::Null,
        SqlValue::Bool(b) => SqliteValue::Integer(i64::from(*b)),
        SqlValue::Int(i) => SqliteValue::Integer(*i),
        SqlValue::Real(f) => SqliteValue::Real(*f),
        SqlValue::Text(s) => SqliteValue::Text(s.clone()),
        SqlValue::Json(v) => SqliteValue::Text(v.to_string()),
        SqlValue::Timestamp(at) => SqliteValue::Integer(at.timestamp_millis()),
    }
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let sql = sql.to_string();
        let values: Vec<SqliteValue> = params.iter().map(to_sqlite).collect();

        self.with_connection(move |conn| {
            let mut stmt = conn.prepare_cached(&sql).map_err(sqlite_err)?;
            let affected = stmt
                .execute(params_from_iter(values.iter()))
                .map_err(sqlite_err)?;
            Ok(affected as u64)
        })
        .await
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let sql = sql.to_string();
        let values: Vec<SqliteValue> = params.iter().map(to_sqlite).collect();

        self.with_connection(move |conn| {
            let mut stmt = conn.prepare_cached(&sql).map_err(sqlite_err)?;
            let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            let mut rows = stmt
                .query(params_from_iter(values.iter()))
                .map_err(sqlite_err)?;

            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(sqlite_err)? {
                let mut map = Row::new();
                for (idx, name) in names.iter().enumerate() {
                    let value = row.get_ref(idx).map_err(sqlite_err)?;
                    map.insert(name.clone(), to_json(value));
                }
                out.push(map);
            }
            Ok(out)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[tokio::test]
    async fn test_execute_and_query() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .execute_batch("CREATE TABLE vessels (id TEXT PRIMARY KEY, name TEXT, tags TEXT)")
            .await
            .unwrap();

        let affected = store
            .execute(
                "INSERT INTO vessels (id, name, tags) VALUES (?1, ?2, ?3)",
                &[
                    "v1".into(),
                    "Nordic Star".into(),
                    SqlValue::Json(json!(["tanker", "ice-class"])),
                ],
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let rows = store
            .query("SELECT id, name FROM vessels WHERE id = ?1", &["v1".into()])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("Nordic Star"));
    }

    #[tokio::test]
    async fn test_dialect_fragments_run_on_sqlite() {
        let store = SqliteStore::in_memory().unwrap();
        let dialect = store.dialect();
        store
            .execute_batch(
                "CREATE TABLE equipment (id TEXT PRIMARY KEY, name TEXT, tags TEXT, settings TEXT);
                 INSERT INTO equipment VALUES ('e1', 'Main Engine', '[\"pump-2\",\"engine\"]', '{\"alerts\":[{\"level\":1}]}');
                 INSERT INTO equipment VALUES ('e2', 'Bilge pump', '[\"pump\"]', NULL);",
            )
            .await
            .unwrap();

        // Structured membership does not match substrings of other elements.
        let sql = format!(
            "SELECT id FROM equipment WHERE {} ORDER BY id",
            dialect.array_contains("tags", "?1")
        );
        let rows = store.query(&sql, &["pump".into()]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!("e2"));

        let sql = format!(
            "SELECT id FROM equipment WHERE {} ORDER BY id",
            dialect.ilike("name", "?1")
        );
        let rows = store.query(&sql, &["main%".into()]).await.unwrap();
        assert_eq!(rows.len(), 1);

        let path = crate::JsonPath::parse("alerts[0].level").unwrap();
        let sql = format!(
            "UPDATE equipment SET settings = {} WHERE id = ?2",
            dialect.json_set("settings", &path, "?1")
        );
        store
            .execute(&sql, &[dialect.encode_json(&json!(3)), "e1".into()])
            .await
            .unwrap();
        let sql = format!(
            "SELECT {} AS level FROM equipment WHERE id = 'e1'",
            dialect.json_extract_text("settings", &path)
        );
        let row = store.query_one(&sql, &[]).await.unwrap().unwrap();
        assert_eq!(row["level"], json!(3));

        let sql = format!(
            "SELECT {} AS names FROM equipment",
            dialect.json_array_agg("name")
        );
        let row = store.query_one(&sql, &[]).await.unwrap().unwrap();
        let names = dialect.decode_json(&row["names"]);
        assert_eq!(names.as_array().map(|a| a.len()), Some(2));
    }

    #[tokio::test]
    async fn test_timestamps_stored_as_epoch_millis() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .execute_batch("CREATE TABLE readings (recorded_at INTEGER NOT NULL)")
            .await
            .unwrap();

        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        store
            .execute(
                "INSERT INTO readings (recorded_at) VALUES (?1)",
                &[store.dialect().encode_timestamp(at)],
            )
            .await
            .unwrap();

        let row = store
            .query_one("SELECT recorded_at FROM readings", &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["recorded_at"], json!(at.timestamp_millis()));
        assert_eq!(store.dialect().decode_timestamp(&row["recorded_at"]), Some(at));

        let sql = format!("SELECT {} AS now", store.dialect().now_expr());
        let row = store.query_one(&sql, &[]).await.unwrap().unwrap();
        let now = store.dialect().decode_timestamp(&row["now"]).unwrap();
        assert!((Utc::now() - now).num_seconds().abs() < 5);
    }

    #[tokio::test]
    async fn test_transaction_is_all_or_nothing() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .execute_batch("CREATE TABLE ports (id TEXT PRIMARY KEY, name TEXT NOT NULL)")
            .await
            .unwrap();

        let insert = "INSERT INTO ports (id, name) VALUES (?1, ?2)".to_string();
        let affected = store
            .transaction(vec![
                (insert.clone(), vec!["p1".into(), "Bergen".into()]),
                (insert.clone(), vec!["p2".into(), "Tromso".into()]),
            ])
            .await
            .unwrap();
        assert_eq!(affected, 2);

        let result = store
            .transaction(vec![
                (insert.clone(), vec!["p3".into(), "Hammerfest".into()]),
                (insert, vec!["p4".into(), SqlValue::Null]),
            ])
            .await;
        assert!(matches!(result, Err(Error::Storage(_))));

        let rows = store.query("SELECT id FROM ports ORDER BY id", &[]).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_table_exists() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(!store.table_exists("telemetry_readings").await.unwrap());
        store
            .execute_batch("CREATE TABLE telemetry_readings (id INTEGER)")
            .await
            .unwrap();
        assert!(store.table_exists("telemetry_readings").await.unwrap());
    }

    #[tokio::test]
    async fn test_open_file_with_key_on_plain_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.db");
        let key = Secret::new("correct horse");

        let store = SqliteStore::open(&path, Some(&key)).unwrap();
        store.ping().await.unwrap();
        assert!(path.exists());
        assert_eq!(store.path(), Some(path.as_path()));
    }
}
