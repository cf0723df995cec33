//! Stateful SQL adapter
//!
//! Embedded SQLite connection. One statement runs at a time per instance:
//! every execute locks the connection mutex inside `spawn_blocking`, so
//! later calls queue behind the in-flight statement. Distinct instances hold
//! distinct connections and never contend. A statement failure leaves the
//! connection usable; a close leaves queued executes with a normalized
//! execution error.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rusqlite::Connection;
use rusqlite::params_from_iter;
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde::Deserialize;
use serde_json::{Map, Number, Value, json};
use tracing::debug;

use super::{Adapter, AdapterKind, AdapterMetadata, AdapterRequest, AdapterResponse, Capability};
use crate::{Error, Result};

/// SQL adapter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SqlConfig {
    /// Database path; `":memory:"` opens an ephemeral database
    #[serde(default = "default_path")]
    pub path: String,
    /// How long a locked database delays a statement before failing
    #[serde(
        default = "default_busy_timeout",
        with = "crate::config::humantime_serde"
    )]
    pub busy_timeout: Duration,
}

fn default_path() -> String {
    ":memory:".to_string()
}

fn default_busy_timeout() -> Duration {
    Duration::from_secs(5)
}

/// The two SQL operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SqlOperation {
    /// Row-returning statement, declared cacheable
    Query,
    /// DML statement, returns the affected row count
    Execute,
}

impl SqlOperation {
    fn parse(operation: &str) -> Result<Self> {
        match operation {
            "query" => Ok(Self::Query),
            "execute" => Ok(Self::Execute),
            other => Err(Error::execution(format!(
                "unknown sql operation: {other} (expected \"query\" or \"execute\")"
            ))),
        }
    }
}

/// Stateful SQLite adapter
pub struct SqlAdapter {
    config: SqlConfig,
    /// `None` once closed; executes queued behind a close observe that
    connection: Arc<Mutex<Option<Connection>>>,
}

impl SqlAdapter {
    /// Parse the config object
    ///
    /// # Errors
    ///
    /// Returns `Error::AdapterConfig` when the object does not deserialize.
    pub fn from_config(config: &Value) -> Result<Self> {
        let config: SqlConfig = serde_json::from_value(config.clone())
            .map_err(|e| Error::AdapterConfig(format!("sql config: {e}")))?;

        Ok(Self {
            config,
            connection: Arc::new(Mutex::new(None)),
        })
    }

    /// Run a closure against the open connection on the blocking pool
    async fn with_connection<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let connection = Arc::clone(&self.connection);
        tokio::task::spawn_blocking(move || {
            let guard = connection
                .lock()
                .map_err(|_| Error::execution("sql connection poisoned"))?;
            let Some(conn) = guard.as_ref() else {
                return Err(Error::execution("sql connection closed"));
            };
            work(conn)
        })
        .await
        .map_err(|e| Error::Internal(format!("sql worker failed: {e}")))?
    }
}

#[async_trait]
impl Adapter for SqlAdapter {
    async fn connect(&self) -> Result<()> {
        let config = self.config.clone();
        let connection = Arc::clone(&self.connection);

        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&config.path)
                .map_err(|e| Error::AdapterConfig(format!("open {}: {e}", config.path)))?;
            conn.busy_timeout(config.busy_timeout)
                .map_err(|e| Error::AdapterConfig(format!("busy_timeout: {e}")))?;

            let mut guard = connection
                .lock()
                .map_err(|_| Error::AdapterConfig("sql connection poisoned".to_string()))?;
            *guard = Some(conn);
            Ok::<(), Error>(())
        })
        .await
        .map_err(|e| Error::Internal(format!("sql worker failed: {e}")))??;

        debug!(path = %self.config.path, "SQL adapter connected");
        Ok(())
    }

    async fn execute(&self, request: &AdapterRequest) -> Result<AdapterResponse> {
        let operation = SqlOperation::parse(&request.operation)?;
        let sql = request
            .params
            .get("sql")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::execution("params.sql is required"))?
            .to_string();
        let args = bind_args(request.params.get("args"))?;

        let body = self
            .with_connection(move |conn| match operation {
                SqlOperation::Query => run_query(conn, &sql, &args),
                SqlOperation::Execute => run_execute(conn, &sql, &args),
            })
            .await?;

        Ok(AdapterResponse { status: 200, body })
    }

    async fn close(&self) -> Result<()> {
        let connection = Arc::clone(&self.connection);
        // Waits behind any in-flight statement
        tokio::task::spawn_blocking(move || {
            if let Ok(mut guard) = connection.lock() {
                *guard = None;
            }
        })
        .await
        .map_err(|e| Error::Internal(format!("sql worker failed: {e}")))?;

        debug!(path = %self.config.path, "SQL adapter closed");
        Ok(())
    }

    fn metadata(&self) -> AdapterMetadata {
        AdapterMetadata {
            kind: AdapterKind::Sql,
            target: self.config.path.clone(),
            capabilities: vec![Capability::Read, Capability::Write],
        }
    }

    fn is_cacheable(&self, request: &AdapterRequest) -> bool {
        matches!(
            SqlOperation::parse(&request.operation),
            Ok(SqlOperation::Query)
        )
    }

    async fn health_check(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(|e| Error::execution(format!("health check failed: {e}")))?;
            Ok(())
        })
        .await
    }
}

/// Run a row-returning statement, mapping rows to objects by column name
fn run_query(conn: &Connection, sql: &str, args: &[SqlValue]) -> Result<Value> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| Error::execution(format!("prepare: {e}")))?;

    let column_names: Vec<String> = stmt.column_names().iter().map(ToString::to_string).collect();

    let mut rows = stmt
        .query(params_from_iter(args.iter()))
        .map_err(|e| Error::execution(format!("query: {e}")))?;

    let mut out = Vec::new();
    while let Some(row) = rows
        .next()
        .map_err(|e| Error::execution(format!("row: {e}")))?
    {
        let mut object = Map::new();
        for (i, name) in column_names.iter().enumerate() {
            let value = row
                .get_ref(i)
                .map_err(|e| Error::execution(format!("column {name}: {e}")))?;
            object.insert(name.clone(), column_to_json(value));
        }
        out.push(Value::Object(object));
    }

    Ok(Value::Array(out))
}

/// Run a DML statement, returning `{"affected_rows": n}`
fn run_execute(conn: &Connection, sql: &str, args: &[SqlValue]) -> Result<Value> {
    let affected = conn
        .execute(sql, params_from_iter(args.iter()))
        .map_err(|e| Error::execution(format!("execute: {e}")))?;
    Ok(json!({ "affected_rows": affected }))
}

/// Map positional JSON args to SQL values
fn bind_args(args: Option<&Value>) -> Result<Vec<SqlValue>> {
    match args {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items.iter().map(bind_value).collect(),
        Some(_) => Err(Error::execution("params.args must be an array")),
    }
}

fn bind_value(value: &Value) -> Result<SqlValue> {
    match value {
        Value::Null => Ok(SqlValue::Null),
        Value::Bool(b) => Ok(SqlValue::Integer(i64::from(*b))),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(SqlValue::Integer(i))
            } else if let Some(f) = n.as_f64() {
                Ok(SqlValue::Real(f))
            } else {
                Err(Error::execution(format!("unbindable number: {n}")))
            }
        }
        Value::String(s) => Ok(SqlValue::Text(s.clone())),
        Value::Array(_) | Value::Object(_) => {
            Err(Error::execution("array and object args are not bindable"))
        }
    }
}

/// Render one column value as JSON (blobs become base64 strings)
fn column_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(BASE64.encode(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open() -> SqlAdapter {
        let adapter = SqlAdapter::from_config(&json!({ "path": ":memory:" })).unwrap();
        adapter.connect().await.unwrap();
        adapter
    }

    async fn run(adapter: &SqlAdapter, operation: &str, params: Value) -> Result<AdapterResponse> {
        adapter
            .execute(&AdapterRequest::new(operation, params))
            .await
    }

    #[tokio::test]
    async fn test_execute_and_query_round_trip() {
        let adapter = open().await;

        run(
            &adapter,
            "execute",
            json!({ "sql": "CREATE TABLE t (id INTEGER, name TEXT)" }),
        )
        .await
        .unwrap();

        let insert = run(
            &adapter,
            "execute",
            json!({ "sql": "INSERT INTO t VALUES (?1, ?2), (?3, ?4)",
                    "args": [1, "ada", 2, "grace"] }),
        )
        .await
        .unwrap();
        assert_eq!(insert.body["affected_rows"], 2);

        let rows = run(
            &adapter,
            "query",
            json!({ "sql": "SELECT id, name FROM t ORDER BY id" }),
        )
        .await
        .unwrap();
        assert_eq!(rows.status, 200);
        assert_eq!(
            rows.body,
            json!([
                { "id": 1, "name": "ada" },
                { "id": 2, "name": "grace" }
            ])
        );
    }

    #[tokio::test]
    async fn test_query_with_positional_args() {
        let adapter = open().await;
        run(&adapter, "execute", json!({ "sql": "CREATE TABLE t (n INTEGER)" }))
            .await
            .unwrap();
        run(
            &adapter,
            "execute",
            json!({ "sql": "INSERT INTO t VALUES (1), (2), (3)" }),
        )
        .await
        .unwrap();

        let rows = run(
            &adapter,
            "query",
            json!({ "sql": "SELECT n FROM t WHERE n > ?1 ORDER BY n", "args": [1] }),
        )
        .await
        .unwrap();
        assert_eq!(rows.body, json!([{ "n": 2 }, { "n": 3 }]));
    }

    #[tokio::test]
    async fn test_empty_result_is_empty_array() {
        let adapter = open().await;
        run(&adapter, "execute", json!({ "sql": "CREATE TABLE t (n INTEGER)" }))
            .await
            .unwrap();

        let rows = run(&adapter, "query", json!({ "sql": "SELECT n FROM t" }))
            .await
            .unwrap();
        assert_eq!(rows.body, json!([]));
    }

    #[tokio::test]
    async fn test_value_type_mapping() {
        let adapter = open().await;
        run(
            &adapter,
            "execute",
            json!({ "sql": "CREATE TABLE t (a, b, c, d, e)" }),
        )
        .await
        .unwrap();
        run(
            &adapter,
            "execute",
            json!({ "sql": "INSERT INTO t VALUES (?1, ?2, ?3, ?4, ?5)",
                    "args": [null, true, 42, 1.5, "text"] }),
        )
        .await
        .unwrap();

        let rows = run(&adapter, "query", json!({ "sql": "SELECT * FROM t" }))
            .await
            .unwrap();
        assert_eq!(
            rows.body,
            json!([{ "a": null, "b": 1, "c": 42, "d": 1.5, "e": "text" }])
        );
    }

    #[tokio::test]
    async fn test_statement_failure_leaves_connection_usable() {
        let adapter = open().await;

        let err = run(&adapter, "query", json!({ "sql": "SELECT * FROM missing" }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AdapterExecution { status: None, .. }));

        // The connection survived the failed statement
        let rows = run(&adapter, "query", json!({ "sql": "SELECT 1 AS one" }))
            .await
            .unwrap();
        assert_eq!(rows.body, json!([{ "one": 1 }]));
    }

    #[tokio::test]
    async fn test_execute_after_close_fails_cleanly() {
        let adapter = open().await;
        adapter.close().await.unwrap();

        let err = run(&adapter, "query", json!({ "sql": "SELECT 1" }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[tokio::test]
    async fn test_unknown_operation_rejected() {
        let adapter = open().await;
        let err = run(&adapter, "migrate", json!({ "sql": "SELECT 1" }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown sql operation"));
    }

    #[tokio::test]
    async fn test_missing_sql_param_rejected() {
        let adapter = open().await;
        let err = run(&adapter, "query", json!({})).await.unwrap_err();
        assert!(err.to_string().contains("params.sql"));
    }

    #[tokio::test]
    async fn test_args_must_be_an_array() {
        let adapter = open().await;
        let err = run(
            &adapter,
            "query",
            json!({ "sql": "SELECT ?1", "args": {"x": 1} }),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("must be an array"));
    }

    #[tokio::test]
    async fn test_cacheability_by_operation() {
        let adapter = open().await;
        let query = AdapterRequest::new("query", json!({ "sql": "SELECT 1" }));
        let execute = AdapterRequest::new("execute", json!({ "sql": "DELETE FROM t" }));
        let unknown = AdapterRequest::new("migrate", json!({}));

        assert!(adapter.is_cacheable(&query));
        assert!(!adapter.is_cacheable(&execute));
        assert!(!adapter.is_cacheable(&unknown));
    }

    #[tokio::test]
    async fn test_health_check() {
        let adapter = open().await;
        adapter.health_check().await.unwrap();

        adapter.close().await.unwrap();
        assert!(adapter.health_check().await.is_err());
    }

    #[tokio::test]
    async fn test_file_backed_database_persists_within_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let config = json!({ "path": path.to_str().unwrap() });

        let adapter = SqlAdapter::from_config(&config).unwrap();
        adapter.connect().await.unwrap();
        run(&adapter, "execute", json!({ "sql": "CREATE TABLE t (n INTEGER)" }))
            .await
            .unwrap();
        run(&adapter, "execute", json!({ "sql": "INSERT INTO t VALUES (7)" }))
            .await
            .unwrap();
        adapter.close().await.unwrap();

        // A second instance over the same file sees the data
        let adapter = SqlAdapter::from_config(&config).unwrap();
        adapter.connect().await.unwrap();
        let rows = run(&adapter, "query", json!({ "sql": "SELECT n FROM t" }))
            .await
            .unwrap();
        assert_eq!(rows.body, json!([{ "n": 7 }]));
    }
}
