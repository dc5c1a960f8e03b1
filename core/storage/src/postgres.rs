//! PostgreSQL store for the connected topology.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Column, Postgres, Row as SqlxRow, TypeInfo};
use tracing::info;

use fleetsync_common::{Error, Result};

use crate::config::PoolSettings;
use crate::dialect::Dialect;
use crate::provider::Store;
use crate::value::{Row, SqlValue};

fn pg_err(e: sqlx::Error) -> Error {
    Error::Storage(format!("postgres: {}", e))
}

/// Pooled PostgreSQL store shared process-wide.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect with bounded pool size, idle timeout and acquire timeout.
    ///
    /// The first connection is established eagerly and bounded by
    /// `connect_timeout`, so an unreachable server fails startup instead of
    /// hanging it.
    pub async fn connect(url: &str, settings: &PoolSettings) -> Result<Self> {
        let options = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .idle_timeout(settings.idle_timeout())
            .acquire_timeout(settings.connect_timeout());

        let pool = tokio::time::timeout(settings.connect_timeout(), options.connect(url))
            .await
            .map_err(|_| {
                Error::Storage(format!(
                    "postgres: connect timed out after {}s",
                    settings.connect_timeout_secs
                ))
            })?
            .map_err(pg_err)?;

        info!(
            max_connections = settings.max_connections,
            "Connected to PostgreSQL"
        );
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn bind_params<'q>(sql: &'q str, params: &[SqlValue]) -> Query<'q, Postgres, PgArguments> {
    let mut query = sqlx::query(sql);
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Bool(b) => query.bind(*b),
            SqlValue::Int(i) => query.bind(*i),
            SqlValue::Real(f) => query.bind(*f),
            SqlValue::Text(s) => query.bind(s.clone()),
            SqlValue::Json(v) => query.bind(Json(v.clone())),
            SqlValue::Timestamp(at) => query.bind(*at),
        };
    }
    query
}

fn decode_column(row: &PgRow, idx: usize, type_name: &str) -> Result<Value> {
    let value = match type_name {
        "BOOL" => row.try_get::<Option<bool>, _>(idx).map(|v| v.map(Value::from)),
        "INT2" => row.try_get::<Option<i16>, _>(idx).map(|v| v.map(Value::from)),
        "INT4" => row.try_get::<Option<i32>, _>(idx).map(|v| v.map(Value::from)),
        "INT8" => row.try_get::<Option<i64>, _>(idx).map(|v| v.map(Value::from)),
        "FLOAT4" => row.try_get::<Option<f32>, _>(idx).map(|v| v.map(Value::from)),
        "FLOAT8" => row.try_get::<Option<f64>, _>(idx).map(|v| v.map(Value::from)),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
            row.try_get::<Option<String>, _>(idx).map(|v| v.map(Value::from))
        }
        "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(idx),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)
            .map(|v| v.map(|at| Value::from(Dialect::display_timestamp(at)))),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(idx)
            .map(|v| v.map(|at| Value::from(Dialect::display_timestamp(at.and_utc())))),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(idx)
            .map(|v| v.map(|d| Value::from(d.to_string()))),
        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(idx)
            .map(|v| v.map(|u| Value::from(u.to_string()))),
        "VOID" => Ok(None),
        other => {
            return Err(Error::Unsupported(format!(
                "postgres column type {} (cast it to text in the query)",
                other
            )))
        }
    };
    Ok(value.map_err(pg_err)?.unwrap_or(Value::Null))
}

fn decode_row(row: &PgRow) -> Result<Row> {
    let mut map = Row::new();
    for column in row.columns() {
        let value = decode_column(row, column.ordinal(), column.type_info().name())?;
        map.insert(column.name().to_string(), value);
    }
    Ok(map)
}

#[async_trait]
impl Store for PostgresStore {
    fn name(&self) -> &str {
        "postgres"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let result = bind_params(sql, params)
            .execute(&self.pool)
            .await
            .map_err(pg_err)?;
        Ok(result.rows_affected())
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let rows = bind_params(sql, params)
            .fetch_all(&self.pool)
            .await
            .map_err(pg_err)?;
        rows.iter().map(decode_row).collect()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_fail() -> PoolSettings {
        PoolSettings {
            max_connections: 1,
            idle_timeout_secs: 1,
            connect_timeout_secs: 1,
        }
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_fast() {
        let started = std::time::Instant::now();
        let result = PostgresStore::connect("postgres://fleet@127.0.0.1:1/fleet", &fast_fail()).await;
        assert!(matches!(result, Err(Error::Storage(_))));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_malformed_url_is_storage_error() {
        let result = PostgresStore::connect("not a url", &fast_fail()).await;
        assert!(matches!(result, Err(Error::Storage(_))));
    }

    #[tokio::test]
    async fn test_lazy_pool_reports_dialect() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://fleet@127.0.0.1:1/fleet")
            .unwrap();
        let store = PostgresStore::from_pool(pool);
        assert_eq!(store.name(), "postgres");
        assert_eq!(store.dialect(), Dialect::Postgres);
        assert!(!store.dialect().placeholder(1).starts_with('?'));
    }
}
