//! Uniform storage handle.

use async_trait::async_trait;

use fleetsync_common::Result;

use crate::dialect::Dialect;
use crate::value::{Row, SqlValue};

/// Storage handle shared by every component regardless of deployment mode.
///
/// SQL passed in must be built with the handle's [`Dialect`] for anything
/// backend-specific (placeholders, JSON, timestamps). Implementations map
/// their native errors into [`fleetsync_common::Error::Storage`].
#[async_trait]
pub trait Store: Send + Sync {
    /// Backend name (e.g., "postgres", "sqlite").
    fn name(&self) -> &str;

    /// Dialect used to build queries for this handle.
    fn dialect(&self) -> Dialect;

    /// Run a statement and return the number of affected rows.
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    /// Run a query and return every row.
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>>;

    /// Run a query and return its first row, if any.
    async fn query_one(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }

    /// Check whether a table or view exists.
    async fn table_exists(&self, table: &str) -> Result<bool> {
        let dialect = self.dialect();
        let row = self
            .query_one(dialect.table_exists_sql(), &[SqlValue::from(table)])
            .await?;
        Ok(row
            .and_then(|r| r.get("present").map(|v| dialect.decode_bool(v)))
            .unwrap_or(false))
    }

    /// Round-trip a trivial query.
    async fn ping(&self) -> Result<()> {
        self.query("SELECT 1 AS ok", &[]).await.map(|_| ())
    }

    /// Release backend resources.
    async fn close(&self) {}
}
