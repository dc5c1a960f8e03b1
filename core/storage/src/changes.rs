//! Record-level change feed exchanged with the remote replica.
//!
//! Writers on a disconnected node record each change to a replicated table
//! in `sync_changes`. The replicator pushes pending entries and applies the
//! changes it pulls back. Replicated tables are keyed by a text `id` column,
//! and row values arrive in the local physical representation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use fleetsync_common::{Error, Result};

use crate::dialect::{validate_identifier, Dialect};
use crate::provider::Store;
use crate::schema::CHANGES_TABLE;
use crate::value::{column, get_i64, get_str, Row, SqlValue};

/// Kind of change to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Upsert,
    Delete,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "upsert" => Ok(Self::Upsert),
            "delete" => Ok(Self::Delete),
            other => Err(Error::Serialization(format!("unknown change op '{}'", other))),
        }
    }
}

/// One change to one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub table: String,
    pub record_id: String,
    pub op: ChangeOp,
    /// Full row for upserts, without the `id` column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<Row>,
}

impl Change {
    pub fn upsert(table: impl Into<String>, record_id: impl Into<String>, row: Row) -> Self {
        Self {
            table: table.into(),
            record_id: record_id.into(),
            op: ChangeOp::Upsert,
            row: Some(row),
        }
    }

    pub fn delete(table: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            record_id: record_id.into(),
            op: ChangeOp::Delete,
            row: None,
        }
    }

    /// Statement that applies this change in `dialect`.
    ///
    /// # Errors
    /// `Error::InvalidInput` for unsafe identifiers or an upsert without a row.
    pub fn apply_statement(&self, dialect: Dialect) -> Result<(String, Vec<SqlValue>)> {
        validate_identifier(&self.table)?;

        match self.op {
            ChangeOp::Delete => Ok((
                format!("DELETE FROM {} WHERE id = {}", self.table, dialect.placeholder(1)),
                vec![SqlValue::from(self.record_id.as_str())],
            )),
            ChangeOp::Upsert => {
                let row = self.row.as_ref().ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "upsert of {}/{} has no row",
                        self.table, self.record_id
                    ))
                })?;

                let mut columns = vec!["id"];
                let mut params = vec![SqlValue::from(self.record_id.as_str())];
                for (name, value) in row.iter().filter(|(name, _)| name.as_str() != "id") {
                    validate_identifier(name)?;
                    columns.push(name.as_str());
                    params.push(SqlValue::from_json(value));
                }

                let on_conflict = if columns.len() == 1 {
                    "DO NOTHING".to_string()
                } else {
                    let updates: Vec<String> = columns[1..]
                        .iter()
                        .map(|c| format!("{c} = excluded.{c}"))
                        .collect();
                    format!("DO UPDATE SET {}", updates.join(", "))
                };

                Ok((
                    format!(
                        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT (id) {}",
                        self.table,
                        columns.join(", "),
                        dialect.placeholders(1, columns.len()),
                        on_conflict
                    ),
                    params,
                ))
            }
        }
    }
}

/// A recorded change not yet acknowledged by the replica.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    pub id: String,
    pub change: Change,
    pub created_at: DateTime<Utc>,
}

/// Durable log of local changes awaiting push.
#[derive(Clone)]
pub struct ChangeLog {
    store: Arc<dyn Store>,
}

impl ChangeLog {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Record a local change. Returns its log id.
    pub async fn record(&self, change: &Change) -> Result<String> {
        validate_identifier(&change.table)?;
        let d = self.store.dialect();
        let id = uuid::Uuid::new_v4().to_string();
        let row = change
            .row
            .as_ref()
            .map(|row| d.encode_json(&serde_json::Value::Object(row.clone())))
            .unwrap_or(SqlValue::Null);

        let sql = format!(
            "INSERT INTO {} (id, table_name, record_id, operation, row_data, pushed, created_at) \
             VALUES ({})",
            CHANGES_TABLE,
            d.placeholders(1, 7)
        );
        self.store
            .execute(
                &sql,
                &[
                    SqlValue::from(id.as_str()),
                    SqlValue::from(change.table.as_str()),
                    SqlValue::from(change.record_id.as_str()),
                    SqlValue::from(change.op.as_str()),
                    row,
                    d.encode_bool(false),
                    d.encode_timestamp(Utc::now()),
                ],
            )
            .await?;
        Ok(id)
    }

    /// Up to `limit` unpushed changes, oldest first.
    pub async fn pending(&self, limit: usize) -> Result<Vec<PendingChange>> {
        let d = self.store.dialect();
        let sql = format!(
            "SELECT id, table_name, record_id, operation, row_data, created_at FROM {} \
             WHERE pushed = {} ORDER BY created_at ASC, id ASC LIMIT {}",
            CHANGES_TABLE,
            d.placeholder(1),
            limit
        );
        let rows = self.store.query(&sql, &[d.encode_bool(false)]).await?;
        rows.iter().map(|row| self.decode(d, row)).collect()
    }

    /// Mark changes as acknowledged by the replica.
    pub async fn mark_pushed(&self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let d = self.store.dialect();
        let sql = format!(
            "UPDATE {} SET pushed = {} WHERE id IN ({})",
            CHANGES_TABLE,
            d.placeholder(1),
            d.placeholders(2, ids.len())
        );
        let mut params = vec![d.encode_bool(true)];
        params.extend(ids.iter().map(|id| SqlValue::from(id.as_str())));
        self.store.execute(&sql, &params).await
    }

    /// Number of unpushed changes.
    pub async fn pending_count(&self) -> Result<u64> {
        let d = self.store.dialect();
        let sql = format!(
            "SELECT COUNT(*) AS n FROM {} WHERE pushed = {}",
            CHANGES_TABLE,
            d.placeholder(1)
        );
        match self.store.query_one(&sql, &[d.encode_bool(false)]).await? {
            Some(row) => Ok(get_i64(&row, "n")?.max(0) as u64),
            None => Ok(0),
        }
    }

    fn decode(&self, d: Dialect, row: &Row) -> Result<PendingChange> {
        let row_data = match d.decode_json(column(row, "row_data")?) {
            serde_json::Value::Object(map) => Some(map),
            _ => None,
        };
        let created_at = d
            .decode_timestamp(column(row, "created_at")?)
            .ok_or_else(|| Error::Serialization("change has no created_at".to_string()))?;

        Ok(PendingChange {
            id: get_str(row, "id")?,
            change: Change {
                table: get_str(row, "table_name")?,
                record_id: get_str(row, "record_id")?,
                op: ChangeOp::parse(&get_str(row, "operation")?)?,
                row: row_data,
            },
            created_at,
        })
    }
}
