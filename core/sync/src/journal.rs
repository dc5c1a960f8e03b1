//! Append-only sync journal.
//!
//! The journal records every sync attempt and its outcome. Entries are never
//! updated or deleted; this API has no operation that would do either.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use fleetsync_common::{Error, Result};
use fleetsync_storage::schema::JOURNAL_TABLE;
use fleetsync_storage::value::{column, get_i64, get_str};
use fleetsync_storage::{Dialect, Row, SqlValue, Store};

/// Outcome recorded on a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalStatus {
    Pending,
    Synced,
    Failed,
}

impl JournalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Serialization(format!(
                "unknown journal status '{}'",
                other
            ))),
        }
    }
}

/// A persisted journal entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JournalEntry {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: String,
    pub payload: Value,
    pub sync_status: JournalStatus,
    pub created_at: DateTime<Utc>,
}

/// An entry about to be appended.
#[derive(Debug, Clone)]
pub struct NewJournalEntry {
    pub entity_type: String,
    pub entity_id: String,
    pub operation: String,
    pub payload: Value,
    pub sync_status: JournalStatus,
}

impl NewJournalEntry {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        operation: impl Into<String>,
        sync_status: JournalStatus,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation: operation.into(),
            payload: Value::Object(Default::default()),
            sync_status,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Append-only journal over the uniform store.
#[derive(Clone)]
pub struct Journal {
    store: Arc<dyn Store>,
}

impl Journal {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn dialect(&self) -> Dialect {
        self.store.dialect()
    }

    /// Append an entry.
    pub async fn append(&self, entry: NewJournalEntry) -> Result<JournalEntry> {
        let d = self.dialect();
        let created = JournalEntry {
            id: uuid::Uuid::new_v4().to_string(),
            entity_type: entry.entity_type,
            entity_id: entry.entity_id,
            operation: entry.operation,
            payload: entry.payload,
            sync_status: entry.sync_status,
            created_at: Utc::now(),
        };

        let sql = format!(
            "INSERT INTO {} (id, entity_type, entity_id, operation, payload, sync_status, created_at) \
             VALUES ({})",
            JOURNAL_TABLE,
            d.placeholders(1, 7)
        );
        self.store
            .execute(
                &sql,
                &[
                    SqlValue::from(created.id.as_str()),
                    SqlValue::from(created.entity_type.as_str()),
                    SqlValue::from(created.entity_id.as_str()),
                    SqlValue::from(created.operation.as_str()),
                    d.encode_json(&created.payload),
                    SqlValue::from(created.sync_status.as_str()),
                    d.encode_timestamp(created.created_at),
                ],
            )
            .await?;

        Ok(created)
    }

    /// Most recent entries, newest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<JournalEntry>> {
        let sql = format!(
            "SELECT id, entity_type, entity_id, operation, payload, sync_status, created_at \
             FROM {} ORDER BY created_at DESC LIMIT {}",
            JOURNAL_TABLE, limit
        );
        let rows = self.store.query(&sql, &[]).await?;
        rows.iter().map(|row| self.decode(row)).collect()
    }

    /// Number of entries of `entity_type` with the given status.
    pub async fn count_by_status(&self, entity_type: &str, status: JournalStatus) -> Result<u64> {
        let d = self.dialect();
        let sql = format!(
            "SELECT COUNT(*) AS n FROM {} WHERE entity_type = {} AND sync_status = {}",
            JOURNAL_TABLE,
            d.placeholder(1),
            d.placeholder(2)
        );
        let row = self
            .store
            .query_one(&sql, &[entity_type.into(), status.as_str().into()])
            .await?;
        match row {
            Some(row) => Ok(get_i64(&row, "n")?.max(0) as u64),
            None => Ok(0),
        }
    }

    /// Total number of entries.
    pub async fn total(&self) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) AS n FROM {}", JOURNAL_TABLE);
        match self.store.query_one(&sql, &[]).await? {
            Some(row) => Ok(get_i64(&row, "n")?.max(0) as u64),
            None => Ok(0),
        }
    }

    /// Time of the newest successful entry for `entity_type`/`operation`.
    pub async fn last_success(
        &self,
        entity_type: &str,
        operation: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let d = self.dialect();
        let sql = format!(
            "SELECT MAX(created_at) AS last FROM {} \
             WHERE entity_type = {} AND operation = {} AND sync_status = {}",
            JOURNAL_TABLE,
            d.placeholder(1),
            d.placeholder(2),
            d.placeholder(3)
        );
        let row = self
            .store
            .query_one(
                &sql,
                &[
                    entity_type.into(),
                    operation.into(),
                    JournalStatus::Synced.as_str().into(),
                ],
            )
            .await?;
        Ok(row.and_then(|row| row.get("last").and_then(|v| d.decode_timestamp(v))))
    }

    fn decode(&self, row: &Row) -> Result<JournalEntry> {
        let d = self.dialect();
        let created_at = d
            .decode_timestamp(column(row, "created_at")?)
            .ok_or_else(|| Error::Serialization("journal entry has no created_at".to_string()))?;

        Ok(JournalEntry {
            id: get_str(row, "id")?,
            entity_type: get_str(row, "entity_type")?,
            entity_id: get_str(row, "entity_id")?,
            operation: get_str(row, "operation")?,
            payload: d.decode_json(column(row, "payload")?),
            sync_status: JournalStatus::parse(&get_str(row, "sync_status")?)?,
            created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::memory_store;
    use serde_json::json;

    #[tokio::test]
    async fn test_append_and_read_back() {
        let journal = Journal::new(memory_store().await);

        let entry = journal
            .append(
                NewJournalEntry::new("sync", "node", "sync_pass", JournalStatus::Synced)
                    .with_payload(json!({"duration_ms": 12})),
            )
            .await
            .unwrap();

        let recent = journal.recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, entry.id);
        assert_eq!(recent[0].payload, json!({"duration_ms": 12}));
        assert_eq!(recent[0].sync_status, JournalStatus::Synced);
        assert_eq!(
            recent[0].created_at.timestamp_millis(),
            entry.created_at.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_counts_and_last_success() {
        let journal = Journal::new(memory_store().await);
        assert_eq!(journal.last_success("sync", "sync_pass").await.unwrap(), None);

        journal
            .append(NewJournalEntry::new("sync", "node", "sync_pass", JournalStatus::Failed))
            .await
            .unwrap();
        assert_eq!(journal.last_success("sync", "sync_pass").await.unwrap(), None);

        let ok = journal
            .append(NewJournalEntry::new("sync", "node", "sync_pass", JournalStatus::Synced))
            .await
            .unwrap();
        journal
            .append(NewJournalEntry::new("conflicts", "batch", "resolve", JournalStatus::Synced))
            .await
            .unwrap();

        assert_eq!(
            journal.count_by_status("sync", JournalStatus::Failed).await.unwrap(),
            1
        );
        assert_eq!(journal.total().await.unwrap(), 3);
        let last = journal.last_success("sync", "sync_pass").await.unwrap().unwrap();
        assert_eq!(last.timestamp_millis(), ok.created_at.timestamp_millis());
    }

    #[test]
    fn test_status_names() {
        for status in [JournalStatus::Pending, JournalStatus::Synced, JournalStatus::Failed] {
            assert_eq!(JournalStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(JournalStatus::parse("done").is_err());
    }
}
