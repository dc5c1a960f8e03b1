//! Conflict detection and resolution.
//!
//! Replication settles record contents. Resolution here is bookkeeping: it
//! decides which side is authoritative, stamps the decision on the conflict
//! row and never writes to the conflicted record itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use fleetsync_common::{Error, Result};
use fleetsync_storage::schema::CONFLICTS_TABLE;
use fleetsync_storage::value::{column, get_i64, get_opt_str, get_str};
use fleetsync_storage::{Dialect, Row, SqlValue, Store};

use crate::journal::{Journal, JournalStatus, NewJournalEntry};

/// Journal entity type for resolution summaries.
pub const JOURNAL_ENTITY: &str = "conflicts";
/// Journal operation for resolution summaries.
pub const JOURNAL_OPERATION: &str = "resolve";

/// How the two sides diverged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides updated the record.
    UpdateUpdate,
    /// Local updated, remote deleted.
    UpdateDelete,
    /// Local deleted, remote updated.
    DeleteUpdate,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpdateUpdate => "update_update",
            Self::UpdateDelete => "update_delete",
            Self::DeleteUpdate => "delete_update",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "update_update" => Ok(Self::UpdateUpdate),
            "update_delete" => Ok(Self::UpdateDelete),
            "delete_update" => Ok(Self::DeleteUpdate),
            other => Err(Error::Serialization(format!("unknown conflict type '{}'", other))),
        }
    }
}

/// Conflict resolution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// The side with the later timestamp wins; ties go to remote.
    #[default]
    LastWriteWins,
    RemoteWins,
    LocalWins,
    /// Leave conflicts for an operator.
    Manual,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LastWriteWins => "last_write_wins",
            Self::RemoteWins => "remote_wins",
            Self::LocalWins => "local_wins",
            Self::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "last_write_wins" => Ok(Self::LastWriteWins),
            "remote_wins" => Ok(Self::RemoteWins),
            "local_wins" => Ok(Self::LocalWins),
            "manual" => Ok(Self::Manual),
            other => Err(Error::InvalidInput(format!(
                "unknown resolution strategy '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side of the sync boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => Err(Error::Serialization(format!("unknown side '{}'", other))),
        }
    }
}

/// A record modified independently on both sides.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conflict {
    pub id: String,
    pub table_name: String,
    pub record_id: String,
    /// `None` when the local side deleted the record.
    pub local_version: Option<Value>,
    /// `None` when the remote side deleted the record.
    pub remote_version: Option<Value>,
    pub local_timestamp: DateTime<Utc>,
    pub remote_timestamp: DateTime<Utc>,
    pub conflict_type: ConflictType,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution_strategy: Option<ResolutionStrategy>,
    pub winning_side: Option<Side>,
    pub detected_at: DateTime<Utc>,
}

impl Conflict {
    /// Timestamp of the given side.
    pub fn timestamp_of(&self, side: Side) -> DateTime<Utc> {
        match side {
            Side::Local => self.local_timestamp,
            Side::Remote => self.remote_timestamp,
        }
    }
}

/// One side's view of a record. `version` is `None` if deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSnapshot {
    pub version: Option<Value>,
    pub modified_at: DateTime<Utc>,
}

/// Classifies divergent snapshots into conflicts.
pub struct ConflictDetector;

impl ConflictDetector {
    /// Compare local and remote snapshots of one record.
    ///
    /// With a `base` (the last version both sides agreed on) a conflict
    /// needs both sides to have moved away from it. Without one, any
    /// disagreement is a conflict.
    pub fn detect(
        table_name: &str,
        record_id: &str,
        base: Option<&Value>,
        local: &RecordSnapshot,
        remote: &RecordSnapshot,
    ) -> Option<Conflict> {
        if local.version == remote.version {
            return None;
        }

        if let Some(base) = base {
            let local_changed = local.version.as_ref() != Some(base);
            let remote_changed = remote.version.as_ref() != Some(base);
            if !(local_changed && remote_changed) {
                return None;
            }
        }

        let conflict_type = match (&local.version, &remote.version) {
            (Some(_), Some(_)) => ConflictType::UpdateUpdate,
            (Some(_), None) => ConflictType::UpdateDelete,
            (None, Some(_)) => ConflictType::DeleteUpdate,
            (None, None) => return None,
        };

        Some(Conflict {
            id: uuid::Uuid::new_v4().to_string(),
            table_name: table_name.to_string(),
            record_id: record_id.to_string(),
            local_version: local.version.clone(),
            remote_version: remote.version.clone(),
            local_timestamp: local.modified_at,
            remote_timestamp: remote.modified_at,
            conflict_type,
            resolved: false,
            resolved_at: None,
            resolved_by: None,
            resolution_strategy: None,
            winning_side: None,
            detected_at: Utc::now(),
        })
    }
}

/// Decision stamped onto a resolved conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub strategy: ResolutionStrategy,
    pub winning_side: Side,
    pub resolved_by: String,
    pub resolved_at: DateTime<Utc>,
}

/// Persistent conflict records.
#[derive(Clone)]
pub struct ConflictLog {
    store: Arc<dyn Store>,
}

impl ConflictLog {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn dialect(&self) -> Dialect {
        self.store.dialect()
    }

    /// Persist a detected conflict.
    pub async fn record(&self, conflict: &Conflict) -> Result<()> {
        let d = self.dialect();
        let mut columns: Vec<&str> = vec![
            "id",
            "table_name",
            "record_id",
            "local_timestamp",
            "remote_timestamp",
            "conflict_type",
            "resolved",
            "detected_at",
        ];
        let mut params = vec![
            SqlValue::from(conflict.id.as_str()),
            SqlValue::from(conflict.table_name.as_str()),
            SqlValue::from(conflict.record_id.as_str()),
            d.encode_timestamp(conflict.local_timestamp),
            d.encode_timestamp(conflict.remote_timestamp),
            SqlValue::from(conflict.conflict_type.as_str()),
            d.encode_bool(false),
            d.encode_timestamp(conflict.detected_at),
        ];
        // Absent versions are left NULL by omission.
        if let Some(version) = &conflict.local_version {
            columns.push("local_version");
            params.push(d.encode_json(version));
        }
        if let Some(version) = &conflict.remote_version {
            columns.push("remote_version");
            params.push(d.encode_json(version));
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            CONFLICTS_TABLE,
            columns.join(", "),
            d.placeholders(1, params.len())
        );
        self.store.execute(&sql, &params).await?;
        debug!(
            conflict = %conflict.id,
            table = %conflict.table_name,
            record = %conflict.record_id,
            kind = conflict.conflict_type.as_str(),
            "Recorded conflict"
        );
        Ok(())
    }

    /// Up to `limit` unresolved conflicts, oldest first.
    pub async fn fetch_unresolved(&self, limit: usize) -> Result<Vec<Conflict>> {
        let d = self.dialect();
        let sql = format!(
            "SELECT * FROM {} WHERE resolved = {} ORDER BY detected_at ASC, id ASC LIMIT {}",
            CONFLICTS_TABLE,
            d.placeholder(1),
            limit
        );
        let rows = self.store.query(&sql, &[d.encode_bool(false)]).await?;
        rows.iter().map(|row| self.decode(row)).collect()
    }

    /// Look up one conflict.
    pub async fn get(&self, id: &str) -> Result<Option<Conflict>> {
        let d = self.dialect();
        let sql = format!(
            "SELECT * FROM {} WHERE id = {}",
            CONFLICTS_TABLE,
            d.placeholder(1)
        );
        match self.store.query_one(&sql, &[id.into()]).await? {
            Some(row) => self.decode(&row).map(Some),
            None => Ok(None),
        }
    }

    /// Number of unresolved conflicts.
    pub async fn count_unresolved(&self) -> Result<u64> {
        let d = self.dialect();
        let sql = format!(
            "SELECT COUNT(*) AS n FROM {} WHERE resolved = {}",
            CONFLICTS_TABLE,
            d.placeholder(1)
        );
        match self.store.query_one(&sql, &[d.encode_bool(false)]).await? {
            Some(row) => Ok(get_i64(&row, "n")?.max(0) as u64),
            None => Ok(0),
        }
    }

    /// Stamp a resolution. Returns `false` if the conflict was already
    /// resolved.
    pub async fn mark_resolved(&self, id: &str, resolution: &Resolution) -> Result<bool> {
        let d = self.dialect();
        let sql = format!(
            "UPDATE {} SET resolved = {}, resolved_at = {}, resolved_by = {}, \
             resolution_strategy = {}, winning_side = {} WHERE id = {} AND resolved = {}",
            CONFLICTS_TABLE,
            d.placeholder(1),
            d.placeholder(2),
            d.placeholder(3),
            d.placeholder(4),
            d.placeholder(5),
            d.placeholder(6),
            d.placeholder(7)
        );
        let affected = self
            .store
            .execute(
                &sql,
                &[
                    d.encode_bool(true),
                    d.encode_timestamp(resolution.resolved_at),
                    resolution.resolved_by.as_str().into(),
                    resolution.strategy.as_str().into(),
                    resolution.winning_side.as_str().into(),
                    id.into(),
                    d.encode_bool(false),
                ],
            )
            .await?;
        Ok(affected > 0)
    }

    fn decode(&self, row: &Row) -> Result<Conflict> {
        let d = self.dialect();
        let timestamp = |name: &str| -> Result<DateTime<Utc>> {
            d.decode_timestamp(column(row, name)?).ok_or_else(|| {
                Error::Serialization(format!("conflict column '{}' is not a timestamp", name))
            })
        };
        let optional_json = |name: &str| -> Result<Option<Value>> {
            Ok(match column(row, name)? {
                Value::Null => None,
                value => Some(d.decode_json(value)),
            })
        };

        Ok(Conflict {
            id: get_str(row, "id")?,
            table_name: get_str(row, "table_name")?,
            record_id: get_str(row, "record_id")?,
            local_version: optional_json("local_version")?,
            remote_version: optional_json("remote_version")?,
            local_timestamp: timestamp("local_timestamp")?,
            remote_timestamp: timestamp("remote_timestamp")?,
            conflict_type: ConflictType::parse(&get_str(row, "conflict_type")?)?,
            resolved: d.decode_bool(column(row, "resolved")?),
            resolved_at: match column(row, "resolved_at")? {
                Value::Null => None,
                value => d.decode_timestamp(value),
            },
            resolved_by: get_opt_str(row, "resolved_by")?,
            resolution_strategy: get_opt_str(row, "resolution_strategy")?
                .map(|s| ResolutionStrategy::parse(&s))
                .transpose()?,
            winning_side: get_opt_str(row, "winning_side")?
                .map(|s| Side::parse(&s))
                .transpose()?,
            detected_at: timestamp("detected_at")?,
        })
    }
}

/// Counts from one resolution pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionSummary {
    pub examined: usize,
    pub resolved: usize,
    pub pending: usize,
    pub failed: usize,
}

/// Applies a resolution policy to unresolved conflicts.
pub struct ConflictResolver {
    log: ConflictLog,
    journal: Journal,
    strategy: ResolutionStrategy,
    resolver_id: String,
    batch_limit: usize,
}

impl ConflictResolver {
    pub fn new(store: Arc<dyn Store>, strategy: ResolutionStrategy) -> Self {
        Self {
            log: ConflictLog::new(store.clone()),
            journal: Journal::new(store),
            strategy,
            resolver_id: "sync-manager".to_string(),
            batch_limit: 100,
        }
    }

    /// Identity stamped into `resolved_by`.
    pub fn with_resolver_id(mut self, resolver_id: impl Into<String>) -> Self {
        self.resolver_id = resolver_id.into();
        self
    }

    pub fn with_batch_limit(mut self, batch_limit: usize) -> Self {
        self.batch_limit = batch_limit.max(1);
        self
    }

    pub fn strategy(&self) -> ResolutionStrategy {
        self.strategy
    }

    pub fn log(&self) -> &ConflictLog {
        &self.log
    }

    /// Winning side under `strategy`, or `None` if left for an operator.
    pub fn decide(strategy: ResolutionStrategy, conflict: &Conflict) -> Option<Side> {
        match strategy {
            ResolutionStrategy::LastWriteWins => {
                if conflict.local_timestamp > conflict.remote_timestamp {
                    Some(Side::Local)
                } else {
                    Some(Side::Remote)
                }
            }
            ResolutionStrategy::RemoteWins => Some(Side::Remote),
            ResolutionStrategy::LocalWins => Some(Side::Local),
            ResolutionStrategy::Manual => None,
        }
    }

    /// Resolve one batch of unresolved conflicts and journal a summary.
    ///
    /// Per-conflict failures are counted, not propagated. Only fetching the
    /// batch can fail the pass.
    pub async fn resolve_pending(&self) -> Result<ResolutionSummary> {
        let conflicts = self.log.fetch_unresolved(self.batch_limit).await?;
        let mut summary = ResolutionSummary {
            examined: conflicts.len(),
            ..Default::default()
        };

        for conflict in &conflicts {
            let Some(side) = Self::decide(self.strategy, conflict) else {
                summary.pending += 1;
                continue;
            };

            let resolution = Resolution {
                strategy: self.strategy,
                winning_side: side,
                resolved_by: self.resolver_id.clone(),
                resolved_at: Utc::now(),
            };
            match self.log.mark_resolved(&conflict.id, &resolution).await {
                Ok(true) => summary.resolved += 1,
                Ok(false) => debug!(conflict = %conflict.id, "Conflict already resolved elsewhere"),
                Err(e) => {
                    warn!(conflict = %conflict.id, "Failed to resolve conflict: {}", e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            strategy = %self.strategy,
            examined = summary.examined,
            resolved = summary.resolved,
            pending = summary.pending,
            failed = summary.failed,
            "Conflict resolution pass complete"
        );

        let status = if summary.failed == 0 {
            JournalStatus::Synced
        } else {
            JournalStatus::Failed
        };
        let entry = NewJournalEntry::new(JOURNAL_ENTITY, "batch", JOURNAL_OPERATION, status)
            .with_payload(json!({
                "strategy": self.strategy.as_str(),
                "resolver": self.resolver_id,
                "examined": summary.examined,
                "resolved": summary.resolved,
                "pending": summary.pending,
                "failed": summary.failed,
            }));
        if let Err(e) = self.journal.append(entry).await {
            warn!("Failed to journal conflict resolution summary: {}", e);
        }

        Ok(summary)
    }
}
