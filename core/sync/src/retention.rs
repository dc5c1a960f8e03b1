//! Retention: periodic pruning of aged time-series rows.
//!
//! Each data class deletes rows whose timestamp is strictly older than
//! `now - window`. A row exactly `window` old is kept. The cutoff is bound
//! in the backend's native timestamp representation, so epoch-millisecond
//! columns on SQLite and `TIMESTAMPTZ` columns on PostgreSQL compare
//! correctly.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use fleetsync_common::{InFlightGuard, PeriodicTask, Result};
use fleetsync_storage::{validate_identifier, Dialect, Store};

/// Category of time-series data with its own retention window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataClass {
    RawTelemetry,
    Aggregates,
    DataQuality,
}

impl DataClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RawTelemetry => "raw_telemetry",
            Self::Aggregates => "aggregates",
            Self::DataQuality => "data_quality",
        }
    }
}

/// Where a data class lives and how long it is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionTarget {
    pub class: DataClass,
    pub table: String,
    pub timestamp_column: String,
    pub retention_days: u32,
}

impl RetentionTarget {
    pub fn new(
        class: DataClass,
        table: impl Into<String>,
        timestamp_column: impl Into<String>,
        retention_days: u32,
    ) -> Self {
        Self {
            class,
            table: table.into(),
            timestamp_column: timestamp_column.into(),
            retention_days,
        }
    }

    /// Rows older than this are deleted.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - ChronoDuration::days(i64::from(self.retention_days))
    }
}

/// Configuration for the pruning service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub targets: Vec<RetentionTarget>,
    /// Seconds between pruning passes.
    pub interval_secs: u64,
    /// Total deletions above which storage is reclaimed.
    pub reclaim_threshold: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            targets: vec![
                RetentionTarget::new(DataClass::RawTelemetry, "telemetry_readings", "recorded_at", 90),
                RetentionTarget::new(DataClass::Aggregates, "telemetry_aggregates", "bucket_start", 365),
                RetentionTarget::new(DataClass::DataQuality, "data_quality_metrics", "measured_at", 180),
            ],
            interval_secs: 24 * 60 * 60,
            reclaim_threshold: 1000,
        }
    }
}

impl RetentionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    /// Override the window of every target of `class`.
    pub fn set_retention_days(&mut self, class: DataClass, days: u32) {
        for target in self.targets.iter_mut().filter(|t| t.class == class) {
            target.retention_days = days;
        }
    }

    pub fn retention_days(&self, class: DataClass) -> Option<u32> {
        self.targets
            .iter()
            .find(|t| t.class == class)
            .map(|t| t.retention_days)
    }
}

/// Per-class outcome of a pruning pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassOutcome {
    pub class: DataClass,
    pub table: String,
    pub cutoff: String,
    pub deleted: u64,
    /// Table absent on this backend.
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a pruning pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneRunResult {
    pub success: bool,
    pub duration_ms: u64,
    pub deleted: u64,
    pub classes: Vec<ClassOutcome>,
    pub reclaimed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct PruneInner {
    store: Arc<dyn Store>,
    config: RetentionConfig,
    guard: InFlightGuard,
}

impl PruneInner {
    async fn periodic_pass(&self) -> Option<PruneRunResult> {
        let Some(_permit) = self.guard.try_enter() else {
            debug!("Pruning pass still in flight, skipping tick");
            return None;
        };
        Some(self.run_at(Utc::now()).await)
    }

    async fn run_at(&self, now: DateTime<Utc>) -> PruneRunResult {
        let started = Instant::now();
        let dialect = self.store.dialect();
        let mut classes = Vec::with_capacity(self.config.targets.len());

        for target in &self.config.targets {
            let cutoff = target.cutoff(now);
            let mut outcome = ClassOutcome {
                class: target.class,
                table: target.table.clone(),
                cutoff: Dialect::display_timestamp(cutoff),
                deleted: 0,
                skipped: false,
                error: None,
            };

            match self.prune_target(target, cutoff).await {
                Ok(Some(deleted)) => {
                    if deleted > 0 {
                        info!(
                            class = target.class.as_str(),
                            table = %target.table,
                            deleted,
                            "Pruned aged rows"
                        );
                    }
                    outcome.deleted = deleted;
                }
                Ok(None) => {
                    debug!(table = %target.table, "Retention table absent, skipping");
                    outcome.skipped = true;
                }
                Err(e) => {
                    warn!(class = target.class.as_str(), table = %target.table, "Pruning failed: {}", e);
                    outcome.error = Some(e.to_string());
                }
            }
            classes.push(outcome);
        }

        let deleted: u64 = classes.iter().map(|c| c.deleted).sum();
        let mut errors: Vec<String> = classes
            .iter()
            .filter_map(|c| c.error.as_ref().map(|e| format!("{}: {}", c.class.as_str(), e)))
            .collect();

        let mut reclaimed = false;
        if deleted > self.config.reclaim_threshold {
            let affected: Vec<&str> = classes
                .iter()
                .filter(|c| c.deleted > 0)
                .map(|c| c.table.as_str())
                .collect();
            match self.reclaim(dialect, &affected).await {
                Ok(()) => {
                    info!(deleted, tables = affected.len(), "Reclaimed storage after pruning");
                    reclaimed = true;
                }
                Err(e) => {
                    warn!("Storage reclamation failed: {}", e);
                    errors.push(format!("reclaim: {}", e));
                }
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(deleted, duration_ms, "Pruning pass complete");

        PruneRunResult {
            success: errors.is_empty(),
            duration_ms,
            deleted,
            classes,
            reclaimed,
            error: if errors.is_empty() {
                None
            } else {
                Some(errors.join("; "))
            },
        }
    }

    /// Delete aged rows of one target. `Ok(None)` if the table is absent.
    async fn prune_target(
        &self,
        target: &RetentionTarget,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<u64>> {
        validate_identifier(&target.table)?;
        validate_identifier(&target.timestamp_column)?;

        if !self.store.table_exists(&target.table).await? {
            return Ok(None);
        }

        let dialect = self.store.dialect();
        let sql = format!(
            "DELETE FROM {} WHERE {} < {}",
            target.table,
            target.timestamp_column,
            dialect.placeholder(1)
        );
        let deleted = self
            .store
            .execute(&sql, &[dialect.encode_timestamp(cutoff)])
            .await?;
        Ok(Some(deleted))
    }

    async fn reclaim(&self, dialect: Dialect, tables: &[&str]) -> Result<()> {
        for statement in dialect.reclaim_storage_sql(tables) {
            self.store.execute(&statement, &[]).await?;
        }
        Ok(())
    }
}

/// Periodic pruning of aged time-series rows.
pub struct PruningService {
    inner: Arc<PruneInner>,
    task: PeriodicTask,
}

impl PruningService {
    pub fn new(store: Arc<dyn Store>, config: RetentionConfig) -> Self {
        Self {
            inner: Arc::new(PruneInner {
                store,
                config,
                guard: InFlightGuard::new(),
            }),
            task: PeriodicTask::new("pruning"),
        }
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.inner.config
    }

    /// Schedule pruning: one pass right away, then every interval.
    /// Returns `false` if already running.
    pub fn start(&self) -> bool {
        let inner = self.inner.clone();
        self.task
            .start(self.inner.config.interval(), Duration::ZERO, move || {
                let inner = inner.clone();
                async move {
                    inner.periodic_pass().await;
                }
            })
    }

    /// Timer-style pass. `None` if another pass is in flight.
    pub async fn perform_pruning(&self) -> Option<PruneRunResult> {
        self.inner.periodic_pass().await
    }

    /// Operator-triggered pass. Waits for a running pass, then runs.
    pub async fn manual_prune(&self) -> PruneRunResult {
        self.prune_at(Utc::now()).await
    }

    /// Operator-triggered pass with an explicit reference time.
    pub async fn prune_at(&self, now: DateTime<Utc>) -> PruneRunResult {
        let _permit = self.inner.guard.enter().await;
        self.inner.run_at(now).await
    }

    pub fn stop(&self) -> bool {
        self.task.stop()
    }

    pub async fn shutdown(&self) {
        self.task.shutdown().await;
    }

    pub fn is_scheduled(&self) -> bool {
        self.task.is_running()
    }
}
