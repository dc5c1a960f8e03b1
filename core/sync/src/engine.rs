//! Sync manager: the periodic engine that drives replication, conflict
//! handling and outbox draining on disconnected nodes.

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use fleetsync_common::{InFlightGuard, PeriodicTask, Result};
use fleetsync_storage::{ReplicationReport, StorageContext};

use crate::conflict::{ConflictResolver, ResolutionStrategy, ResolutionSummary};
use crate::journal::{Journal, JournalStatus, NewJournalEntry};
use crate::outbox::{Broadcaster, DrainReport, Outbox};
use crate::state::{SyncLifecycle, SyncState};

/// Journal entity type for sync passes.
pub const JOURNAL_ENTITY: &str = "sync";
/// Journal operation for sync passes.
pub const JOURNAL_OPERATION: &str = "sync_pass";

/// Configuration for the sync manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between periodic passes.
    pub interval_secs: u64,
    /// Gap since the last success after which conflicts are resolved.
    pub long_offline_threshold_secs: u64,
    /// Maximum outbox events drained per pass.
    pub outbox_batch_size: usize,
    pub conflict_strategy: ResolutionStrategy,
    /// Maximum conflicts examined per resolution pass.
    pub conflict_batch_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            long_offline_threshold_secs: 24 * 60 * 60,
            outbox_batch_size: 100,
            conflict_strategy: ResolutionStrategy::LastWriteWins,
            conflict_batch_limit: 100,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn long_offline_threshold(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.long_offline_threshold_secs.min(i64::MAX as u64) as i64)
    }
}

/// Outcome of an operator-triggered sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRunResult {
    pub success: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct PassOutcome {
    replication: Option<ReplicationReport>,
    conflicts: Option<ResolutionSummary>,
    outbox: DrainReport,
}

struct SyncInner {
    context: Arc<StorageContext>,
    journal: Journal,
    outbox: Outbox,
    resolver: ConflictResolver,
    broadcaster: Arc<dyn Broadcaster>,
    config: SyncConfig,
    state: RwLock<SyncState>,
    guard: InFlightGuard,
}

impl SyncInner {
    /// Timer-driven pass: skipped if another pass holds the guard.
    async fn periodic_pass(&self) -> Option<SyncRunResult> {
        let Some(_permit) = self.guard.try_enter() else {
            debug!("Sync pass still in flight, skipping tick");
            self.state.write().await.record_skip();
            return None;
        };
        Some(self.run_pass().await)
    }

    /// One full pass. Never fails; errors land in the result and journal.
    async fn run_pass(&self) -> SyncRunResult {
        let started = Instant::now();
        let now = Utc::now();
        let offline = self.state.read().await.offline_duration(now);

        let outcome = self.try_pass().await;
        let duration_ms = started.elapsed().as_millis() as u64;
        let finished = Utc::now();

        match outcome {
            Ok(outcome) => {
                self.state.write().await.record_success(finished, duration_ms);
                info!(
                    duration_ms,
                    drained = outcome.outbox.processed,
                    failed_events = outcome.outbox.failed,
                    "Sync pass completed"
                );

                let payload = json!({
                    "duration_ms": duration_ms,
                    "offline_duration_ms": offline.map(|d| d.num_milliseconds()),
                    "replication": outcome.replication,
                    "conflicts": outcome.conflicts,
                    "outbox": outcome.outbox,
                });
                self.journal_pass(JournalStatus::Synced, payload).await;

                SyncRunResult {
                    success: true,
                    duration_ms,
                    error: None,
                }
            }
            Err(e) => {
                let error = e.to_string();
                let transient = e.is_transient();
                let failures = {
                    let mut state = self.state.write().await;
                    state.record_failure(finished, duration_ms, error.clone());
                    state.consecutive_failures
                };
                if transient {
                    warn!(duration_ms, consecutive_failures = failures, "Sync pass failed, will retry: {}", error);
                } else {
                    error!(duration_ms, consecutive_failures = failures, "Sync pass failed: {}", error);
                }

                let payload = json!({
                    "duration_ms": duration_ms,
                    "error": error,
                    "transient": transient,
                });
                self.journal_pass(JournalStatus::Failed, payload).await;

                SyncRunResult {
                    success: false,
                    duration_ms,
                    error: Some(error),
                }
            }
        }
    }

    async fn try_pass(&self) -> Result<PassOutcome> {
        // 1. Replication
        let replication_started = Instant::now();
        let replication = self.context.replicate().await?;
        match &replication {
            Some(report) => debug!(
                pulled = report.frames_pulled,
                pushed = report.frames_pushed,
                elapsed_ms = replication_started.elapsed().as_millis() as u64,
                "Replication step done"
            ),
            None => debug!("No replica configured, skipping replication"),
        }

        // 2. Conflict resolution after a long gap
        let long_offline = self
            .state
            .read()
            .await
            .is_long_offline(Utc::now(), self.config.long_offline_threshold());
        let conflicts = if long_offline {
            info!("Long offline gap detected, resolving conflicts");
            match self.resolver.resolve_pending().await {
                Ok(summary) => Some(summary),
                Err(e) => {
                    warn!("Conflict resolution failed, continuing: {}", e);
                    None
                }
            }
        } else {
            None
        };

        // 3. Outbox
        let outbox = self
            .outbox
            .drain(self.broadcaster.as_ref(), self.config.outbox_batch_size)
            .await?;

        Ok(PassOutcome {
            replication,
            conflicts,
            outbox,
        })
    }

    async fn journal_pass(&self, status: JournalStatus, payload: serde_json::Value) {
        let entry = NewJournalEntry::new(
            JOURNAL_ENTITY,
            self.context.mode().as_str(),
            JOURNAL_OPERATION,
            status,
        )
        .with_payload(payload);

        if let Err(e) = self.journal.append(entry).await {
            warn!("Failed to write sync journal entry: {}", e);
        }
    }
}

/// Periodic sync engine. A no-op in connected mode.
pub struct SyncManager {
    inner: Arc<SyncInner>,
    task: PeriodicTask,
}

impl SyncManager {
    /// Create a sync manager.
    ///
    /// On disconnected nodes the last successful pass is recovered from the
    /// journal so long-offline detection survives restarts.
    pub async fn new(
        context: Arc<StorageContext>,
        broadcaster: Arc<dyn Broadcaster>,
        config: SyncConfig,
    ) -> Self {
        let store = context.store();
        let journal = Journal::new(store.clone());

        let last_success = if context.is_disconnected() {
            match journal.last_success(JOURNAL_ENTITY, JOURNAL_OPERATION).await {
                Ok(last) => last,
                Err(e) => {
                    warn!("Could not read last sync success from journal: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let resolver = ConflictResolver::new(store.clone(), config.conflict_strategy)
            .with_batch_limit(config.conflict_batch_limit);

        Self {
            inner: Arc::new(SyncInner {
                context,
                journal,
                outbox: Outbox::new(store),
                resolver,
                broadcaster,
                config,
                state: RwLock::new(SyncState::with_last_success(last_success)),
                guard: InFlightGuard::new(),
            }),
            task: PeriodicTask::new("sync"),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn journal(&self) -> &Journal {
        &self.inner.journal
    }

    pub fn outbox(&self) -> &Outbox {
        &self.inner.outbox
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.inner.resolver
    }

    /// Run one pass now, then schedule periodic passes.
    ///
    /// Returns `false` in connected mode or if already started.
    pub async fn start(&self) -> bool {
        if !self.inner.context.is_disconnected() {
            info!("Sync manager is idle in connected mode");
            return false;
        }

        {
            let mut state = self.inner.state.write().await;
            if state.lifecycle != SyncLifecycle::Stopped {
                debug!("Sync manager already started");
                return false;
            }
            state.lifecycle = SyncLifecycle::Starting;
        }

        let interval = self.inner.config.interval();
        info!(interval_secs = interval.as_secs(), "Starting sync manager");
        self.inner.periodic_pass().await;

        let mut state = self.inner.state.write().await;
        if state.lifecycle != SyncLifecycle::Starting {
            // Stopped during the initial pass.
            return false;
        }

        let inner = self.inner.clone();
        let scheduled = self.task.start(interval, interval, move || {
            let inner = inner.clone();
            async move {
                inner.periodic_pass().await;
            }
        });
        state.lifecycle = if scheduled {
            SyncLifecycle::Running
        } else {
            SyncLifecycle::Stopped
        };
        scheduled
    }

    /// Timer-style pass. Returns `None` if skipped because a pass is in
    /// flight, or in connected mode.
    pub async fn perform_sync(&self) -> Option<SyncRunResult> {
        if !self.inner.context.is_disconnected() {
            debug!("Sync skipped in connected mode");
            return None;
        }
        self.inner.periodic_pass().await
    }

    /// Operator-triggered pass. Waits for a running pass, then runs.
    pub async fn manual_sync(&self) -> SyncRunResult {
        if !self.inner.context.is_disconnected() {
            return SyncRunResult {
                success: false,
                duration_ms: 0,
                error: Some("sync is disabled in connected mode".to_string()),
            };
        }
        let _permit = self.inner.guard.enter().await;
        self.inner.run_pass().await
    }

    /// Cancel future passes. Returns `true` if the manager was started.
    pub async fn stop(&self) -> bool {
        let cancelled = self.task.stop();
        let mut state = self.inner.state.write().await;
        let was_started = state.lifecycle != SyncLifecycle::Stopped;
        state.lifecycle = SyncLifecycle::Stopped;
        if cancelled || was_started {
            info!("Sync manager stopped");
        }
        cancelled || was_started
    }

    /// Stop and wait for an in-flight pass to finish.
    pub async fn shutdown(&self) {
        self.stop().await;
        self.task.shutdown().await;
    }

    /// Whether the periodic timer is scheduled.
    pub fn is_scheduled(&self) -> bool {
        self.task.is_running()
    }

    pub async fn status(&self) -> SyncState {
        self.inner.state.read().await.clone()
    }
}
