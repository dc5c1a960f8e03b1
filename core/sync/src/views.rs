//! Materialized view refresh.
//!
//! Only backends with materialized views get a schedule; on SQLite the
//! scheduler stays idle and `refresh_all` reports the backend as unsupported.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use fleetsync_common::{Error, InFlightGuard, PeriodicTask, Result};
use fleetsync_storage::{validate_identifier, Store};

/// Configuration for the view refresh scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewRefreshConfig {
    /// Materialized views to refresh, in order.
    pub views: Vec<String>,
    pub interval_secs: u64,
    /// Delay before the first refresh after startup.
    pub startup_delay_secs: u64,
}

impl Default for ViewRefreshConfig {
    fn default() -> Self {
        Self {
            views: vec![
                "daily_telemetry_summary".to_string(),
                "equipment_status_rollup".to_string(),
                "data_quality_daily".to_string(),
            ],
            interval_secs: 300,
            startup_delay_secs: 10,
        }
    }
}

impl ViewRefreshConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }
}

/// Outcome of refreshing one view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewOutcome {
    pub view: String,
    pub refreshed: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a refresh pass over every configured view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewRefreshReport {
    pub views: Vec<ViewOutcome>,
    pub duration_ms: u64,
}

impl ViewRefreshReport {
    pub fn refreshed(&self) -> usize {
        self.views.iter().filter(|v| v.refreshed).count()
    }

    pub fn failed(&self) -> usize {
        self.views.iter().filter(|v| v.error.is_some()).count()
    }
}

struct RefreshInner {
    store: Arc<dyn Store>,
    config: ViewRefreshConfig,
    guard: InFlightGuard,
}

impl RefreshInner {
    async fn periodic_pass(&self) {
        let Some(_permit) = self.guard.try_enter() else {
            debug!("View refresh still in flight, skipping tick");
            return;
        };
        if let Err(e) = self.run().await {
            warn!("View refresh pass failed: {}", e);
        }
    }

    async fn run(&self) -> Result<ViewRefreshReport> {
        let dialect = self.store.dialect();
        if !dialect.supports_materialized_views() {
            return Err(Error::Unsupported(format!(
                "{} has no materialized views",
                dialect
            )));
        }

        let started = Instant::now();
        let mut report = ViewRefreshReport::default();
        for view in &self.config.views {
            let view_started = Instant::now();
            let error = self.refresh_view(view).await.err().map(|e| {
                warn!(view = %view, "Failed to refresh materialized view: {}", e);
                e.to_string()
            });
            report.views.push(ViewOutcome {
                view: view.clone(),
                refreshed: error.is_none(),
                duration_ms: view_started.elapsed().as_millis() as u64,
                error,
            });
        }
        report.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            refreshed = report.refreshed(),
            failed = report.failed(),
            duration_ms = report.duration_ms,
            "Materialized view refresh complete"
        );
        Ok(report)
    }

    async fn refresh_view(&self, view: &str) -> Result<()> {
        validate_identifier(view)?;
        let sql = self
            .store
            .dialect()
            .refresh_view_sql(view)
            .ok_or_else(|| Error::Unsupported(format!("cannot refresh {}", view)))?;
        self.store.execute(&sql, &[]).await?;
        debug!(view, "Refreshed materialized view");
        Ok(())
    }
}

/// Periodic refresh of materialized views.
pub struct ViewRefreshScheduler {
    inner: Arc<RefreshInner>,
    task: PeriodicTask,
}

impl ViewRefreshScheduler {
    pub fn new(store: Arc<dyn Store>, config: ViewRefreshConfig) -> Self {
        Self {
            inner: Arc::new(RefreshInner {
                store,
                config,
                guard: InFlightGuard::new(),
            }),
            task: PeriodicTask::new("view-refresh"),
        }
    }

    pub fn config(&self) -> &ViewRefreshConfig {
        &self.inner.config
    }

    /// Whether the bound backend has anything to refresh.
    pub fn is_supported(&self) -> bool {
        self.inner.store.dialect().supports_materialized_views()
    }

    /// Schedule refreshes. Returns `false` when the backend has no
    /// materialized views or the schedule is already running.
    pub fn start(&self) -> bool {
        if !self.is_supported() {
            info!(
                backend = %self.inner.store.dialect(),
                "Materialized views unsupported, view refresh disabled"
            );
            return false;
        }

        let inner = self.inner.clone();
        let config = &self.inner.config;
        self.task
            .start(config.interval(), config.startup_delay(), move || {
                let inner = inner.clone();
                async move {
                    inner.periodic_pass().await;
                }
            })
    }

    /// Refresh every configured view now, waiting for a running pass.
    ///
    /// Per-view failures are reported in the result; only an unsupported
    /// backend fails the call.
    pub async fn refresh_all(&self) -> Result<ViewRefreshReport> {
        let _permit = self.inner.guard.enter().await;
        self.inner.run().await
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_store, RecordingStore};

    #[tokio::test]
    async fn test_refresh_all_uses_concurrent_refresh() {
        let store = Arc::new(RecordingStore::default());
        let scheduler = ViewRefreshScheduler::new(store.clone(), ViewRefreshConfig::default());

        let report = scheduler.refresh_all().await.unwrap();
        assert_eq!(report.refreshed(), 3);
        assert_eq!(
            store.executed(),
            vec![
                "REFRESH MATERIALIZED VIEW CONCURRENTLY daily_telemetry_summary",
                "REFRESH MATERIALIZED VIEW CONCURRENTLY equipment_status_rollup",
                "REFRESH MATERIALIZED VIEW CONCURRENTLY data_quality_daily",
            ]
        );
    }

    #[tokio::test]
    async fn test_failing_view_does_not_halt_others() {
        let store = Arc::new(RecordingStore::default().failing_on(&["equipment_status_rollup"]));
        let scheduler = ViewRefreshScheduler::new(store.clone(), ViewRefreshConfig::default());

        let report = scheduler.refresh_all().await.unwrap();
        assert_eq!(report.refreshed(), 2);
        assert_eq!(report.failed(), 1);
        assert!(report.views[1].error.is_some());
        assert_eq!(store.executed().len(), 3);
    }

    #[tokio::test]
    async fn test_invalid_view_name_is_rejected() {
        let config = ViewRefreshConfig {
            views: vec!["daily; DROP TABLE sync_journal".to_string()],
            ..Default::default()
        };
        let store = Arc::new(RecordingStore::default());
        let scheduler = ViewRefreshScheduler::new(store.clone(), config);

        let report = scheduler.refresh_all().await.unwrap();
        assert_eq!(report.failed(), 1);
        assert!(store.executed().is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_is_unsupported() {
        let scheduler = ViewRefreshScheduler::new(memory_store().await, ViewRefreshConfig::default());

        assert!(!scheduler.is_supported());
        assert!(!scheduler.start());
        assert!(!scheduler.is_scheduled());
        assert!(matches!(
            scheduler.refresh_all().await,
            Err(Error::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_schedule_waits_for_startup_delay() {
        let store = Arc::new(RecordingStore::default());
        let config = ViewRefreshConfig {
            views: vec!["daily_telemetry_summary".to_string()],
            interval_secs: 3600,
            startup_delay_secs: 1,
        };
        let scheduler = ViewRefreshScheduler::new(store.clone(), config);

        assert!(scheduler.start());
        assert!(!scheduler.start());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(store.executed().is_empty());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(store.executed().len(), 1);

        scheduler.shutdown().await;
        assert!(!scheduler.is_scheduled());
    }
}
