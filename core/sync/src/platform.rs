//! Composition root.
//!
//! `Platform::bootstrap` binds the process to one backend, then builds and
//! injects every service. Nothing starts until `start_all`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use fleetsync_common::{DeploymentMode, Error, Result};
use fleetsync_storage::config::parse_env_var;
use fleetsync_storage::{StorageConfig, StorageContext};

use crate::engine::{SyncConfig, SyncManager};
use crate::outbox::Broadcaster;
use crate::retention::{DataClass, PruningService, RetentionConfig};
use crate::state::SyncState;
use crate::views::{ViewRefreshConfig, ViewRefreshScheduler};

pub const ENV_SYNC_INTERVAL: &str = "FLEETSYNC_SYNC_INTERVAL_SECS";
pub const ENV_RETENTION_RAW_DAYS: &str = "FLEETSYNC_RETENTION_RAW_DAYS";
pub const ENV_RETENTION_AGGREGATE_DAYS: &str = "FLEETSYNC_RETENTION_AGGREGATE_DAYS";
pub const ENV_RETENTION_QUALITY_DAYS: &str = "FLEETSYNC_RETENTION_QUALITY_DAYS";
pub const ENV_VIEW_REFRESH_INTERVAL: &str = "FLEETSYNC_VIEW_REFRESH_INTERVAL_SECS";

/// Configuration for every service in the process.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub storage: StorageConfig,
    pub sync: SyncConfig,
    pub retention: RetentionConfig,
    pub views: ViewRefreshConfig,
}

impl PlatformConfig {
    /// Load from an optional JSON file, then apply process environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// Like [`PlatformConfig::load`] with an explicit variable lookup.
    pub fn load_with<F>(path: Option<&Path>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("cannot read {}: {}", path.display(), e))
                })?;
                serde_json::from_str(&raw).map_err(|e| {
                    Error::Config(format!("invalid config {}: {}", path.display(), e))
                })?
            }
            None => Self::default(),
        };
        config.apply_env(lookup)?;
        Ok(config)
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.storage.apply_env(&lookup)?;

        if let Some(v) = parse_env_var(&lookup, ENV_SYNC_INTERVAL)? {
            self.sync.interval_secs = v;
        }
        for (key, class) in [
            (ENV_RETENTION_RAW_DAYS, DataClass::RawTelemetry),
            (ENV_RETENTION_AGGREGATE_DAYS, DataClass::Aggregates),
            (ENV_RETENTION_QUALITY_DAYS, DataClass::DataQuality),
        ] {
            if let Some(days) = parse_env_var(&lookup, key)? {
                self.retention.set_retention_days(class, days);
            }
        }
        if let Some(v) = parse_env_var(&lookup, ENV_VIEW_REFRESH_INTERVAL)? {
            self.views.interval_secs = v;
        }
        Ok(())
    }
}

/// Snapshot of the running services.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformStatus {
    pub mode: DeploymentMode,
    pub backend: String,
    pub sync: SyncState,
    pub sync_scheduled: bool,
    pub pruning_scheduled: bool,
    pub views_scheduled: bool,
    pub replicating_in_background: bool,
    pub pending_outbox: u64,
    pub unresolved_conflicts: u64,
}

/// Every service of one process, wired to a single storage context.
pub struct Platform {
    context: Arc<StorageContext>,
    sync: SyncManager,
    pruning: PruningService,
    views: ViewRefreshScheduler,
}

impl Platform {
    /// Initialize storage and build every service.
    ///
    /// Fails only on configuration or backend errors; an unreachable
    /// replica is logged and tolerated.
    pub async fn bootstrap(config: PlatformConfig, broadcaster: Arc<dyn Broadcaster>) -> Result<Self> {
        let context = Arc::new(StorageContext::initialize(&config.storage).await?);
        Ok(Self::assemble(context, broadcaster, config).await)
    }

    /// Build the services over an existing context.
    pub async fn assemble(
        context: Arc<StorageContext>,
        broadcaster: Arc<dyn Broadcaster>,
        config: PlatformConfig,
    ) -> Self {
        let store = context.store();
        let sync = SyncManager::new(context.clone(), broadcaster, config.sync).await;
        let pruning = PruningService::new(store.clone(), config.retention);
        let views = ViewRefreshScheduler::new(store, config.views);

        info!(mode = %context.mode(), backend = %context.dialect(), "Platform assembled");
        Self {
            context,
            sync,
            pruning,
            views,
        }
    }

    pub fn context(&self) -> &Arc<StorageContext> {
        &self.context
    }

    pub fn sync(&self) -> &SyncManager {
        &self.sync
    }

    pub fn pruning(&self) -> &PruningService {
        &self.pruning
    }

    pub fn views(&self) -> &ViewRefreshScheduler {
        &self.views
    }

    /// Start every service that applies to the bound backend.
    pub async fn start_all(&self) {
        let replicating = self.context.start_background_replication();
        let syncing = self.sync.start().await;
        let pruning = self.pruning.start();
        let refreshing = self.views.start();
        info!(
            replicating,
            syncing, pruning, refreshing, "Platform services started"
        );
    }

    /// Stop every service, wait for in-flight passes, then release storage.
    pub async fn stop_all(&self) {
        futures::join!(
            self.sync.shutdown(),
            self.pruning.shutdown(),
            self.views.shutdown(),
        );
        self.context.close().await;
        info!("Platform services stopped");
    }

    pub async fn status(&self) -> PlatformStatus {
        let pending_outbox = self.sync.outbox().pending_count().await.unwrap_or_else(|e| {
            warn!("Could not count pending outbox events: {}", e);
            0
        });
        let unresolved_conflicts = self
            .sync
            .resolver()
            .log()
            .count_unresolved()
            .await
            .unwrap_or_else(|e| {
                warn!("Could not count unresolved conflicts: {}", e);
                0
            });

        PlatformStatus {
            mode: self.context.mode(),
            backend: self.context.dialect().name().to_string(),
            sync: self.sync.status().await,
            sync_scheduled: self.sync.is_scheduled(),
            pruning_scheduled: self.pruning.is_scheduled(),
            views_scheduled: self.views.is_scheduled(),
            replicating_in_background: self.context.is_replicating_in_background(),
            pending_outbox,
            unresolved_conflicts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::LogBroadcaster;
    use crate::testing::memory_store;
    use std::collections::HashMap;
    use std::io::Write;
    use std::time::Duration;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_load_file_then_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "storage": {{"mode": "disconnected", "data_dir": "/srv/fleet"}},
                "sync": {{"interval_secs": 120}},
                "retention": {{"reclaim_threshold": 50}},
                "views": {{"startup_delay_secs": 0}}
            }}"#
        )
        .unwrap();

        let config = PlatformConfig::load_with(
            Some(file.path()),
            lookup_from(&[
                (ENV_SYNC_INTERVAL, "600"),
                (ENV_RETENTION_RAW_DAYS, "30"),
                (ENV_VIEW_REFRESH_INTERVAL, "900"),
            ]),
        )
        .unwrap();

        assert!(config.storage.mode.is_disconnected());
        assert_eq!(config.storage.database_path(), Path::new("/srv/fleet/fleet.db"));
        assert_eq!(config.sync.interval_secs, 600);
        assert_eq!(config.sync.outbox_batch_size, 100);
        assert_eq!(config.retention.reclaim_threshold, 50);
        assert_eq!(config.retention.retention_days(DataClass::RawTelemetry), Some(30));
        assert_eq!(config.retention.retention_days(DataClass::Aggregates), Some(365));
        assert_eq!(config.views.interval_secs, 900);
        assert_eq!(config.views.startup_delay_secs, 0);
    }

    #[test]
    fn test_bad_config_is_config_error() {
        let missing = PlatformConfig::load_with(Some(Path::new("/nonexistent/fleet.json")), |_| None);
        assert!(matches!(missing, Err(Error::Config(_))));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let malformed = PlatformConfig::load_with(Some(file.path()), |_| None);
        assert!(matches!(malformed, Err(Error::Config(_))));

        let bad_env = PlatformConfig::load_with(None, lookup_from(&[(ENV_RETENTION_QUALITY_DAYS, "-1")]));
        assert!(matches!(bad_env, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_connected_without_url_fails_bootstrap() {
        let result = Platform::bootstrap(PlatformConfig::default(), Arc::new(LogBroadcaster)).await;
        match result {
            Err(Error::Config(msg)) => assert!(msg.contains("DATABASE_URL")),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("bootstrap should fail without a connection string"),
        }
    }

    #[tokio::test]
    async fn test_disconnected_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PlatformConfig::default();
        config.storage.mode = DeploymentMode::Disconnected;
        config.storage.data_dir = dir.path().join("node");
        config.sync.interval_secs = 3600;

        let platform = Platform::bootstrap(config, Arc::new(LogBroadcaster)).await.unwrap();
        assert!(dir.path().join("node/fleet.db").exists());

        platform.start_all().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = platform.status().await;
        assert_eq!(status.mode, DeploymentMode::Disconnected);
        assert_eq!(status.backend, "sqlite");
        assert!(status.sync_scheduled);
        assert!(status.pruning_scheduled);
        assert!(!status.views_scheduled);
        assert!(!status.replicating_in_background);
        assert!(status.sync.last_success.is_some());

        platform.stop_all().await;
        let status = platform.status().await;
        assert!(!status.sync_scheduled);
        assert!(!status.pruning_scheduled);
    }

    #[tokio::test]
    async fn test_connected_assembly_leaves_sync_idle() {
        let context = Arc::new(StorageContext::connected(memory_store().await));
        let platform =
            Platform::assemble(context, Arc::new(LogBroadcaster), PlatformConfig::default()).await;

        platform.start_all().await;
        let status = platform.status().await;
        assert!(!status.sync_scheduled);
        assert!(status.pruning_scheduled);
        assert_eq!(status.pending_outbox, 0);
        platform.stop_all().await;
    }
}
