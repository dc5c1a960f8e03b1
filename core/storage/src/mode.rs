//! Deployment mode provider.
//!
//! The one place that branches on [`DeploymentMode`]. Everything downstream
//! receives a [`StorageContext`] and works through `dyn Store`.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use fleetsync_common::{DeploymentMode, Error, InFlightGuard, PeriodicTask, Result};

use crate::changes::ChangeLog;
use crate::config::{StorageConfig, ENV_DATABASE_URL};
use crate::dialect::Dialect;
use crate::postgres::PostgresStore;
use crate::provider::Store;
use crate::replica::{HttpReplicator, ReplicationReport, Replicator};
use crate::schema::ensure_schema;
use crate::sqlite::SqliteStore;

/// The storage binding chosen at startup.
pub struct StorageContext {
    mode: DeploymentMode,
    store: Arc<dyn Store>,
    local: Option<Arc<SqliteStore>>,
    replicator: Option<Arc<dyn Replicator>>,
    replication_interval: Duration,
    replication_guard: InFlightGuard,
    background: PeriodicTask,
}

impl StorageContext {
    /// Bind the process to the backend selected by `config.mode`.
    ///
    /// # Errors
    /// - `Error::Config` if connected mode has no connection string
    /// - `Error::Storage` if the backend cannot be opened or reached
    ///
    /// A failed initial replication pull is logged and does not fail
    /// startup.
    pub async fn initialize(config: &StorageConfig) -> Result<Self> {
        config.validate()?;
        info!(mode = %config.mode, "Initializing storage");

        match config.mode {
            DeploymentMode::Connected => {
                let url = config
                    .database_url
                    .as_ref()
                    .filter(|url| !url.is_empty())
                    .ok_or_else(|| {
                        Error::Config(format!(
                            "{} is required in connected mode",
                            ENV_DATABASE_URL
                        ))
                    })?;

                let store = PostgresStore::connect(url.expose(), &config.pool).await?;
                ensure_schema(&store).await?;
                Ok(Self::connected(Arc::new(store)))
            }
            DeploymentMode::Disconnected => {
                tokio::fs::create_dir_all(&config.data_dir).await?;

                let path = config.database_path();
                let key = config.encryption_key.clone();
                let local = tokio::task::spawn_blocking(move || SqliteStore::open(&path, key.as_ref()))
                    .await
                    .map_err(|e| Error::Storage(format!("sqlite: open task failed: {}", e)))??;
                let local = Arc::new(local);

                let replicator: Option<Arc<dyn Replicator>> = match config.replica.credentials() {
                    Some((url, token)) => {
                        let node_id = config
                            .replica
                            .node_id
                            .clone()
                            .unwrap_or_else(|| format!("node-{}", uuid::Uuid::new_v4()));
                        let replicator = HttpReplicator::new(
                            url,
                            token.clone(),
                            node_id,
                            config.replica.request_timeout(),
                            local.clone(),
                        )?;
                        info!(endpoint = replicator.endpoint(), "Remote replica configured");
                        Some(Arc::new(replicator) as Arc<dyn Replicator>)
                    }
                    None => {
                        warn!("No remote replica credentials configured; running in local-only mode");
                        None
                    }
                };

                let context = Self::disconnected(
                    local,
                    replicator,
                    config.replica.sync_interval(),
                );
                ensure_schema(context.store.as_ref()).await?;
                context.initial_pull().await;
                Ok(context)
            }
        }
    }

    /// Context for the connected topology.
    pub fn connected(store: Arc<dyn Store>) -> Self {
        Self {
            mode: DeploymentMode::Connected,
            store,
            local: None,
            replicator: None,
            replication_interval: Duration::ZERO,
            replication_guard: InFlightGuard::new(),
            background: PeriodicTask::new("replication"),
        }
    }

    /// Context for a disconnected node.
    pub fn disconnected(
        local: Arc<SqliteStore>,
        replicator: Option<Arc<dyn Replicator>>,
        replication_interval: Duration,
    ) -> Self {
        Self {
            mode: DeploymentMode::Disconnected,
            store: local.clone(),
            local: Some(local),
            replicator,
            replication_interval,
            replication_guard: InFlightGuard::new(),
            background: PeriodicTask::new("replication"),
        }
    }

    /// Assemble a context from already-built parts.
    pub fn from_parts(
        mode: DeploymentMode,
        store: Arc<dyn Store>,
        local: Option<Arc<SqliteStore>>,
        replicator: Option<Arc<dyn Replicator>>,
        replication_interval: Duration,
    ) -> Self {
        Self {
            mode,
            store,
            local,
            replicator,
            replication_interval,
            replication_guard: InFlightGuard::new(),
            background: PeriodicTask::new("replication"),
        }
    }

    async fn initial_pull(&self) {
        let Some(replicator) = &self.replicator else {
            return;
        };
        let _permit = self.replication_guard.enter().await;
        match replicator.pull().await {
            Ok(report) => info!(
                pulled = report.frames_pulled,
                "Initial replication pull completed"
            ),
            Err(e) => warn!(
                "Initial replication pull failed, continuing with local data: {}",
                e
            ),
        }
    }

    pub fn mode(&self) -> DeploymentMode {
        self.mode
    }

    pub fn is_disconnected(&self) -> bool {
        self.mode.is_disconnected()
    }

    /// Uniform storage handle.
    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub fn dialect(&self) -> Dialect {
        self.store.dialect()
    }

    /// Raw local store, disconnected mode only.
    pub fn local_store(&self) -> Option<Arc<SqliteStore>> {
        self.local.clone()
    }

    /// Log of local changes to push to the replica, disconnected mode only.
    pub fn change_log(&self) -> Option<ChangeLog> {
        self.local
            .as_ref()
            .map(|local| ChangeLog::new(local.clone()))
    }

    pub fn replicator(&self) -> Option<Arc<dyn Replicator>> {
        self.replicator.clone()
    }

    /// Run one bidirectional replication, waiting for any running one.
    ///
    /// Returns `Ok(None)` when no replica is configured.
    pub async fn replicate(&self) -> Result<Option<ReplicationReport>> {
        let Some(replicator) = &self.replicator else {
            return Ok(None);
        };
        let _permit = self.replication_guard.enter().await;
        replicator.sync().await.map(Some)
    }

    /// Start periodic background replication. Returns `false` if there is
    /// no replica or it is already running.
    pub fn start_background_replication(&self) -> bool {
        let Some(replicator) = self.replicator.clone() else {
            debug!("No replica configured, background replication not started");
            return false;
        };
        if self.replication_interval.is_zero() {
            return false;
        }

        let guard = self.replication_guard.clone();
        self.background.start(
            self.replication_interval,
            self.replication_interval,
            move || {
                let replicator = replicator.clone();
                let guard = guard.clone();
                async move {
                    let Some(_permit) = guard.try_enter() else {
                        debug!("Replication still in flight, skipping tick");
                        return;
                    };
                    match replicator.sync().await {
                        Ok(report) => debug!(
                            pulled = report.frames_pulled,
                            pushed = report.frames_pushed,
                            "Background replication completed"
                        ),
                        Err(e) => warn!("Background replication failed: {}", e),
                    }
                }
            },
        )
    }

    /// Stop background replication, letting a running call finish.
    pub async fn stop_background_replication(&self) {
        self.background.shutdown().await;
    }

    pub fn is_replicating_in_background(&self) -> bool {
        self.background.is_running()
    }

    /// Stop background work and release the backend.
    pub async fn close(&self) {
        self.stop_background_replication().await;
        self.store.close().await;
        info!(mode = %self.mode, "Storage closed");
    }
}
