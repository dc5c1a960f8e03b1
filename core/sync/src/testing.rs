//! Test doubles shared by the sync tests.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleetsync_common::{Error, Result};
use fleetsync_storage::schema::JOURNAL_TABLE;
use fleetsync_storage::{
    ensure_schema, Dialect, ReplicationReport, Replicator, Row, SqlValue, SqliteStore,
    StorageContext, Store,
};

use crate::outbox::{Broadcaster, OutboxEvent};

async fn schema_store() -> SqliteStore {
    let store = SqliteStore::in_memory().unwrap();
    ensure_schema(&store).await.unwrap();
    store
}

/// In-memory SQLite store with the sync schema applied.
pub async fn memory_store() -> Arc<dyn Store> {
    Arc::new(schema_store().await)
}

/// Disconnected context over an in-memory store.
pub async fn local_context(replicator: Option<Arc<dyn Replicator>>) -> Arc<StorageContext> {
    let local = Arc::new(schema_store().await);
    Arc::new(StorageContext::disconnected(local, replicator, Duration::ZERO))
}

/// Replicator that can be told to fail or to stall.
pub struct FlakyReplicator {
    failing: AtomicBool,
    delay: Duration,
}

impl FlakyReplicator {
    pub fn failing() -> Self {
        Self {
            failing: AtomicBool::new(true),
            delay: Duration::ZERO,
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            failing: AtomicBool::new(false),
            delay,
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    async fn exchange(&self) -> Result<ReplicationReport> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Replication("replica unreachable".to_string()));
        }
        Ok(ReplicationReport::default())
    }
}

#[async_trait]
impl Replicator for FlakyReplicator {
    fn endpoint(&self) -> &str {
        "flaky://replica"
    }

    async fn pull(&self) -> Result<ReplicationReport> {
        self.exchange().await
    }

    async fn sync(&self) -> Result<ReplicationReport> {
        self.exchange().await
    }
}

/// Broadcaster that remembers every event it saw.
#[derive(Default)]
pub struct RecordingBroadcaster {
    seen: Mutex<Vec<String>>,
}

impl RecordingBroadcaster {
    pub fn event_ids(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Broadcaster for RecordingBroadcaster {
    async fn broadcast(&self, event: &OutboxEvent) -> Result<()> {
        self.seen.lock().unwrap().push(event.id.clone());
        Ok(())
    }
}

/// Broadcaster that rejects the given event ids.
pub struct FailingBroadcaster {
    poisoned: HashSet<String>,
}

impl FailingBroadcaster {
    pub fn for_ids(ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            poisoned: ids.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Broadcaster for FailingBroadcaster {
    async fn broadcast(&self, event: &OutboxEvent) -> Result<()> {
        if self.poisoned.contains(&event.id) {
            return Err(Error::Broadcast(format!("subscriber rejected {}", event.id)));
        }
        Ok(())
    }
}

/// SQLite store whose journal inserts always fail.
pub struct JournalFailingStore {
    inner: SqliteStore,
}

impl JournalFailingStore {
    pub async fn new() -> Self {
        Self {
            inner: schema_store().await,
        }
    }
}

#[async_trait]
impl Store for JournalFailingStore {
    fn name(&self) -> &str {
        "journal-failing"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        if sql.starts_with(&format!("INSERT INTO {}", JOURNAL_TABLE)) {
            return Err(Error::Storage("disk I/O error".to_string()));
        }
        self.inner.execute(sql, params).await
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        self.inner.query(sql, params).await
    }
}

/// PostgreSQL-flavored store that records statements instead of running them.
#[derive(Default)]
pub struct RecordingStore {
    executed: Mutex<Vec<String>>,
    failing: HashSet<String>,
    missing: HashSet<String>,
}

impl RecordingStore {
    /// Statements mentioning any of these names fail.
    pub fn failing_on(mut self, names: &[&str]) -> Self {
        self.failing.extend(names.iter().map(|n| n.to_string()));
        self
    }

    /// Relations reported as absent by `table_exists`.
    pub fn missing(mut self, names: &[&str]) -> Self {
        self.missing.extend(names.iter().map(|n| n.to_string()));
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Store for RecordingStore {
    fn name(&self) -> &str {
        "recording"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn execute(&self, sql: &str, _params: &[SqlValue]) -> Result<u64> {
        self.executed.lock().unwrap().push(sql.to_string());
        if self.failing.iter().any(|name| sql.contains(name.as_str())) {
            return Err(Error::Storage(format!("statement failed: {}", sql)));
        }
        Ok(0)
    }

    async fn query(&self, _sql: &str, _params: &[SqlValue]) -> Result<Vec<Row>> {
        Ok(Vec::new())
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(!self.missing.contains(table))
    }
}
