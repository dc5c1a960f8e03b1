//! Transactional outbox and the live-broadcast port it drains into.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use fleetsync_common::{Error, Result};
use fleetsync_storage::schema::OUTBOX_TABLE;
use fleetsync_storage::value::{column, get_i64, get_opt_str, get_str};
use fleetsync_storage::{Dialect, Row, SqlValue, Store};

/// A pending domain-change event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxEvent {
    pub id: String,
    pub payload: Value,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    /// Failed broadcast attempts so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Delivers outbox events to live subscribers.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(&self, event: &OutboxEvent) -> Result<()>;
}

/// Broadcaster backed by a tokio broadcast channel.
///
/// Having no subscribers is not a failure; nobody is listening yet.
pub struct ChannelBroadcaster {
    tx: broadcast::Sender<OutboxEvent>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboxEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Broadcaster for ChannelBroadcaster {
    async fn broadcast(&self, event: &OutboxEvent) -> Result<()> {
        match self.tx.send(event.clone()) {
            Ok(receivers) => debug!(event = %event.id, receivers, "Broadcast outbox event"),
            Err(_) => debug!(event = %event.id, "No live subscribers for outbox event"),
        }
        Ok(())
    }
}

/// Broadcaster that only logs. Used where no live channel exists.
pub struct LogBroadcaster;

#[async_trait]
impl Broadcaster for LogBroadcaster {
    async fn broadcast(&self, event: &OutboxEvent) -> Result<()> {
        debug!(event = %event.id, "Outbox event (no broadcaster attached)");
        Ok(())
    }
}

/// Counts from one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub fetched: usize,
    pub processed: usize,
    pub failed: usize,
}

/// Durable queue of events awaiting broadcast.
#[derive(Clone)]
pub struct Outbox {
    store: Arc<dyn Store>,
}

impl Outbox {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn dialect(&self) -> Dialect {
        self.store.dialect()
    }

    /// Queue an event.
    pub async fn enqueue(&self, payload: Value) -> Result<OutboxEvent> {
        let d = self.dialect();
        let event = OutboxEvent {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            processed: false,
            processed_at: None,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
        };

        let sql = format!(
            "INSERT INTO {} (id, payload, processed, created_at) VALUES ({})",
            OUTBOX_TABLE,
            d.placeholders(1, 4)
        );
        self.store
            .execute(
                &sql,
                &[
                    SqlValue::from(event.id.as_str()),
                    d.encode_json(&event.payload),
                    d.encode_bool(false),
                    d.encode_timestamp(event.created_at),
                ],
            )
            .await?;
        Ok(event)
    }

    /// Up to `limit` unprocessed events, fewest failed attempts first, then
    /// oldest first. Events that keep failing sink behind fresh ones.
    pub async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxEvent>> {
        let d = self.dialect();
        let sql = format!(
            "SELECT id, payload, processed, processed_at, attempts, last_error, created_at FROM {} \
             WHERE processed = {} ORDER BY attempts ASC, created_at ASC, id ASC LIMIT {}",
            OUTBOX_TABLE,
            d.placeholder(1),
            limit
        );
        let rows = self.store.query(&sql, &[d.encode_bool(false)]).await?;
        rows.iter().map(|row| self.decode(row)).collect()
    }

    /// Flip an event to processed.
    ///
    /// Returns `false` if it was already processed; the update is
    /// conditional so a second call affects no rows.
    pub async fn mark_processed(&self, id: &str) -> Result<bool> {
        let d = self.dialect();
        let sql = format!(
            "UPDATE {} SET processed = {}, processed_at = {} WHERE id = {} AND processed = {}",
            OUTBOX_TABLE,
            d.placeholder(1),
            d.placeholder(2),
            d.placeholder(3),
            d.placeholder(4)
        );
        let affected = self
            .store
            .execute(
                &sql,
                &[
                    d.encode_bool(true),
                    d.encode_timestamp(Utc::now()),
                    id.into(),
                    d.encode_bool(false),
                ],
            )
            .await?;
        Ok(affected > 0)
    }

    /// Count a failed broadcast against a pending event.
    pub async fn record_failure(&self, id: &str, error: &str) -> Result<bool> {
        let d = self.dialect();
        let sql = format!(
            "UPDATE {} SET attempts = attempts + 1, last_error = {} WHERE id = {} AND processed = {}",
            OUTBOX_TABLE,
            d.placeholder(1),
            d.placeholder(2),
            d.placeholder(3)
        );
        let affected = self
            .store
            .execute(&sql, &[error.into(), id.into(), d.encode_bool(false)])
            .await?;
        Ok(affected > 0)
    }

    /// Number of unprocessed events.
    pub async fn pending_count(&self) -> Result<u64> {
        let d = self.dialect();
        let sql = format!(
            "SELECT COUNT(*) AS n FROM {} WHERE processed = {}",
            OUTBOX_TABLE,
            d.placeholder(1)
        );
        match self.store.query_one(&sql, &[d.encode_bool(false)]).await? {
            Some(row) => Ok(get_i64(&row, "n")?.max(0) as u64),
            None => Ok(0),
        }
    }

    /// Broadcast up to `batch` pending events and mark each processed.
    ///
    /// A failure on one event is logged, counted against the event and the
    /// rest of the batch continues. Only the initial fetch can fail the drain.
    pub async fn drain(&self, broadcaster: &dyn Broadcaster, batch: usize) -> Result<DrainReport> {
        let events = self.fetch_pending(batch).await?;
        let mut report = DrainReport {
            fetched: events.len(),
            ..Default::default()
        };

        for event in &events {
            if let Err(e) = broadcaster.broadcast(event).await {
                warn!(
                    event = %event.id,
                    attempts = event.attempts + 1,
                    "Failed to broadcast outbox event: {}",
                    e
                );
                report.failed += 1;
                if let Err(e) = self.record_failure(&event.id, &e.to_string()).await {
                    warn!(event = %event.id, "Failed to record outbox failure: {}", e);
                }
                continue;
            }

            match self.mark_processed(&event.id).await {
                Ok(true) => report.processed += 1,
                Ok(false) => debug!(event = %event.id, "Outbox event already processed"),
                Err(e) => {
                    warn!(event = %event.id, "Failed to mark outbox event processed: {}", e);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    fn decode(&self, row: &Row) -> Result<OutboxEvent> {
        let d = self.dialect();
        let processed_at = match column(row, "processed_at")? {
            Value::Null => None,
            value => d.decode_timestamp(value),
        };
        let created_at = d
            .decode_timestamp(column(row, "created_at")?)
            .ok_or_else(|| Error::Serialization("outbox event has no created_at".to_string()))?;

        Ok(OutboxEvent {
            id: get_str(row, "id")?,
            payload: d.decode_json(column(row, "payload")?),
            processed: d.decode_bool(column(row, "processed")?),
            processed_at,
            attempts: get_i64(row, "attempts")?.clamp(0, i64::from(u32::MAX)) as u32,
            last_error: get_opt_str(row, "last_error")?,
            created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_store, FailingBroadcaster, RecordingBroadcaster};
    use serde_json::json;
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_enqueue_and_fetch_oldest_first() {
        let outbox = Outbox::new(memory_store().await);
        let first = outbox.enqueue(json!({"n": 1})).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        outbox.enqueue(json!({"n": 2})).await.unwrap();

        let pending = outbox.fetch_pending(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first.id);
        assert_eq!(pending[0].payload, json!({"n": 1}));
        assert!(!pending[0].processed);
        assert!(pending[0].processed_at.is_none());
    }

    #[tokio::test]
    async fn test_mark_processed_is_one_way() {
        let outbox = Outbox::new(memory_store().await);
        let event = outbox.enqueue(json!({"vessel": "v1"})).await.unwrap();

        assert!(outbox.mark_processed(&event.id).await.unwrap());
        assert!(!outbox.mark_processed(&event.id).await.unwrap());
        assert_eq!(outbox.pending_count().await.unwrap(), 0);
        assert!(outbox.fetch_pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_150_events_drain_in_two_passes() {
        let outbox = Outbox::new(memory_store().await);
        for n in 0..150 {
            outbox.enqueue(json!({"n": n})).await.unwrap();
        }
        let broadcaster = RecordingBroadcaster::default();

        let first = outbox.drain(&broadcaster, 100).await.unwrap();
        assert_eq!(first.fetched, 100);
        assert_eq!(first.processed, 100);

        let second = outbox.drain(&broadcaster, 100).await.unwrap();
        assert_eq!(second.processed, 50);

        let third = outbox.drain(&broadcaster, 100).await.unwrap();
        assert_eq!(third, DrainReport::default());

        let seen = broadcaster.event_ids();
        assert_eq!(seen.len(), 150);
        let unique: HashSet<_> = seen.iter().collect();
        assert_eq!(unique.len(), 150);
    }

    #[tokio::test]
    async fn test_per_event_failure_does_not_block_batch() {
        let outbox = Outbox::new(memory_store().await);
        let poisoned = outbox.enqueue(json!({"n": 0})).await.unwrap();
        for n in 1..5 {
            outbox.enqueue(json!({"n": n})).await.unwrap();
        }

        let broadcaster = FailingBroadcaster::for_ids([poisoned.id.clone()]);
        let report = outbox.drain(&broadcaster, 100).await.unwrap();
        assert_eq!(report.processed, 4);
        assert_eq!(report.failed, 1);

        let pending = outbox.fetch_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, poisoned.id);
    }

    #[tokio::test]
    async fn test_failing_events_do_not_starve_healthy_ones() {
        let outbox = Outbox::new(memory_store().await);
        let mut poisoned = Vec::new();
        for n in 0..100 {
            poisoned.push(outbox.enqueue(json!({"n": n})).await.unwrap().id);
        }
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let healthy = outbox.enqueue(json!({"n": "healthy"})).await.unwrap();

        let broadcaster = FailingBroadcaster::for_ids(poisoned.clone());
        let first = outbox.drain(&broadcaster, 100).await.unwrap();
        assert_eq!(first.failed, 100);
        assert_eq!(first.processed, 0);

        let second = outbox.drain(&broadcaster, 100).await.unwrap();
        assert_eq!(second.processed, 1);
        assert_eq!(second.failed, 99);
        assert_eq!(outbox.pending_count().await.unwrap(), 100);

        let pending = outbox.fetch_pending(200).await.unwrap();
        assert!(pending.iter().all(|e| e.id != healthy.id));
        assert!(pending.iter().all(|e| e.attempts >= 1));
        assert!(pending[0].last_error.as_deref().unwrap().contains("rejected"));
    }

    #[tokio::test]
    async fn test_channel_broadcaster_delivers_and_tolerates_no_subscribers() {
        let broadcaster = ChannelBroadcaster::new(16);
        let outbox = Outbox::new(memory_store().await);
        let event = outbox.enqueue(json!({"alert": "bilge"})).await.unwrap();

        broadcaster.broadcast(&event).await.unwrap();

        let mut rx = broadcaster.subscribe();
        broadcaster.broadcast(&event).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().id, event.id);
    }
}
