//! Remote replica capability for disconnected nodes.
//!
//! One replication call is a single `POST {base}/v1/replication` carrying
//! the node's pending local changes (bidirectional only) and the last frame
//! it saw. The replica answers with its new frame and the changes since the
//! old one. Pulled changes are applied to the local store in one
//! transaction; pushed changes are marked once the replica accepts them.
//! A push that is accepted but followed by a failed apply is sent again on
//! the next call, so the replica must treat repeated changes idempotently.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;
use url::Url;

use fleetsync_common::{Error, Result, Secret};

use crate::changes::{Change, ChangeLog};
use crate::dialect::Dialect;
use crate::sqlite::SqliteStore;

/// Path of the replication endpoint relative to the replica base URL.
const REPLICATION_PATH: &str = "v1/replication";

/// Maximum local changes pushed per call.
const PUSH_BATCH: usize = 500;

/// Which way changes move in one replication call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationDirection {
    /// Fetch remote changes only.
    Pull,
    /// Push local changes, then fetch remote ones.
    Bidirectional,
}

/// What a replication call moved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationReport {
    #[serde(default)]
    pub frames_pulled: u64,
    #[serde(default)]
    pub frames_pushed: u64,
    /// Replica position after the call.
    #[serde(default)]
    pub frame_no: Option<u64>,
}

/// Replication primitive of the local embedded store.
#[async_trait]
pub trait Replicator: Send + Sync {
    /// Replica endpoint, for logs.
    fn endpoint(&self) -> &str;

    /// Fetch remote changes and apply them to the local store.
    async fn pull(&self) -> Result<ReplicationReport>;

    /// Push pending local changes, then pull and apply remote ones.
    async fn sync(&self) -> Result<ReplicationReport>;
}

#[derive(Serialize)]
struct ReplicationRequest<'a> {
    node_id: &'a str,
    direction: ReplicationDirection,
    frame_no: Option<u64>,
    changes: Vec<&'a Change>,
}

#[derive(Deserialize)]
struct ReplicationResponse {
    #[serde(default)]
    frame_no: Option<u64>,
    #[serde(default)]
    changes: Vec<Change>,
}

/// Replicator talking to a remote replica over HTTPS.
pub struct HttpReplicator {
    http: Client,
    endpoint: Url,
    token: Secret,
    node_id: String,
    local: Arc<SqliteStore>,
    changes: ChangeLog,
    frame_no: Mutex<Option<u64>>,
}

impl HttpReplicator {
    /// Create a replicator exchanging `local`'s changes with the replica at
    /// `base_url`.
    ///
    /// # Errors
    /// `Error::Config` if the URL is malformed or the HTTP client cannot be
    /// built.
    pub fn new(
        base_url: &str,
        token: Secret,
        node_id: impl Into<String>,
        request_timeout: Duration,
        local: Arc<SqliteStore>,
    ) -> Result<Self> {
        let mut base = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("invalid replica URL '{}': {}", base_url, e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base
            .join(REPLICATION_PATH)
            .map_err(|e| Error::Config(format!("invalid replica URL '{}': {}", base_url, e)))?;

        let http = Client::builder()
            .user_agent(concat!("fleetsync/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            endpoint,
            token,
            node_id: node_id.into(),
            changes: ChangeLog::new(local.clone()),
            local,
            frame_no: Mutex::new(None),
        })
    }

    /// Last replica position reported by the remote.
    pub fn frame_no(&self) -> Option<u64> {
        self.frame_no.lock().ok().and_then(|guard| *guard)
    }

    async fn replicate(&self, direction: ReplicationDirection) -> Result<ReplicationReport> {
        let outgoing = match direction {
            ReplicationDirection::Bidirectional => self.changes.pending(PUSH_BATCH).await?,
            ReplicationDirection::Pull => Vec::new(),
        };
        let request = ReplicationRequest {
            node_id: &self.node_id,
            direction,
            frame_no: self.frame_no(),
            changes: outgoing.iter().map(|p| &p.change).collect(),
        };

        let response = self
            .http
            .post(self.endpoint.clone())
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", self.token.expose()),
            )
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Replication(format!("replica unreachable: {}", e)))?;

        let response: ReplicationResponse = Self::handle_response(response).await?;
        let pulled = self.apply(&response.changes).await?;

        let pushed_ids: Vec<String> = outgoing.into_iter().map(|p| p.id).collect();
        self.changes.mark_pushed(&pushed_ids).await?;

        if let Some(frame_no) = response.frame_no {
            if let Ok(mut guard) = self.frame_no.lock() {
                *guard = Some(frame_no);
            }
        }

        let report = ReplicationReport {
            frames_pulled: pulled,
            frames_pushed: pushed_ids.len() as u64,
            frame_no: response.frame_no.or_else(|| self.frame_no()),
        };
        debug!(
            ?direction,
            pulled = report.frames_pulled,
            pushed = report.frames_pushed,
            "Replication call completed"
        );
        Ok(report)
    }

    /// Apply pulled changes atomically. Returns how many were applied.
    async fn apply(&self, changes: &[Change]) -> Result<u64> {
        if changes.is_empty() {
            return Ok(0);
        }
        let statements = changes
            .iter()
            .map(|change| change.apply_statement(Dialect::Sqlite))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| Error::Replication(format!("replica sent an unusable change: {}", e)))?;
        self.local
            .transaction(statements)
            .await
            .map_err(|e| Error::Replication(format!("failed to apply pulled changes: {}", e)))?;
        Ok(changes.len() as u64)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();

        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| Error::Replication(format!("invalid replica response: {}", e)))
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Err(Error::Replication(format!(
                "replica rejected credentials ({})",
                status
            )))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Replication(format!("replica error: {} - {}", status, body)))
        }
    }
}

#[async_trait]
impl Replicator for HttpReplicator {
    fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }

    async fn pull(&self) -> Result<ReplicationReport> {
        self.replicate(ReplicationDirection::Pull).await
    }

    async fn sync(&self) -> Result<ReplicationReport> {
        self.replicate(ReplicationDirection::Bidirectional).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ensure_schema;
    use crate::Store;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Serve one HTTP response and hand back the raw request.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + length {
                        break;
                    }
                }
            }

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            let _ = tx.send(String::from_utf8_lossy(&buf).to_string());
        });

        (format!("http://{}", addr), rx)
    }

    async fn local_store() -> Arc<SqliteStore> {
        let store = SqliteStore::in_memory().unwrap();
        ensure_schema(&store).await.unwrap();
        store
            .execute_batch("CREATE TABLE vessels (id TEXT PRIMARY KEY, name TEXT, flag TEXT)")
            .await
            .unwrap();
        Arc::new(store)
    }

    fn replicator(url: &str, local: Arc<SqliteStore>) -> HttpReplicator {
        HttpReplicator::new(url, Secret::new("tok-123"), "vessel-7", Duration::from_secs(5), local)
            .unwrap()
    }

    async fn vessel_names(store: &SqliteStore) -> Vec<String> {
        store
            .query("SELECT name FROM vessels ORDER BY id", &[])
            .await
            .unwrap()
            .into_iter()
            .map(|row| row["name"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_endpoint_joins_base_path() {
        let local = local_store().await;
        let r = replicator("https://replica.example.com/fleet", local.clone());
        assert_eq!(r.endpoint(), "https://replica.example.com/fleet/v1/replication");

        let r = replicator("https://replica.example.com/", local);
        assert_eq!(r.endpoint(), "https://replica.example.com/v1/replication");
    }

    #[tokio::test]
    async fn test_malformed_url_is_config_error() {
        let result = HttpReplicator::new(
            "not a url",
            Secret::new("t"),
            "n",
            Duration::from_secs(1),
            local_store().await,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_sync_pushes_pending_changes_and_records_frame() {
        let (url, request) = serve_once("200 OK", r#"{"frame_no": 77, "changes": []}"#).await;
        let local = local_store().await;
        let log = ChangeLog::new(local.clone());
        let mut row = crate::value::Row::new();
        row.insert("name".into(), json!("Nordic Star"));
        log.record(&Change::upsert("vessels", "v1", row)).await.unwrap();
        let r = replicator(&url, local);

        let report = r.sync().await.unwrap();
        assert_eq!(report.frames_pushed, 1);
        assert_eq!(report.frames_pulled, 0);
        assert_eq!(r.frame_no(), Some(77));
        assert_eq!(log.pending_count().await.unwrap(), 0);

        let request = request.await.unwrap();
        assert!(request.starts_with("POST /v1/replication"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer tok-123"));
        assert!(request.contains("\"direction\":\"bidirectional\""));
        assert!(request.contains("\"node_id\":\"vessel-7\""));
        assert!(request.contains("\"record_id\":\"v1\""));
        assert!(request.contains("Nordic Star"));
    }

    #[tokio::test]
    async fn test_pulled_changes_become_visible_locally() {
        let local = local_store().await;
        local
            .execute(
                "INSERT INTO vessels (id, name, flag) VALUES ('v2', 'Old Name', 'NO'), ('v3', 'Scrapped', 'NO')",
                &[],
            )
            .await
            .unwrap();
        let (url, request) = serve_once(
            "200 OK",
            r#"{"frame_no": 12, "changes": [
                {"table": "vessels", "record_id": "v1", "op": "upsert", "row": {"name": "Nordic Star", "flag": "NO"}},
                {"table": "vessels", "record_id": "v2", "op": "upsert", "row": {"name": "Sea Wolf"}},
                {"table": "vessels", "record_id": "v3", "op": "delete"}
            ]}"#,
        )
        .await;
        let log = ChangeLog::new(local.clone());
        log.record(&Change::delete("vessels", "v9")).await.unwrap();
        let r = replicator(&url, local.clone());

        let report = r.pull().await.unwrap();
        assert_eq!(report.frames_pulled, 3);
        assert_eq!(report.frames_pushed, 0);
        assert_eq!(report.frame_no, Some(12));
        assert_eq!(vessel_names(&local).await, vec!["Nordic Star", "Sea Wolf"]);

        // A pull never pushes.
        assert_eq!(log.pending_count().await.unwrap(), 1);
        let request = request.await.unwrap();
        assert!(request.contains("\"direction\":\"pull\""));
        assert!(request.contains("\"changes\":[]"));
    }

    #[tokio::test]
    async fn test_unusable_pull_applies_nothing() {
        let local = local_store().await;
        let (url, _request) = serve_once(
            "200 OK",
            r#"{"frame_no": 5, "changes": [
                {"table": "vessels", "record_id": "v1", "op": "upsert", "row": {"name": "Nordic Star"}},
                {"table": "no_such_table", "record_id": "x", "op": "delete"}
            ]}"#,
        )
        .await;
        let log = ChangeLog::new(local.clone());
        log.record(&Change::delete("vessels", "v9")).await.unwrap();
        let r = replicator(&url, local.clone());

        let err = r.sync().await.unwrap_err();
        assert!(matches!(err, Error::Replication(_)));
        assert!(vessel_names(&local).await.is_empty());
        assert_eq!(r.frame_no(), None);
        assert_eq!(log.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rejected_credentials() {
        let (url, _request) = serve_once("401 Unauthorized", "{}").await;
        let err = replicator(&url, local_store().await).pull().await.unwrap_err();
        assert!(matches!(err, Error::Replication(ref m) if m.contains("credentials")));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_unreachable_replica() {
        let err = replicator("http://127.0.0.1:1", local_store().await)
            .pull()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Replication(_)));
    }
}
