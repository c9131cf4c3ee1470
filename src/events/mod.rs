//! Activity log ingestion
//!
//! Callers never block on the database: records land in a bounded channel
//! and a dedicated drain task flushes them in batches through the write
//! queue. Overflow sheds the record and counts the drop. App log records
//! additionally stream live to the internal per-app log channel so follow
//! style tooling sees them before they hit disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, warn};

use crate::pubsub::{app_log_channel, SharedRegistry};
use crate::store::Store;
use crate::types::Result;

/// Channel capacity; overflow is dropped and counted
const BUFFER_CAPACITY: usize = 4096;
/// Flush when this many records are pending
const BATCH_SIZE: usize = 64;
/// Flush at least this often regardless of batch fill
const FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);

/// Who performed an action
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    User,
    System,
    ApiKey,
    Anonymous,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::User => "user",
            ActorType::System => "system",
            ActorType::ApiKey => "api_key",
            ActorType::Anonymous => "anonymous",
        }
    }
}

/// Outcome of an action
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionResult {
    Success,
    Failure,
}

impl ActionResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionResult::Success => "success",
            ActionResult::Failure => "failure",
        }
    }
}

/// One activity record
#[derive(Debug, Clone, Serialize)]
pub struct ActivityRecord {
    pub ts: DateTime<Utc>,
    pub actor_type: ActorType,
    pub actor_id: Option<String>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub result: ActionResult,
    /// Importance for feed ranking, 0-9
    pub weight: u8,
    /// Free-form structured detail (script log lines, error context)
    pub detail: Option<serde_json::Value>,
}

impl ActivityRecord {
    pub fn system(action: &str, resource_type: &str, resource_id: &str) -> Self {
        Self {
            ts: Utc::now(),
            actor_type: ActorType::System,
            actor_id: None,
            action: action.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            result: ActionResult::Success,
            weight: 0,
            detail: None,
        }
    }

    pub fn with_actor(mut self, actor_type: ActorType, actor_id: Option<String>) -> Self {
        self.actor_type = actor_type;
        self.actor_id = actor_id;
        self
    }

    pub fn with_result(mut self, result: ActionResult) -> Self {
        self.result = result;
        self
    }

    pub fn with_weight(mut self, weight: u8) -> Self {
        self.weight = weight.min(9);
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Script log severity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// RAM ring feeding the activity log table
pub struct EventBuffer {
    tx: mpsc::Sender<ActivityRecord>,
    dropped: AtomicU64,
    registry: SharedRegistry,
}

impl EventBuffer {
    /// Start the drain task and return the shared handle
    pub fn start(store: Store, registry: SharedRegistry) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(BUFFER_CAPACITY);
        let buffer = Arc::new(Self {
            tx,
            dropped: AtomicU64::new(0),
            registry,
        });
        tokio::spawn(drain_task(store, rx));
        buffer
    }

    /// Record an activity event. Never blocks; sheds on overflow.
    pub fn record(&self, record: ActivityRecord) {
        if self.tx.try_send(record).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a script log line: persisted like any activity record and
    /// mirrored live onto the app's internal log channel.
    pub fn app_log(&self, app_id: &str, level: LogLevel, message: &str) {
        let live = serde_json::json!({
            "ts": Utc::now().to_rfc3339(),
            "level": level.as_str(),
            "message": message,
        });
        self.registry.broadcast(&app_log_channel(app_id), live);

        self.record(
            ActivityRecord::system(&format!("log.{}", level.as_str()), "app", app_id)
                .with_detail(serde_json::json!({ "message": message })),
        );
    }

    /// Records shed so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn drain_task(store: Store, mut rx: mpsc::Receiver<ActivityRecord>) {
    let mut pending: Vec<ActivityRecord> = Vec::with_capacity(BATCH_SIZE);
    let mut ticker = interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe = rx.recv() => {
                match maybe {
                    Some(record) => {
                        pending.push(record);
                        if pending.len() >= BATCH_SIZE {
                            flush(&store, &mut pending).await;
                        }
                    }
                    None => {
                        flush(&store, &mut pending).await;
                        debug!("event buffer drain task exiting");
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                if !pending.is_empty() {
                    flush(&store, &mut pending).await;
                }
            }
        }
    }
}

async fn flush(store: &Store, pending: &mut Vec<ActivityRecord>) {
    if pending.is_empty() {
        return;
    }
    let batch = std::mem::take(pending);
    let count = batch.len();
    let result = store
        .writes()
        .submit(move |tx| {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO activity_log
                 (ts, actor_type, actor_id, action, resource_type, resource_id, result, weight, detail)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for r in &batch {
                stmt.execute(rusqlite::params![
                    r.ts.to_rfc3339(),
                    r.actor_type.as_str(),
                    r.actor_id,
                    r.action,
                    r.resource_type,
                    r.resource_id,
                    r.result.as_str(),
                    r.weight as i64,
                    r.detail.as_ref().map(|d| d.to_string()),
                ])?;
            }
            Ok(())
        })
        .await;

    match result {
        Ok(()) => debug!(count, "flushed activity batch"),
        // Best-effort by contract: a failed flush loses the batch
        Err(e) => warn!(count, "activity batch flush failed: {e}"),
    }
}

/// Read back recent activity, newest first, for the control-plane feed
pub async fn recent(store: &Store, limit: usize) -> Result<Vec<serde_json::Value>> {
    let limit = limit.min(1000) as i64;
    store
        .read(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT ts, actor_type, actor_id, action, resource_type, resource_id,
                        result, weight, detail
                 FROM activity_log ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit], |r| {
                Ok(serde_json::json!({
                    "ts": r.get::<_, String>(0)?,
                    "actor_type": r.get::<_, String>(1)?,
                    "actor_id": r.get::<_, Option<String>>(2)?,
                    "action": r.get::<_, String>(3)?,
                    "resource_type": r.get::<_, String>(4)?,
                    "resource_id": r.get::<_, String>(5)?,
                    "result": r.get::<_, String>(6)?,
                    "weight": r.get::<_, i64>(7)?,
                    "detail": r.get::<_, Option<String>>(8)?
                        .and_then(|d| serde_json::from_str::<serde_json::Value>(&d).ok()),
                }))
            })?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::Registry;

    async fn temp_buffer() -> (Arc<EventBuffer>, Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("events.db")).unwrap();
        let registry = Arc::new(Registry::new());
        (EventBuffer::start(store.clone(), registry), store, dir)
    }

    #[tokio::test]
    async fn records_reach_the_table() {
        let (buffer, store, _dir) = temp_buffer().await;
        buffer.record(
            ActivityRecord::system("app.deploy", "app", "app_1")
                .with_weight(3)
                .with_result(ActionResult::Success),
        );

        // Wait out the flush interval
        tokio::time::sleep(FLUSH_INTERVAL + std::time::Duration::from_millis(200)).await;

        let rows = recent(&store, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["action"], "app.deploy");
        assert_eq!(rows[0]["weight"], 3);
    }

    #[tokio::test]
    async fn app_logs_stream_live() {
        let (buffer, _store, _dir) = temp_buffer().await;
        let registry = Arc::clone(&buffer.registry);
        let (id, mut rx) = registry.connect("app_1");
        registry.subscribe(id, &app_log_channel("app_1"));

        buffer.app_log("app_1", LogLevel::Warn, "disk almost full");

        let msg = rx.recv().await.unwrap();
        let payload = msg.payload.unwrap();
        assert_eq!(payload["level"], "warn");
        assert_eq!(payload["message"], "disk almost full");
    }

    #[tokio::test]
    async fn weight_is_clamped() {
        let record = ActivityRecord::system("x", "y", "z").with_weight(99);
        assert_eq!(record.weight, 9);
    }
}
