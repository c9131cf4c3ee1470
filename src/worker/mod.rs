//! Background job system
//!
//! Queued and daemon-mode jobs with declared memory budgets. Admission
//! accounts budgets against the process-wide cap and per-app concurrency
//! limits; jobs that cannot start wait in the queue until resources free.
//! Daemons restart on failure with exponential backoff and are restored from
//! their last checkpoint when the process restarts.

pub mod job;
mod runner;

pub use job::{JobInfo, JobSpec, JobStatus};

use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::events::EventBuffer;
use crate::ids;
use crate::pubsub::SharedRegistry;
use crate::store::Store;
use crate::types::{FaztError, Result};
use crate::vfs::Vfs;

/// Resource limits for the pool
#[derive(Debug, Clone)]
pub struct WorkerLimits {
    pub memory_bytes: u64,
    pub max_concurrent: usize,
    pub max_per_app: usize,
    pub max_daemons_per_app: usize,
}

impl Default for WorkerLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 256 * 1024 * 1024,
            max_concurrent: 20,
            max_per_app: 5,
            max_daemons_per_app: 2,
        }
    }
}

/// Control handle for a running job
pub(crate) struct RunningJob {
    pub app_id: String,
    pub daemon: bool,
    pub memory_bytes: u64,
    pub cancelled: Arc<AtomicBool>,
}

/// A job admitted to the table but waiting on resources
struct QueuedJob {
    info: JobInfo,
    spec: JobSpec,
}

/// The pool itself
pub struct WorkerPool {
    pub(crate) store: Store,
    pub(crate) vfs: Arc<Vfs>,
    pub(crate) registry: SharedRegistry,
    pub(crate) events: Arc<EventBuffer>,
    limits: WorkerLimits,
    memory_in_use: AtomicU64,
    pub(crate) running: DashMap<String, RunningJob>,
    queue: Mutex<VecDeque<QueuedJob>>,
}

impl WorkerPool {
    pub fn new(
        store: Store,
        vfs: Arc<Vfs>,
        registry: SharedRegistry,
        events: Arc<EventBuffer>,
        limits: WorkerLimits,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            vfs,
            registry,
            events,
            limits,
            memory_in_use: AtomicU64::new(0),
            running: DashMap::new(),
            queue: Mutex::new(VecDeque::new()),
        })
    }

    /// Submit a job. The row is persisted immediately; the job starts now if
    /// resources allow, otherwise it waits in the queue.
    pub async fn spawn(self: &Arc<Self>, app_id: &str, spec: JobSpec) -> Result<JobInfo> {
        if spec.memory_bytes > self.limits.memory_bytes {
            return Err(FaztError::Validation(format!(
                "memory budget {} exceeds the process cap {}",
                spec.memory_bytes, self.limits.memory_bytes
            )));
        }
        if spec.daemon {
            let daemons = self
                .running
                .iter()
                .filter(|e| e.value().app_id == app_id && e.value().daemon)
                .count();
            if daemons >= self.limits.max_daemons_per_app {
                return Err(FaztError::Validation(format!(
                    "daemon limit reached ({} per app)",
                    self.limits.max_daemons_per_app
                )));
            }
        }

        let info = JobInfo::new(ids::job_id(), app_id, &spec);
        self.persist_new(&info, &spec).await?;

        self.queue.lock().await.push_back(QueuedJob {
            info: info.clone(),
            spec,
        });
        self.pump().await;
        Ok(info)
    }

    /// Look one job up, scoped to its app
    pub async fn get(&self, app_id: &str, job_id: &str) -> Result<Option<JobInfo>> {
        let app = app_id.to_string();
        let id = job_id.to_string();
        self.store
            .read(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, app_id, name, status, daemon, memory_budget, restart_count,
                            created_at, updated_at
                     FROM jobs WHERE app_id = ?1 AND id = ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![app, id])?;
                match rows.next()? {
                    Some(r) => Ok(Some(row_to_info(r)?)),
                    None => Ok(None),
                }
            })
            .await
    }

    /// All jobs for one app, newest first
    pub async fn list(&self, app_id: &str) -> Result<Vec<JobInfo>> {
        let app = app_id.to_string();
        self.store
            .read(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, app_id, name, status, daemon, memory_budget, restart_count,
                            created_at, updated_at
                     FROM jobs WHERE app_id = ?1 ORDER BY created_at DESC",
                )?;
                let rows = stmt.query_map([app], |r| {
                    row_to_info(r).map_err(|e| {
                        rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(
                            e.to_string(),
                        )))
                    })
                })?;
                Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
            })
            .await
    }

    /// Cancel a job: running jobs get the cancel signal, queued jobs are
    /// dropped from the queue, terminal jobs are left alone.
    pub async fn cancel(self: &Arc<Self>, app_id: &str, job_id: &str) -> Result<bool> {
        if let Some(entry) = self.running.get(job_id) {
            if entry.value().app_id != app_id {
                return Ok(false);
            }
            entry.value().cancelled.store(true, Ordering::Relaxed);
            return Ok(true);
        }

        let mut queue = self.queue.lock().await;
        let before = queue.len();
        queue.retain(|q| !(q.info.id == job_id && q.info.app_id == app_id));
        let removed = queue.len() < before;
        drop(queue);

        if removed {
            self.set_status(job_id, JobStatus::Cancelled).await?;
        }
        Ok(removed)
    }

    /// Cancel everything belonging to an app (app deletion)
    pub async fn cancel_app(self: &Arc<Self>, app_id: &str) -> Result<()> {
        for entry in self.running.iter() {
            if entry.value().app_id == app_id {
                entry.value().cancelled.store(true, Ordering::Relaxed);
            }
        }
        let mut queue = self.queue.lock().await;
        queue.retain(|q| q.info.app_id != app_id);
        Ok(())
    }

    /// Restore daemons after a process restart: every daemon row not in a
    /// terminal cancelled state is resubmitted with its last checkpoint.
    pub async fn restore_daemons(self: &Arc<Self>) -> Result<usize> {
        let rows = self
            .store
            .read(|conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, app_id, name, memory_budget, timeout_ms, idle_channel,
                            idle_timeout_ms
                     FROM jobs WHERE daemon = 1 AND status IN ('queued', 'running')",
                )?;
                let rows = stmt.query_map([], |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, i64>(3)?,
                        r.get::<_, Option<i64>>(4)?,
                        r.get::<_, Option<String>>(5)?,
                        r.get::<_, Option<i64>>(6)?,
                    ))
                })?;
                Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
            })
            .await?;

        let count = rows.len();
        for (id, app_id, name, memory, timeout_ms, idle_channel, idle_timeout_ms) in rows {
            let spec = JobSpec {
                name,
                script: None,
                daemon: true,
                memory_bytes: memory as u64,
                timeout: timeout_ms.map(|ms| std::time::Duration::from_millis(ms as u64)),
                idle_channel,
                idle_timeout_ms: idle_timeout_ms.map(|ms| ms as u64),
            };
            let info = JobInfo {
                id: id.clone(),
                app_id: app_id.clone(),
                name: spec.name.clone(),
                status: JobStatus::Queued,
                daemon: true,
                memory_budget: spec.memory_bytes,
                restart_count: 0,
                created_at: Utc::now().to_rfc3339(),
                updated_at: Utc::now().to_rfc3339(),
            };
            info!(job = %id, app = %app_id, "restoring daemon");
            self.queue.lock().await.push_back(QueuedJob { info, spec });
        }
        self.pump().await;
        Ok(count)
    }

    /// Admit queued jobs while resources allow. Called after submissions
    /// and completions.
    pub(crate) fn pump(self: &Arc<Self>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            loop {
                let next = {
                    let mut queue = self.queue.lock().await;
                    let Some(front) = queue.front() else { break };
                    if !self.can_admit(&front.info) {
                        break;
                    }
                    queue.pop_front().expect("front checked")
                };

                self.memory_in_use
                    .fetch_add(next.spec.memory_bytes, Ordering::Relaxed);
                let cancelled = Arc::new(AtomicBool::new(false));
                self.running.insert(
                    next.info.id.clone(),
                    RunningJob {
                        app_id: next.info.app_id.clone(),
                        daemon: next.spec.daemon,
                        memory_bytes: next.spec.memory_bytes,
                        cancelled: Arc::clone(&cancelled),
                    },
                );

                let pool = Arc::clone(self);
                tokio::spawn(async move {
                    runner::run_job(pool, next.info, next.spec, cancelled).await;
                });
            }
        })
    }

    fn can_admit(&self, info: &JobInfo) -> bool {
        if self.running.len() >= self.limits.max_concurrent {
            return false;
        }
        if self.memory_in_use.load(Ordering::Relaxed) + info.memory_budget
            > self.limits.memory_bytes
        {
            return false;
        }
        let app_running = self
            .running
            .iter()
            .filter(|e| e.value().app_id == info.app_id)
            .count();
        app_running < self.limits.max_per_app
    }

    /// Called by the runner when a job reaches a terminal state
    pub(crate) async fn release(self: &Arc<Self>, job_id: &str) {
        if let Some((_, running)) = self.running.remove(job_id) {
            self.memory_in_use
                .fetch_sub(running.memory_bytes, Ordering::Relaxed);
        }
        self.pump().await;
    }

    /// Memory currently reserved by running jobs
    pub fn memory_in_use(&self) -> u64 {
        self.memory_in_use.load(Ordering::Relaxed)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    async fn persist_new(&self, info: &JobInfo, spec: &JobSpec) -> Result<()> {
        let info = info.clone();
        let spec_timeout = spec.timeout.map(|d| d.as_millis() as i64);
        let idle_channel = spec.idle_channel.clone();
        let idle_timeout = spec.idle_timeout_ms.map(|ms| ms as i64);
        self.store
            .writes()
            .submit(move |tx| {
                tx.execute(
                    "INSERT INTO jobs (id, app_id, name, status, daemon, memory_budget,
                                       timeout_ms, restart_count, idle_channel, idle_timeout_ms,
                                       created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, ?10, ?11)",
                    rusqlite::params![
                        info.id,
                        info.app_id,
                        info.name,
                        info.status.as_str(),
                        info.daemon as i64,
                        info.memory_budget as i64,
                        spec_timeout,
                        idle_channel,
                        idle_timeout,
                        info.created_at,
                        info.updated_at,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub(crate) async fn set_status(&self, job_id: &str, status: JobStatus) -> Result<()> {
        let id = job_id.to_string();
        let now = Utc::now().to_rfc3339();
        let result = self
            .store
            .writes()
            .submit(move |tx| {
                tx.execute(
                    "UPDATE jobs SET status = ?2, updated_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, status.as_str(), now],
                )?;
                Ok(())
            })
            .await;
        if let Err(e) = &result {
            warn!(job = job_id, "failed to persist job status: {e}");
        }
        result
    }

    pub(crate) async fn bump_restart(&self, job_id: &str) {
        let id = job_id.to_string();
        let now = Utc::now().to_rfc3339();
        let _ = self
            .store
            .writes()
            .submit(move |tx| {
                tx.execute(
                    "UPDATE jobs SET restart_count = restart_count + 1, updated_at = ?2
                     WHERE id = ?1",
                    rusqlite::params![id, now],
                )?;
                Ok(())
            })
            .await;
    }

    pub(crate) async fn save_checkpoint(&self, job_id: &str, checkpoint: serde_json::Value) {
        let id = job_id.to_string();
        let blob = checkpoint.to_string();
        let now = Utc::now().to_rfc3339();
        let _ = self
            .store
            .writes()
            .submit(move |tx| {
                tx.execute(
                    "UPDATE jobs SET checkpoint = ?2, updated_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, blob, now],
                )?;
                Ok(())
            })
            .await;
    }

    pub(crate) async fn load_checkpoint(&self, job_id: &str) -> Option<serde_json::Value> {
        let id = job_id.to_string();
        self.store
            .read(move |conn| {
                let blob: Option<String> = conn
                    .query_row("SELECT checkpoint FROM jobs WHERE id = ?1", [id], |r| {
                        r.get(0)
                    })
                    .unwrap_or(None);
                Ok(blob.and_then(|b| serde_json::from_str(&b).ok()))
            })
            .await
            .unwrap_or(None)
    }
}

fn row_to_info(r: &rusqlite::Row<'_>) -> Result<JobInfo> {
    Ok(JobInfo {
        id: r.get(0)?,
        app_id: r.get(1)?,
        name: r.get(2)?,
        status: JobStatus::parse(&r.get::<_, String>(3)?)?,
        daemon: r.get::<_, i64>(4)? != 0,
        memory_budget: r.get::<_, i64>(5)? as u64,
        restart_count: r.get::<_, i64>(6)? as u32,
        created_at: r.get(7)?,
        updated_at: r.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::Registry;

    async fn temp_pool() -> (Arc<WorkerPool>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("worker.db")).unwrap();
        let vfs = Arc::new(Vfs::new(store.clone(), 1024 * 1024));
        let registry = Arc::new(Registry::new());
        let events = EventBuffer::start(store.clone(), Arc::clone(&registry));
        (
            WorkerPool::new(store, vfs, registry, events, WorkerLimits::default()),
            dir,
        )
    }

    fn one_shot(name: &str) -> JobSpec {
        JobSpec {
            name: name.into(),
            script: Some("jobs/missing.rhai".into()),
            daemon: false,
            memory_bytes: 1024 * 1024,
            timeout: Some(std::time::Duration::from_secs(1)),
            idle_channel: None,
            idle_timeout_ms: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spawn_persists_and_lists() {
        let (pool, _dir) = temp_pool().await;
        let info = pool.spawn("app_1", one_shot("sync")).await.unwrap();
        assert!(info.id.starts_with("job_"));

        let listed = pool.list("app_1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "sync");

        // Scoped lookups: another app sees nothing
        assert!(pool.get("app_2", &info.id).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oversized_budget_rejected() {
        let (pool, _dir) = temp_pool().await;
        let mut spec = one_shot("big");
        spec.memory_bytes = 10 * 1024 * 1024 * 1024;
        assert!(matches!(
            pool.spawn("app_1", spec).await,
            Err(FaztError::Validation(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_script_fails_job() {
        let (pool, _dir) = temp_pool().await;
        let info = pool.spawn("app_1", one_shot("broken")).await.unwrap();

        // The runner marks the job failed once it cannot load the script
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if let Some(job) = pool.get("app_1", &info.id).await.unwrap() {
                if job.status.is_terminal() {
                    assert_eq!(job.status, JobStatus::Failed);
                    return;
                }
            }
        }
        panic!("job never reached a terminal state");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn daemon_resumes_from_checkpoint_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("daemon.db")).unwrap();
        let vfs = Arc::new(Vfs::new(store.clone(), 1024 * 1024));
        let registry = Arc::new(crate::pubsub::Registry::new());
        let events = EventBuffer::start(store.clone(), Arc::clone(&registry));
        let pool = WorkerPool::new(
            store.clone(),
            Arc::clone(&vfs),
            registry,
            events,
            WorkerLimits::default(),
        );

        let app = crate::apps::create(
            &store,
            &serde_json::json!({"name": "ticker", "main": "jobs/tick.rhai"}),
        )
        .await
        .unwrap();

        // Each run reads the restored counter, records it, checkpoints n+1
        vfs.put(
            &app.id,
            "/jobs/tick.rhai",
            br#"
            let restored = job.checkpoint();
            let n = if restored == () { 0 } else { restored.n };
            fazt.app.kv.set("seen", #{n: n});
            job.checkpoint(#{n: n + 1});
            "#
            .to_vec(),
            "text/plain",
        )
        .await
        .unwrap();

        let spec = JobSpec {
            name: "tick".into(),
            script: Some("jobs/tick.rhai".into()),
            daemon: true,
            memory_bytes: 4 * 1024 * 1024,
            timeout: None,
            idle_channel: None,
            idle_timeout_ms: None,
        };
        let info = pool.spawn(&app.id, spec).await.unwrap();

        let storage =
            crate::storage::AppStorage::new(store.clone(), crate::storage::Scope::app(&app.id));
        wait_for_seen(&storage, 0).await;

        // "Kill" the daemon and simulate a crash that left status=running
        assert!(pool.cancel(&app.id, &info.id).await.unwrap());
        wait_for_terminal(&pool, &app.id, &info.id).await;
        let checkpoint = pool.load_checkpoint(&info.id).await.unwrap();
        let saved_n = checkpoint["n"].as_i64().unwrap();
        assert!(saved_n >= 1);

        let id = info.id.clone();
        store
            .writes()
            .submit(move |tx| {
                tx.execute("UPDATE jobs SET status = 'running' WHERE id = ?1", [id])?;
                Ok(())
            })
            .await
            .unwrap();

        // Restore path: the daemon resumes with its checkpointed counter.
        // The restored spec runs the manifest main, which points at the
        // same tick script.
        let restored = pool.restore_daemons().await.unwrap();
        assert_eq!(restored, 1);
        // The resumed counter picks up from the checkpoint, not from zero
        let seen = wait_for_seen(&storage, saved_n).await;
        assert!(seen >= saved_n);

        let _ = pool.cancel(&app.id, &info.id).await;
    }

    async fn wait_for_seen(storage: &crate::storage::AppStorage, at_least: i64) -> i64 {
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            if let Ok(Some(bytes)) = storage.kv().get("seen").await {
                if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes) {
                    let n = value["n"].as_i64().unwrap_or(-1);
                    if n >= at_least {
                        return n;
                    }
                }
            }
        }
        panic!("daemon never recorded a counter >= {at_least}");
    }

    async fn wait_for_terminal(pool: &Arc<WorkerPool>, app_id: &str, job_id: &str) {
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            if let Some(job) = pool.get(app_id, job_id).await.unwrap() {
                if job.status.is_terminal() {
                    return;
                }
            }
        }
        panic!("job never reached a terminal state");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn checkpoints_round_trip() {
        let (pool, _dir) = temp_pool().await;
        let info = pool.spawn("app_1", one_shot("ckpt")).await.unwrap();

        pool.save_checkpoint(&info.id, serde_json::json!({"n": 41}))
            .await;
        let restored = pool.load_checkpoint(&info.id).await.unwrap();
        assert_eq!(restored["n"], 41);
    }
}
