//! Job execution
//!
//! One task per running job. Daemons loop inside Running and restart on
//! failure with exponential backoff; idle-stop watches a channel's
//! subscriber count and cancels (not fails) the job when it stays at zero
//! past the declared timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{JobInfo, JobSpec, JobStatus, WorkerPool};
use crate::config::curated_env;
use crate::events::{ActionResult, ActivityRecord, LogLevel};
use crate::pubsub::app_channel;
use crate::script::{self, AppInfo, InvocationState, InvokeOutcome, JobBindings};
use crate::storage::{AppStorage, Scope};

/// Daemon restart backoff: initial, doubling, capped
const RESTART_INITIAL: Duration = Duration::from_secs(1);
const RESTART_CAP: Duration = Duration::from_secs(60);

/// Delay between clean daemon iterations (no failure)
const DAEMON_LOOP_DELAY: Duration = Duration::from_secs(1);

/// Effective deadline for indefinite jobs
const INDEFINITE: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

/// How one run of the script ended, from the pool's perspective
enum RunResult {
    Clean,
    Failed(String),
    Oom(String),
    TimedOut,
    Cancelled,
}

pub(crate) async fn run_job(
    pool: Arc<WorkerPool>,
    info: JobInfo,
    spec: JobSpec,
    cancelled: Arc<AtomicBool>,
) {
    let _ = pool.set_status(&info.id, JobStatus::Running).await;
    info!(job = %info.id, app = %info.app_id, name = %info.name, daemon = spec.daemon, "job started");

    // Idle-stop watcher: flips `idle_stopped` then the shared cancel flag.
    let idle_stopped = Arc::new(AtomicBool::new(false));
    let idle_watcher = spec.idle_channel.as_ref().map(|channel| {
        let registry = Arc::clone(&pool.registry);
        let channel = app_channel(&info.app_id, channel);
        let timeout = Duration::from_millis(spec.idle_timeout_ms.unwrap_or(0));
        let cancelled = Arc::clone(&cancelled);
        let idle_stopped = Arc::clone(&idle_stopped);
        tokio::spawn(async move {
            let mut zero_since: Option<Instant> = None;
            loop {
                sleep(Duration::from_secs(1)).await;
                if registry.subscribers(&channel) == 0 {
                    let since = zero_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= timeout {
                        idle_stopped.store(true, Ordering::Relaxed);
                        cancelled.store(true, Ordering::Relaxed);
                        return;
                    }
                } else {
                    zero_since = None;
                }
            }
        })
    });

    let mut backoff = RESTART_INITIAL;
    let final_status = loop {
        if cancelled.load(Ordering::Relaxed) {
            break JobStatus::Cancelled;
        }

        let result = run_once(&pool, &info, &spec, Arc::clone(&cancelled)).await;

        match result {
            RunResult::Cancelled => break JobStatus::Cancelled,
            RunResult::Clean => {
                if !spec.daemon {
                    break JobStatus::Succeeded;
                }
                backoff = RESTART_INITIAL;
                sleep(DAEMON_LOOP_DELAY).await;
            }
            RunResult::TimedOut => {
                pool.events.record(
                    ActivityRecord::system("job.timeout", "job", &info.id)
                        .with_result(ActionResult::Failure)
                        .with_weight(4),
                );
                if !spec.daemon {
                    break JobStatus::Failed;
                }
                backoff = restart_delay(&pool, &info, backoff).await;
            }
            RunResult::Oom(detail) => {
                warn!(job = %info.id, "memory budget exceeded: {detail}");
                pool.events.record(
                    ActivityRecord::system("job.oom", "job", &info.id)
                        .with_result(ActionResult::Failure)
                        .with_weight(5)
                        .with_detail(serde_json::json!({ "detail": detail })),
                );
                if !spec.daemon {
                    break JobStatus::Failed;
                }
                backoff = restart_delay(&pool, &info, backoff).await;
            }
            RunResult::Failed(detail) => {
                pool.events.app_log(&info.app_id, LogLevel::Error, &detail);
                if !spec.daemon {
                    break JobStatus::Failed;
                }
                backoff = restart_delay(&pool, &info, backoff).await;
            }
        }

        // A daemon whose app disappeared stays down
        if spec.daemon
            && crate::apps::get(&pool.store, &info.app_id)
                .await
                .ok()
                .flatten()
                .is_none()
        {
            info!(job = %info.id, "app deleted, stopping daemon");
            break JobStatus::Cancelled;
        }
    };

    if let Some(watcher) = idle_watcher {
        watcher.abort();
    }

    let status = if idle_stopped.load(Ordering::Relaxed) {
        // Idle-stop is a cancellation, never a failure
        JobStatus::Cancelled
    } else {
        final_status
    };
    let _ = pool.set_status(&info.id, status).await;
    info!(job = %info.id, status = status.as_str(), "job finished");
    pool.release(&info.id).await;
}

async fn restart_delay(pool: &Arc<WorkerPool>, info: &JobInfo, backoff: Duration) -> Duration {
    pool.bump_restart(&info.id).await;
    debug!(job = %info.id, "daemon restarting in {backoff:?}");
    sleep(backoff).await;
    (backoff * 2).min(RESTART_CAP)
}

async fn run_once(
    pool: &Arc<WorkerPool>,
    info: &JobInfo,
    spec: &JobSpec,
    cancelled: Arc<AtomicBool>,
) -> RunResult {
    let Some(app) = crate::apps::get(&pool.store, &info.app_id).await.ok().flatten() else {
        return RunResult::Failed(format!("app {} not found", info.app_id));
    };

    let script_path = spec
        .script
        .clone()
        .unwrap_or_else(|| app.manifest_parsed.main.clone());
    let source = match load_script(pool, &info.app_id, &script_path).await {
        Ok(source) => source,
        Err(e) => return RunResult::Failed(e),
    };

    let engine = script::build_engine(Some(spec.memory_bytes));
    let ast = match engine.compile(&source) {
        Ok(ast) => ast,
        Err(e) => return RunResult::Failed(format!("compile error in {script_path}: {e}")),
    };

    let restored = pool.load_checkpoint(&info.id).await;
    let save_pool = Arc::clone(pool);
    let save_job_id = info.id.clone();
    let rt = tokio::runtime::Handle::current();
    let save_rt = rt.clone();
    let bindings = JobBindings {
        job_id: info.id.clone(),
        cancelled: Arc::clone(&cancelled),
        restored,
        save: Box::new(move |checkpoint| {
            let pool = Arc::clone(&save_pool);
            let job_id = save_job_id.clone();
            save_rt.spawn(async move {
                pool.save_checkpoint(&job_id, checkpoint).await;
            });
        }),
    };

    let deadline = Instant::now() + spec.timeout.unwrap_or(INDEFINITE);
    let state = Arc::new(InvocationState::new(
        AppInfo {
            id: app.id.clone(),
            name: app.name.clone(),
            manifest: app.manifest.clone(),
        },
        curated_env(),
        None,
        AppStorage::new(pool.store.clone(), Scope::app(&info.app_id)),
        None,
        Arc::clone(&pool.registry),
        Arc::clone(&pool.events),
        Arc::clone(&pool.vfs),
        Some(Arc::clone(pool)),
        // Jobs run as the app itself; the private tree is theirs
        true,
        deadline,
        Arc::clone(&cancelled),
        rt,
        Some(bindings),
    ));

    let outcome = tokio::task::spawn_blocking(move || {
        script::invoke::run_handler(&engine, &ast, &source, state, None)
    })
    .await;

    match outcome {
        Ok(InvokeOutcome::Responded(_)) | Ok(InvokeOutcome::NoResponse) => RunResult::Clean,
        Ok(InvokeOutcome::Cancelled) => RunResult::Cancelled,
        Ok(InvokeOutcome::TimedOut) => RunResult::TimedOut,
        Ok(InvokeOutcome::AuthRequired) | Ok(InvokeOutcome::Forbidden(_)) => {
            RunResult::Failed("job used an auth-gated capability without a user".into())
        }
        Ok(InvokeOutcome::Errored(failure)) => {
            if failure.class == "MemoryLimit" {
                RunResult::Oom(failure.message)
            } else {
                RunResult::Failed(format!(
                    "{}: {} (line {:?})",
                    failure.class, failure.message, failure.line
                ))
            }
        }
        Err(join_err) => RunResult::Failed(format!("job context panicked: {join_err}")),
    }
}

async fn load_script(
    pool: &Arc<WorkerPool>,
    app_id: &str,
    path: &str,
) -> Result<String, String> {
    let file = pool
        .vfs
        .get(app_id, path)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("job script not found: {path}"))?;
    String::from_utf8(file.bytes.to_vec()).map_err(|_| "job script is not valid UTF-8".into())
}
