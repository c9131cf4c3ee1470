//! Scripted handler runtime
//!
//! A bounded pool of single-threaded script contexts plus a per-app compile
//! cache. A context is checked out for exactly one invocation; contexts that
//! time out, error, or panic are destroyed rather than returned. Evaluation
//! always happens on blocking threads so a hot loop cannot stall the
//! reactor, and the CPU-time cap is enforced from the progress callback.

pub mod invoke;
pub mod modules;
pub mod resolver;

pub use invoke::{
    AppInfo, HandlerRequest, InvocationState, InvokeOutcome, JobBindings, ResponseData,
    ScriptFailure,
};

use dashmap::DashMap;
use rhai::{Engine, Map, AST};
use sha2::{Digest, Sha256};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::types::{FaztError, Result};
use crate::vfs::Vfs;

/// Progress callback sampling interval, in operations
const PROGRESS_CHECK_OPS: u64 = 1024;

/// A compiled app bundle: entry point source and its AST
pub struct CompiledApp {
    pub main: String,
    pub sha256: String,
    pub source: String,
    pub ast: AST,
}

struct ScriptContext {
    engine: Engine,
}

/// Pool of script contexts with a per-app compile cache
pub struct ScriptPool {
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<ScriptContext>>,
    compile_cache: DashMap<String, Arc<CompiledApp>>,
    compile_engine: Engine,
}

impl ScriptPool {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
            idle: Mutex::new(Vec::new()),
            compile_cache: DashMap::new(),
            compile_engine: build_engine(None),
        }
    }

    /// Fetch (or compile and cache) the app's handler bundle. Cache key is
    /// (entry point, source sha); a re-deploy with changed source misses
    /// automatically, and [`ScriptPool::invalidate_app`] drops the entry
    /// eagerly.
    pub async fn compiled_for(
        &self,
        app_id: &str,
        main: &str,
        vfs: &Arc<Vfs>,
    ) -> Result<Arc<CompiledApp>> {
        let entry_path = crate::vfs::canonical_path(main)?;
        let file = vfs
            .get(app_id, &entry_path)
            .await?
            .ok_or_else(|| FaztError::NotFound(format!("handler entry point {entry_path}")))?;
        let source = String::from_utf8(file.bytes.to_vec())
            .map_err(|_| FaztError::Validation("handler source is not valid UTF-8".into()))?;
        let sha = hex::encode(Sha256::digest(source.as_bytes()));

        if let Some(cached) = self.compile_cache.get(app_id) {
            if cached.main == entry_path && cached.sha256 == sha {
                return Ok(Arc::clone(&cached));
            }
        }

        let ast = self
            .compile_engine
            .compile(&source)
            .map_err(|e| FaztError::Script(format!("compile error: {e}")))?;

        let compiled = Arc::new(CompiledApp {
            main: entry_path,
            sha256: sha,
            source,
            ast,
        });
        self.compile_cache
            .insert(app_id.to_string(), Arc::clone(&compiled));
        debug!(app_id, main = %compiled.main, "handler compiled and cached");
        Ok(compiled)
    }

    /// Drop the compile cache entry for an app (re-deploy, deletion)
    pub fn invalidate_app(&self, app_id: &str) {
        self.compile_cache.remove(app_id);
    }

    /// Run one invocation: check a context out, evaluate on a blocking
    /// thread, and return or destroy the context based on the outcome.
    pub async fn invoke(
        &self,
        compiled: Arc<CompiledApp>,
        state: Arc<InvocationState>,
        request: Option<Map>,
    ) -> InvokeOutcome {
        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return InvokeOutcome::Errored(ScriptFailure {
                    class: "PoolClosed".into(),
                    message: "script pool closed".into(),
                    line: None,
                    context: None,
                })
            }
        };

        let context = match self.idle.lock().await.pop() {
            Some(ctx) => ctx,
            None => ScriptContext {
                engine: build_engine(None),
            },
        };

        let handle = tokio::task::spawn_blocking(move || {
            let outcome = invoke::run_handler(
                &context.engine,
                &compiled.ast,
                &compiled.source,
                state,
                request,
            );
            (context, outcome)
        })
        .await;

        match handle {
            Ok((context, outcome)) => {
                // A clean finish returns the context; faults destroy it and
                // a fresh one is built on the next checkout.
                match &outcome {
                    InvokeOutcome::Responded(_)
                    | InvokeOutcome::NoResponse
                    | InvokeOutcome::AuthRequired
                    | InvokeOutcome::Forbidden(_) => {
                        self.idle.lock().await.push(context);
                    }
                    InvokeOutcome::TimedOut
                    | InvokeOutcome::Cancelled
                    | InvokeOutcome::Errored(_) => {
                        debug!("destroying script context after fault");
                    }
                }
                outcome
            }
            Err(join_err) => {
                warn!("script context panicked: {join_err}");
                InvokeOutcome::Errored(ScriptFailure {
                    class: "Panic".into(),
                    message: "script context panicked".into(),
                    line: None,
                    context: None,
                })
            }
        }
    }
}

/// Build a fully configured engine. `memory_budget` derives the data-size
/// limits for worker jobs; handler contexts use the defaults.
pub fn build_engine(memory_budget: Option<u64>) -> Engine {
    let mut engine = Engine::new();

    engine.set_module_resolver(resolver::FaztResolver::new());
    invoke::register_api(&mut engine);

    engine.set_max_call_levels(64);
    engine.set_max_expr_depths(96, 96);

    match memory_budget {
        None => {
            engine.set_max_string_size(8 * 1024 * 1024);
            engine.set_max_array_size(1_000_000);
            engine.set_max_map_size(1_000_000);
        }
        Some(bytes) => {
            // Coarse mapping from a declared byte budget onto engine data
            // limits; overruns terminate with a data-too-large error.
            let strings = (bytes / 8).clamp(64 * 1024, 64 * 1024 * 1024) as usize;
            let entries = (bytes / 256).clamp(1024, 16_000_000) as usize;
            engine.set_max_string_size(strings);
            engine.set_max_array_size(entries);
            engine.set_max_map_size(entries);
        }
    }

    engine.on_progress(|ops| {
        if ops % PROGRESS_CHECK_OPS != 0 {
            return None;
        }
        if let Some(state) = invoke::current() {
            if state.cancelled.load(Ordering::Relaxed) {
                return Some(invoke::TERM_CANCELLED.into());
            }
            if Instant::now() >= state.deadline {
                return Some(invoke::TERM_TIMEOUT.into());
            }
        }
        None
    });

    engine
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBuffer;
    use crate::pubsub::Registry;
    use crate::storage::{AppStorage, Scope};
    use crate::store::Store;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    struct Fixture {
        pool: Arc<ScriptPool>,
        vfs: Arc<Vfs>,
        store: Store,
        registry: crate::pubsub::SharedRegistry,
        events: Arc<EventBuffer>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("script.db")).unwrap();
        let vfs = Arc::new(Vfs::new(store.clone(), 1024 * 1024));
        let registry = Arc::new(Registry::new());
        let events = EventBuffer::start(store.clone(), Arc::clone(&registry));
        Fixture {
            pool: Arc::new(ScriptPool::new(4)),
            vfs,
            store,
            registry,
            events,
            _dir: dir,
        }
    }

    fn test_state(f: &Fixture, deadline_ms: u64) -> Arc<InvocationState> {
        Arc::new(InvocationState::new(
            AppInfo {
                id: "app_000000000001".into(),
                name: "demo".into(),
                manifest: serde_json::json!({"name": "demo"}),
            },
            HashMap::new(),
            None,
            AppStorage::new(f.store.clone(), Scope::app("app_000000000001")),
            None,
            Arc::clone(&f.registry),
            Arc::clone(&f.events),
            Arc::clone(&f.vfs),
            None,
            false,
            Instant::now() + Duration::from_millis(deadline_ms),
            Arc::new(AtomicBool::new(false)),
            tokio::runtime::Handle::current(),
            None,
        ))
    }

    async fn deploy_main(f: &Fixture, source: &str) -> Arc<CompiledApp> {
        f.vfs
            .put(
                "app_000000000001",
                "/api/main.rhai",
                source.as_bytes().to_vec(),
                "text/plain",
            )
            .await
            .unwrap();
        f.pool
            .compiled_for("app_000000000001", "api/main.rhai", &f.vfs)
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn respond_round_trip() {
        let f = fixture().await;
        let compiled = deploy_main(&f, r#"respond(201, #{ok: true});"#).await;
        let state = test_state(&f, 5000);

        match f.pool.invoke(compiled, state, None).await {
            InvokeOutcome::Responded(data) => {
                assert_eq!(data.status, 201);
                assert_eq!(data.content_type, "application/json");
                let json: serde_json::Value = serde_json::from_slice(&data.body).unwrap();
                assert_eq!(json["ok"], true);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn respond_is_once_only() {
        let f = fixture().await;
        let compiled = deploy_main(&f, r#"respond(200, "first"); respond(500, "second");"#).await;
        let state = test_state(&f, 5000);

        match f.pool.invoke(compiled, state, None).await {
            InvokeOutcome::Responded(data) => {
                assert_eq!(data.status, 200);
                assert_eq!(data.body, b"first");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn infinite_loop_times_out() {
        let f = fixture().await;
        let compiled = deploy_main(&f, "loop { }").await;
        let state = test_state(&f, 150);

        let started = Instant::now();
        match f.pool.invoke(compiled, state, None).await {
            InvokeOutcome::TimedOut => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));

        // A fresh context serves the next request normally
        let compiled = deploy_main(&f, r#"respond(200, "ok");"#).await;
        let state = test_state(&f, 5000);
        assert!(matches!(
            f.pool.invoke(compiled, state, None).await,
            InvokeOutcome::Responded(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn script_errors_are_structured() {
        let f = fixture().await;
        let compiled = deploy_main(&f, "let x = 1;\nno_such_fn();").await;
        let state = test_state(&f, 5000);

        match f.pool.invoke(compiled, state, None).await {
            InvokeOutcome::Errored(failure) => {
                assert_eq!(failure.class, "FunctionNotFound");
                assert_eq!(failure.line, Some(2));
                assert!(failure.context.unwrap().contains("no_such_fn"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn kv_binding_round_trips_json() {
        let f = fixture().await;
        let compiled = deploy_main(
            &f,
            r#"
            fazt.app.kv.set("cfg", #{retries: 3});
            let back = fazt.app.kv.get("cfg");
            respond(200, back);
            "#,
        )
        .await;
        let state = test_state(&f, 5000);

        match f.pool.invoke(compiled, state, None).await {
            InvokeOutcome::Responded(data) => {
                let json: serde_json::Value = serde_json::from_slice(&data.body).unwrap();
                assert_eq!(json["retries"], 3);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handler_round_trip_stores_and_returns_document() {
        let f = fixture().await;
        let compiled = deploy_main(
            &f,
            r#"
            let doc = fazt.app.ds.insert("items", request.body);
            respond(201, doc);
            "#,
        )
        .await;
        let state = test_state(&f, 5000);

        let request = invoke::request_map(&HandlerRequest {
            method: "POST".into(),
            path: "/api/items".into(),
            query: String::new(),
            headers: vec![("content-type".into(), "application/json".into())],
            body: br#"{"name":"a"}"#.to_vec(),
            remote_addr: "10.0.0.1:1234".into(),
        });

        let id = match f.pool.invoke(compiled, state, Some(request)).await {
            InvokeOutcome::Responded(data) => {
                assert_eq!(data.status, 201);
                let json: serde_json::Value = serde_json::from_slice(&data.body).unwrap();
                assert_eq!(json["name"], "a");
                let id = json["id"].as_str().unwrap().to_string();
                assert_eq!(id.len(), 12);
                id
            }
            other => panic!("unexpected outcome: {other:?}"),
        };

        // The stored document is visible to a later lookup by id
        let storage = AppStorage::new(f.store.clone(), Scope::app("app_000000000001"));
        let found = storage
            .docs()
            .find_one("items", &serde_json::json!({ "id": id }))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found["name"], "a");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn legacy_storage_namespace_rejected() {
        let f = fixture().await;
        let compiled = deploy_main(&f, r#"fazt.storage;"#).await;
        let state = test_state(&f, 5000);

        match f.pool.invoke(compiled, state, None).await {
            InvokeOutcome::Errored(failure) => {
                assert!(failure.message.contains("fazt.app.kv"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn require_auth_maps_to_auth_required() {
        let f = fixture().await;
        let compiled = deploy_main(&f, r#"fazt.auth.require_auth();"#).await;
        let state = test_state(&f, 5000);

        assert!(matches!(
            f.pool.invoke(compiled, state, None).await,
            InvokeOutcome::AuthRequired
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn imports_resolve_embedded_then_app_files() {
        let f = fixture().await;
        f.vfs
            .put(
                "app_000000000001",
                "/lib/helper.rhai",
                br#"fn double(x) { x * 2 }"#.to_vec(),
                "text/plain",
            )
            .await
            .unwrap();
        let compiled = deploy_main(
            &f,
            r#"
            import "uuid" as u;
            import "lib/helper" as h;
            respond(200, #{id_ok: u::is_valid(u::v4()), doubled: h::double(21)});
            "#,
        )
        .await;
        let state = test_state(&f, 5000);

        match f.pool.invoke(compiled, state, None).await {
            InvokeOutcome::Responded(data) => {
                let json: serde_json::Value = serde_json::from_slice(&data.body).unwrap();
                assert_eq!(json["id_ok"], true);
                assert_eq!(json["doubled"], 42);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn compile_cache_hits_until_source_changes() {
        let f = fixture().await;
        let first = deploy_main(&f, r#"respond(200, "v1");"#).await;
        let again = f
            .pool
            .compiled_for("app_000000000001", "api/main.rhai", &f.vfs)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        let second = deploy_main(&f, r#"respond(200, "v2");"#).await;
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
