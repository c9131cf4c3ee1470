//! Handler invocation environment
//!
//! Binds one request, one app, and one optional user into a script context.
//! Scripts see a single `fazt` capability object plus a `request` map and
//! `respond()`; the capability is carried in a thread-local slot that is set
//! for exactly the duration of one evaluation, so nothing a script captures
//! stays usable after the invocation is released.
//!
//! State machine per invocation: Queued -> Running -> (Responded | Errored |
//! TimedOut) -> Released.

use rhai::{Array, Dynamic, Engine, EvalAltResult, Map, Position, Scope, AST};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::auth::User;
use crate::events::{EventBuffer, LogLevel};
use crate::pubsub::{app_channel, SharedRegistry};
use crate::storage::AppStorage;
use crate::types::FaztError;
use crate::vfs::Vfs;
use crate::worker::{JobSpec, WorkerPool};

/// Read-only app identity exposed as `fazt.app`
#[derive(Debug, Clone)]
pub struct AppInfo {
    pub id: String,
    pub name: String,
    pub manifest: serde_json::Value,
}

/// A response produced by `respond()`
#[derive(Debug, Clone)]
pub struct ResponseData {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: String,
}

struct ResponseSlot {
    data: Option<ResponseData>,
    warned: bool,
}

/// Job-side bindings, present only when the invocation runs a worker job
pub struct JobBindings {
    pub job_id: String,
    pub cancelled: Arc<AtomicBool>,
    /// Last persisted checkpoint, available to the script on (re)start
    pub restored: Option<serde_json::Value>,
    /// Persistence hook; receives each new checkpoint
    pub save: Box<dyn Fn(serde_json::Value) + Send + Sync>,
}

/// Everything a script may reach during one invocation
pub struct InvocationState {
    pub app: AppInfo,
    pub env: HashMap<String, String>,
    pub user: Option<User>,
    pub storage: AppStorage,
    pub user_storage: Option<AppStorage>,
    pub registry: SharedRegistry,
    pub events: Arc<EventBuffer>,
    pub vfs: Arc<Vfs>,
    pub workers: Option<Arc<WorkerPool>>,
    /// Caller passed the auth check guarding the private/ tree
    pub private_allowed: bool,
    pub deadline: Instant,
    pub cancelled: Arc<AtomicBool>,
    pub rt: tokio::runtime::Handle,
    pub job: Option<JobBindings>,
    response: Mutex<ResponseSlot>,
}

impl InvocationState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        app: AppInfo,
        env: HashMap<String, String>,
        user: Option<User>,
        storage: AppStorage,
        user_storage: Option<AppStorage>,
        registry: SharedRegistry,
        events: Arc<EventBuffer>,
        vfs: Arc<Vfs>,
        workers: Option<Arc<WorkerPool>>,
        private_allowed: bool,
        deadline: Instant,
        cancelled: Arc<AtomicBool>,
        rt: tokio::runtime::Handle,
        job: Option<JobBindings>,
    ) -> Self {
        Self {
            app,
            env,
            user,
            storage,
            user_storage,
            registry,
            events,
            vfs,
            workers,
            private_allowed,
            deadline,
            cancelled,
            rt,
            job,
            response: Mutex::new(ResponseSlot {
                data: None,
                warned: false,
            }),
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<InvocationState>>> = const { RefCell::new(None) };
}

/// Fetch the invocation bound to this thread, if any
pub fn current() -> Option<Arc<InvocationState>> {
    CURRENT.with(|c| c.borrow().clone())
}

fn state() -> Result<Arc<InvocationState>, Box<EvalAltResult>> {
    current().ok_or_else(|| plain_err("capability revoked: invocation has ended"))
}

fn plain_err(msg: impl Into<String>) -> Box<EvalAltResult> {
    EvalAltResult::ErrorRuntime(Dynamic::from(msg.into()), Position::NONE).into()
}

/// A runtime error carrying a machine-readable code the invoker maps to an
/// HTTP status (auth_required -> 401, forbidden -> 403).
fn coded_err(code: &str, msg: &str) -> Box<EvalAltResult> {
    let mut map = Map::new();
    map.insert("__fazt_code".into(), code.into());
    map.insert("message".into(), msg.into());
    EvalAltResult::ErrorRuntime(Dynamic::from_map(map), Position::NONE).into()
}

fn to_json(value: &Dynamic) -> Result<serde_json::Value, Box<EvalAltResult>> {
    serde_json::to_value(value).map_err(|e| plain_err(format!("unserializable value: {e}")))
}

fn from_json(value: serde_json::Value) -> Dynamic {
    rhai::serde::to_dynamic(value).unwrap_or(Dynamic::UNIT)
}

fn map_storage_err(e: FaztError) -> Box<EvalAltResult> {
    match &e {
        FaztError::Validation(msg) => plain_err(msg.clone()),
        FaztError::StorageBusy(_) => coded_err("storage_busy", &e.to_string()),
        _ => plain_err(e.to_string()),
    }
}

fn pick_storage(
    state: &Arc<InvocationState>,
    user_scope: bool,
) -> Result<AppStorage, Box<EvalAltResult>> {
    if user_scope {
        state
            .user_storage
            .clone()
            .ok_or_else(|| coded_err("auth_required", "not authenticated"))
    } else {
        Ok(state.storage.clone())
    }
}

// ============================================================================
// Capability types exposed to scripts
// ============================================================================

#[derive(Debug, Clone)]
pub struct FaztApi;

#[derive(Debug, Clone)]
struct AppApi;

#[derive(Debug, Clone)]
struct UserScopeApi;

#[derive(Debug, Clone)]
struct LogApi;

#[derive(Debug, Clone)]
struct AuthApi;

#[derive(Debug, Clone)]
struct RealtimeApi;

#[derive(Debug, Clone)]
struct PrivateApi;

#[derive(Debug, Clone)]
struct WorkerApi;

#[derive(Debug, Clone)]
struct KvApi {
    user_scope: bool,
}

#[derive(Debug, Clone)]
struct DsApi {
    user_scope: bool,
}

#[derive(Debug, Clone)]
struct BlobApi {
    user_scope: bool,
}

#[derive(Debug, Clone)]
pub struct JobApi;

/// Register the whole `fazt` API surface on an engine. Done once per pooled
/// context; all per-invocation data flows through the thread-local slot.
pub fn register_api(engine: &mut Engine) {
    engine.register_type_with_name::<FaztApi>("Fazt");
    engine.register_type_with_name::<AppApi>("FaztApp");
    engine.register_type_with_name::<UserScopeApi>("FaztUserScope");
    engine.register_type_with_name::<LogApi>("FaztLog");
    engine.register_type_with_name::<AuthApi>("FaztAuth");
    engine.register_type_with_name::<RealtimeApi>("FaztRealtime");
    engine.register_type_with_name::<PrivateApi>("FaztPrivate");
    engine.register_type_with_name::<WorkerApi>("FaztWorker");
    engine.register_type_with_name::<KvApi>("FaztKv");
    engine.register_type_with_name::<DsApi>("FaztDs");
    engine.register_type_with_name::<BlobApi>("FaztBlob");
    engine.register_type_with_name::<JobApi>("FaztJob");

    // ---- fazt.* ------------------------------------------------------------
    engine.register_get("app", |_: &mut FaztApi| AppApi);
    engine.register_get("log", |_: &mut FaztApi| LogApi);
    engine.register_get("auth", |_: &mut FaztApi| AuthApi);
    engine.register_get("realtime", |_: &mut FaztApi| RealtimeApi);
    engine.register_get("private", |_: &mut FaztApi| PrivateApi);
    engine.register_get("worker", |_: &mut FaztApi| WorkerApi);
    engine.register_get("env", |_: &mut FaztApi| -> Result<Map, Box<EvalAltResult>> {
        let state = state()?;
        let mut map = Map::new();
        for (k, v) in &state.env {
            map.insert(k.as_str().into(), v.clone().into());
        }
        Ok(map)
    });
    // The legacy namespace is rejected, never silently aliased.
    engine.register_get(
        "storage",
        |_: &mut FaztApi| -> Result<Dynamic, Box<EvalAltResult>> {
            Err(plain_err(
                "fazt.storage.* is removed; use fazt.app.kv / fazt.app.ds / fazt.app.s3",
            ))
        },
    );

    // ---- fazt.app ----------------------------------------------------------
    engine.register_get("id", |_: &mut AppApi| -> Result<String, Box<EvalAltResult>> {
        Ok(state()?.app.id.clone())
    });
    engine.register_get(
        "name",
        |_: &mut AppApi| -> Result<String, Box<EvalAltResult>> { Ok(state()?.app.name.clone()) },
    );
    engine.register_get(
        "manifest",
        |_: &mut AppApi| -> Result<Dynamic, Box<EvalAltResult>> {
            Ok(from_json(state()?.app.manifest.clone()))
        },
    );
    engine.register_get("kv", |_: &mut AppApi| KvApi { user_scope: false });
    engine.register_get("ds", |_: &mut AppApi| DsApi { user_scope: false });
    engine.register_get("s3", |_: &mut AppApi| BlobApi { user_scope: false });
    engine.register_get("user", |_: &mut AppApi| UserScopeApi);

    // ---- fazt.app.user.* ---------------------------------------------------
    engine.register_get("kv", |_: &mut UserScopeApi| KvApi { user_scope: true });
    engine.register_get("ds", |_: &mut UserScopeApi| DsApi { user_scope: true });
    engine.register_get("s3", |_: &mut UserScopeApi| BlobApi { user_scope: true });

    register_respond(engine);
    register_log(engine);
    register_auth(engine);
    register_kv(engine);
    register_ds(engine);
    register_blob(engine);
    register_realtime(engine);
    register_private(engine);
    register_worker(engine);
    register_job(engine);
}

fn register_respond(engine: &mut Engine) {
    engine.register_fn("respond", || -> Result<(), Box<EvalAltResult>> {
        do_respond(None, None)
    });
    engine.register_fn(
        "respond",
        |body: Dynamic| -> Result<(), Box<EvalAltResult>> { do_respond(None, Some(body)) },
    );
    engine.register_fn(
        "respond",
        |status: i64, body: Dynamic| -> Result<(), Box<EvalAltResult>> {
            do_respond(Some(status), Some(body))
        },
    );
}

fn do_respond(status: Option<i64>, body: Option<Dynamic>) -> Result<(), Box<EvalAltResult>> {
    let state = state()?;
    let mut slot = state.response.lock().unwrap();
    if slot.data.is_some() {
        // At most once; later calls are no-ops with one warning
        if !slot.warned {
            slot.warned = true;
            state
                .events
                .app_log(&state.app.id, LogLevel::Warn, "respond() called more than once");
        }
        return Ok(());
    }

    let status = match status {
        None => 200,
        Some(s) if (100..=599).contains(&s) => s as u16,
        Some(s) => return Err(plain_err(format!("invalid status code {s}"))),
    };

    let (body, content_type) = match body {
        None => (Vec::new(), "text/plain".to_string()),
        Some(value) if value.is_unit() => (Vec::new(), "text/plain".to_string()),
        Some(value) if value.is_string() => (
            value.into_string().expect("checked string").into_bytes(),
            "text/plain; charset=utf-8".to_string(),
        ),
        Some(value) if value.is::<rhai::Blob>() => (
            value.cast::<rhai::Blob>(),
            "application/octet-stream".to_string(),
        ),
        Some(value) if value.is_map() || value.is_array() => {
            let json = to_json(&value)?;
            (
                serde_json::to_vec(&json).map_err(|e| plain_err(e.to_string()))?,
                "application/json".to_string(),
            )
        }
        Some(value) => (
            value.to_string().into_bytes(),
            "text/plain; charset=utf-8".to_string(),
        ),
    };

    slot.data = Some(ResponseData {
        status,
        body,
        content_type,
    });
    Ok(())
}

fn register_log(engine: &mut Engine) {
    for (name, level) in [
        ("info", LogLevel::Info),
        ("warn", LogLevel::Warn),
        ("error", LogLevel::Error),
        ("debug", LogLevel::Debug),
    ] {
        engine.register_fn(
            name,
            move |_: &mut LogApi, message: Dynamic| -> Result<(), Box<EvalAltResult>> {
                let state = state()?;
                let text = if message.is_string() {
                    message.into_string().expect("checked string")
                } else {
                    serde_json::to_string(&to_json(&message)?).unwrap_or_default()
                };
                state.events.app_log(&state.app.id, level, &text);
                Ok(())
            },
        );
    }
}

fn user_to_map(user: &User) -> Map {
    let mut map = Map::new();
    map.insert("id".into(), user.id.clone().into());
    map.insert("email".into(), user.email.clone().into());
    map.insert("name".into(), user.name.clone().into());
    map.insert("role".into(), user.role.as_str().into());
    map.insert("provider".into(), user.provider.clone().into());
    map
}

fn register_auth(engine: &mut Engine) {
    // Both snake_case (rhai convention) and the camelCase names app authors
    // coming from browser code expect.
    for name in ["get_user", "getUser"] {
        engine.register_fn(
            name,
            |_: &mut AuthApi| -> Result<Dynamic, Box<EvalAltResult>> {
                let state = state()?;
                Ok(match &state.user {
                    Some(user) => Dynamic::from_map(user_to_map(user)),
                    None => Dynamic::UNIT,
                })
            },
        );
    }
    for name in ["require_auth", "requireAuth"] {
        engine.register_fn(
            name,
            |_: &mut AuthApi| -> Result<Map, Box<EvalAltResult>> {
                let state = state()?;
                match &state.user {
                    Some(user) => Ok(user_to_map(user)),
                    None => Err(coded_err("auth_required", "authentication required")),
                }
            },
        );
    }
    for name in ["require_role", "requireRole"] {
        engine.register_fn(
            name,
            |_: &mut AuthApi, role: &str| -> Result<Map, Box<EvalAltResult>> {
                let state = state()?;
                let required = crate::auth::Role::parse(role)
                    .map_err(|e| plain_err(e.to_string()))?;
                match &state.user {
                    None => Err(coded_err("auth_required", "authentication required")),
                    Some(user) if user.role.at_least(required) => Ok(user_to_map(user)),
                    Some(_) => Err(coded_err(
                        "forbidden",
                        &format!("role {role} required"),
                    )),
                }
            },
        );
    }
}

fn register_kv(engine: &mut Engine) {
    engine.register_fn(
        "set",
        |kv: &mut KvApi, key: &str, value: Dynamic| -> Result<(), Box<EvalAltResult>> {
            kv_set(kv, key, value, None)
        },
    );
    engine.register_fn(
        "set",
        |kv: &mut KvApi, key: &str, value: Dynamic, ttl_ms: i64| -> Result<(), Box<EvalAltResult>> {
            if ttl_ms < 0 {
                return Err(plain_err("ttl_ms must be non-negative"));
            }
            kv_set(kv, key, value, Some(ttl_ms as u64))
        },
    );
    engine.register_fn(
        "get",
        |kv: &mut KvApi, key: &str| -> Result<Dynamic, Box<EvalAltResult>> {
            let state = state()?;
            let storage = pick_storage(&state, kv.user_scope)?;
            let key = key.to_string();
            let bytes = state
                .rt
                .block_on(async move { storage.kv().get(&key).await })
                .map_err(map_storage_err)?;
            Ok(match bytes {
                Some(bytes) => match serde_json::from_slice::<serde_json::Value>(&bytes) {
                    Ok(json) => from_json(json),
                    Err(_) => Dynamic::from(String::from_utf8_lossy(&bytes).into_owned()),
                },
                None => Dynamic::UNIT,
            })
        },
    );
    engine.register_fn(
        "delete",
        |kv: &mut KvApi, key: &str| -> Result<(), Box<EvalAltResult>> {
            let state = state()?;
            let storage = pick_storage(&state, kv.user_scope)?;
            let key = key.to_string();
            state
                .rt
                .block_on(async move { storage.kv().delete(&key).await })
                .map_err(map_storage_err)
        },
    );
    engine.register_fn(
        "list",
        |kv: &mut KvApi, prefix: &str| -> Result<Array, Box<EvalAltResult>> {
            let state = state()?;
            let storage = pick_storage(&state, kv.user_scope)?;
            let prefix = prefix.to_string();
            let keys = state
                .rt
                .block_on(async move { storage.kv().list(&prefix).await })
                .map_err(map_storage_err)?;
            Ok(keys.into_iter().map(Dynamic::from).collect())
        },
    );
}

fn kv_set(
    kv: &KvApi,
    key: &str,
    value: Dynamic,
    ttl_ms: Option<u64>,
) -> Result<(), Box<EvalAltResult>> {
    let state = state()?;
    let storage = pick_storage(&state, kv.user_scope)?;
    let json = to_json(&value)?;
    let bytes = serde_json::to_vec(&json).map_err(|e| plain_err(e.to_string()))?;
    let key = key.to_string();
    state
        .rt
        .block_on(async move { storage.kv().set(&key, bytes, ttl_ms).await })
        .map_err(map_storage_err)
}

fn register_ds(engine: &mut Engine) {
    engine.register_fn(
        "insert",
        |ds: &mut DsApi, collection: &str, doc: Map| -> Result<Dynamic, Box<EvalAltResult>> {
            let state = state()?;
            let storage = pick_storage(&state, ds.user_scope)?;
            let doc_json = to_json(&Dynamic::from_map(doc))?;
            let collection = collection.to_string();
            let inserted = state
                .rt
                .block_on(async move { storage.docs().insert(&collection, doc_json).await })
                .map_err(map_storage_err)?;
            Ok(from_json(inserted))
        },
    );
    engine.register_fn(
        "find",
        |ds: &mut DsApi, collection: &str, query: Map| -> Result<Array, Box<EvalAltResult>> {
            let state = state()?;
            let storage = pick_storage(&state, ds.user_scope)?;
            let query = to_json(&Dynamic::from_map(query))?;
            let collection = collection.to_string();
            let docs = state
                .rt
                .block_on(async move { storage.docs().find(&collection, &query).await })
                .map_err(map_storage_err)?;
            Ok(docs.into_iter().map(from_json).collect())
        },
    );
    engine.register_fn(
        "find_one",
        |ds: &mut DsApi, collection: &str, query: Map| -> Result<Dynamic, Box<EvalAltResult>> {
            let state = state()?;
            let storage = pick_storage(&state, ds.user_scope)?;
            let query = to_json(&Dynamic::from_map(query))?;
            let collection = collection.to_string();
            let doc = state
                .rt
                .block_on(async move { storage.docs().find_one(&collection, &query).await })
                .map_err(map_storage_err)?;
            Ok(doc.map(from_json).unwrap_or(Dynamic::UNIT))
        },
    );
    engine.register_fn(
        "update",
        |ds: &mut DsApi,
         collection: &str,
         query: Map,
         patch: Map|
         -> Result<i64, Box<EvalAltResult>> {
            let state = state()?;
            let storage = pick_storage(&state, ds.user_scope)?;
            let query = to_json(&Dynamic::from_map(query))?;
            let patch = to_json(&Dynamic::from_map(patch))?;
            let collection = collection.to_string();
            let n = state
                .rt
                .block_on(async move { storage.docs().update(&collection, &query, &patch).await })
                .map_err(map_storage_err)?;
            Ok(n as i64)
        },
    );
    engine.register_fn(
        "delete",
        |ds: &mut DsApi, collection: &str, query: Map| -> Result<i64, Box<EvalAltResult>> {
            let state = state()?;
            let storage = pick_storage(&state, ds.user_scope)?;
            let query = to_json(&Dynamic::from_map(query))?;
            let collection = collection.to_string();
            let n = state
                .rt
                .block_on(async move { storage.docs().delete(&collection, &query).await })
                .map_err(map_storage_err)?;
            Ok(n as i64)
        },
    );
}

fn register_blob(engine: &mut Engine) {
    engine.register_fn(
        "put",
        |s3: &mut BlobApi, path: &str, data: Dynamic, mime: &str| -> Result<String, Box<EvalAltResult>> {
            let state = state()?;
            let storage = pick_storage(&state, s3.user_scope)?;
            let bytes = if data.is::<rhai::Blob>() {
                data.cast::<rhai::Blob>()
            } else if data.is_string() {
                data.into_string().expect("checked string").into_bytes()
            } else {
                return Err(plain_err(format!(
                    "blob data: got {}, expected string or blob",
                    data.type_name()
                )));
            };
            let path = path.to_string();
            let mime = mime.to_string();
            state
                .rt
                .block_on(async move { storage.blobs().put(&path, bytes, &mime).await })
                .map_err(map_storage_err)
        },
    );
    engine.register_fn(
        "get",
        |s3: &mut BlobApi, path: &str| -> Result<Dynamic, Box<EvalAltResult>> {
            let state = state()?;
            let storage = pick_storage(&state, s3.user_scope)?;
            let path = path.to_string();
            let found = state
                .rt
                .block_on(async move { storage.blobs().get(&path).await })
                .map_err(map_storage_err)?;
            Ok(match found {
                Some((data, mime)) => {
                    let mut map = Map::new();
                    map.insert("data".into(), Dynamic::from_blob(data));
                    map.insert("mime".into(), mime.into());
                    Dynamic::from_map(map)
                }
                None => Dynamic::UNIT,
            })
        },
    );
    engine.register_fn(
        "delete",
        |s3: &mut BlobApi, path: &str| -> Result<(), Box<EvalAltResult>> {
            let state = state()?;
            let storage = pick_storage(&state, s3.user_scope)?;
            let path = path.to_string();
            state
                .rt
                .block_on(async move { storage.blobs().delete(&path).await })
                .map_err(map_storage_err)
        },
    );
    engine.register_fn(
        "list",
        |s3: &mut BlobApi, prefix: &str| -> Result<Array, Box<EvalAltResult>> {
            let state = state()?;
            let storage = pick_storage(&state, s3.user_scope)?;
            let prefix = prefix.to_string();
            let metas = state
                .rt
                .block_on(async move { storage.blobs().list(&prefix).await })
                .map_err(map_storage_err)?;
            Ok(metas
                .into_iter()
                .map(|meta| {
                    let mut map = Map::new();
                    map.insert("path".into(), meta.path.into());
                    map.insert("mime".into(), meta.mime_type.into());
                    map.insert("size".into(), (meta.size as i64).into());
                    map.insert("sha256".into(), meta.sha256.into());
                    Dynamic::from_map(map)
                })
                .collect())
        },
    );
}

fn register_realtime(engine: &mut Engine) {
    engine.register_fn(
        "broadcast",
        |_: &mut RealtimeApi, channel: &str, payload: Dynamic| -> Result<i64, Box<EvalAltResult>> {
            let state = state()?;
            let payload = to_json(&payload)?;
            let full = app_channel(&state.app.id, channel);
            Ok(state.registry.broadcast(&full, payload) as i64)
        },
    );
    for name in ["broadcast_all", "broadcastAll"] {
        engine.register_fn(
            name,
            |_: &mut RealtimeApi, payload: Dynamic| -> Result<i64, Box<EvalAltResult>> {
                let state = state()?;
                let payload = to_json(&payload)?;
                Ok(state.registry.broadcast_all(&state.app.id, payload) as i64)
            },
        );
    }
    engine.register_fn(
        "subscribers",
        |_: &mut RealtimeApi, channel: &str| -> Result<i64, Box<EvalAltResult>> {
            let state = state()?;
            let full = app_channel(&state.app.id, channel);
            Ok(state.registry.subscribers(&full) as i64)
        },
    );
    engine.register_fn(
        "count",
        |_: &mut RealtimeApi| -> Result<i64, Box<EvalAltResult>> {
            let state = state()?;
            Ok(state.registry.count(Some(&state.app.id)) as i64)
        },
    );
    engine.register_fn(
        "kick",
        |_: &mut RealtimeApi, client_id: i64| -> Result<(), Box<EvalAltResult>> {
            let state = state()?;
            state.registry.kick(client_id as u64);
            Ok(())
        },
    );
}

fn private_file(path: &str) -> Result<String, Box<EvalAltResult>> {
    crate::vfs::canonical_path(path)
        .map(|p| format!("/private{p}"))
        .map_err(|e| plain_err(e.to_string()))
}

fn register_private(engine: &mut Engine) {
    fn require_private(state: &Arc<InvocationState>) -> Result<(), Box<EvalAltResult>> {
        if state.private_allowed {
            Ok(())
        } else {
            Err(coded_err("auth_required", "private files require authentication"))
        }
    }

    engine.register_fn(
        "read",
        |_: &mut PrivateApi, path: &str| -> Result<String, Box<EvalAltResult>> {
            let state = state()?;
            require_private(&state)?;
            let full = private_file(path)?;
            let app_id = state.app.id.clone();
            let vfs = Arc::clone(&state.vfs);
            let file = state
                .rt
                .block_on(async move { vfs.get(&app_id, &full).await })
                .map_err(|e| plain_err(e.to_string()))?
                .ok_or_else(|| plain_err(format!("private file not found: {path}")))?;
            String::from_utf8(file.bytes.to_vec())
                .map_err(|_| plain_err("private file is not valid UTF-8"))
        },
    );
    for name in ["read_json", "readJSON"] {
        engine.register_fn(
            name,
            |_: &mut PrivateApi, path: &str| -> Result<Dynamic, Box<EvalAltResult>> {
                let state = state()?;
                require_private(&state)?;
                let full = private_file(path)?;
                let app_id = state.app.id.clone();
                let vfs = Arc::clone(&state.vfs);
                let file = state
                    .rt
                    .block_on(async move { vfs.get(&app_id, &full).await })
                    .map_err(|e| plain_err(e.to_string()))?
                    .ok_or_else(|| plain_err(format!("private file not found: {path}")))?;
                let json: serde_json::Value = serde_json::from_slice(&file.bytes)
                    .map_err(|e| plain_err(format!("invalid JSON in {path}: {e}")))?;
                Ok(from_json(json))
            },
        );
    }
    engine.register_fn(
        "exists",
        |_: &mut PrivateApi, path: &str| -> Result<bool, Box<EvalAltResult>> {
            let state = state()?;
            require_private(&state)?;
            let full = private_file(path)?;
            let app_id = state.app.id.clone();
            let vfs = Arc::clone(&state.vfs);
            let found = state
                .rt
                .block_on(async move { vfs.get(&app_id, &full).await })
                .map_err(|e| plain_err(e.to_string()))?;
            Ok(found.is_some())
        },
    );
    engine.register_fn(
        "list",
        |_: &mut PrivateApi, prefix: &str| -> Result<Array, Box<EvalAltResult>> {
            let state = state()?;
            require_private(&state)?;
            let full = private_file(prefix)?;
            let app_id = state.app.id.clone();
            let vfs = Arc::clone(&state.vfs);
            let metas = state
                .rt
                .block_on(async move { vfs.list(&app_id, &full).await })
                .map_err(|e| plain_err(e.to_string()))?;
            Ok(metas
                .into_iter()
                .filter_map(|m| m.path.strip_prefix("/private").map(str::to_string))
                .map(Dynamic::from)
                .collect())
        },
    );
}

fn job_info_to_map(info: crate::worker::JobInfo) -> Dynamic {
    from_json(serde_json::to_value(info).unwrap_or(serde_json::Value::Null))
}

fn register_worker(engine: &mut Engine) {
    engine.register_fn(
        "spawn",
        |_: &mut WorkerApi, opts: Map| -> Result<Dynamic, Box<EvalAltResult>> {
            let state = state()?;
            let workers = state
                .workers
                .clone()
                .ok_or_else(|| plain_err("worker pool unavailable in this context"))?;
            let spec = JobSpec::from_options(&to_json(&Dynamic::from_map(opts))?)
                .map_err(|e| plain_err(e.to_string()))?;
            let app_id = state.app.id.clone();
            let info = state
                .rt
                .block_on(async move { workers.spawn(&app_id, spec).await })
                .map_err(|e| plain_err(e.to_string()))?;
            Ok(job_info_to_map(info))
        },
    );
    engine.register_fn(
        "get",
        |_: &mut WorkerApi, job_id: &str| -> Result<Dynamic, Box<EvalAltResult>> {
            let state = state()?;
            let workers = state
                .workers
                .clone()
                .ok_or_else(|| plain_err("worker pool unavailable in this context"))?;
            let app_id = state.app.id.clone();
            let job_id = job_id.to_string();
            let info = state
                .rt
                .block_on(async move { workers.get(&app_id, &job_id).await })
                .map_err(|e| plain_err(e.to_string()))?;
            Ok(info.map(job_info_to_map).unwrap_or(Dynamic::UNIT))
        },
    );
    engine.register_fn(
        "list",
        |_: &mut WorkerApi| -> Result<Array, Box<EvalAltResult>> {
            let state = state()?;
            let workers = state
                .workers
                .clone()
                .ok_or_else(|| plain_err("worker pool unavailable in this context"))?;
            let app_id = state.app.id.clone();
            let infos = state
                .rt
                .block_on(async move { workers.list(&app_id).await })
                .map_err(|e| plain_err(e.to_string()))?;
            Ok(infos.into_iter().map(job_info_to_map).collect())
        },
    );
    engine.register_fn(
        "cancel",
        |_: &mut WorkerApi, job_id: &str| -> Result<bool, Box<EvalAltResult>> {
            let state = state()?;
            let workers = state
                .workers
                .clone()
                .ok_or_else(|| plain_err("worker pool unavailable in this context"))?;
            let app_id = state.app.id.clone();
            let job_id = job_id.to_string();
            state
                .rt
                .block_on(async move { workers.cancel(&app_id, &job_id).await })
                .map_err(|e| plain_err(e.to_string()))
        },
    );
}

fn register_job(engine: &mut Engine) {
    engine.register_get("id", |_: &mut JobApi| -> Result<String, Box<EvalAltResult>> {
        let state = state()?;
        let job = state.job.as_ref().ok_or_else(|| plain_err("not a job"))?;
        Ok(job.job_id.clone())
    });
    engine.register_get(
        "cancelled",
        |_: &mut JobApi| -> Result<bool, Box<EvalAltResult>> {
            let state = state()?;
            let job = state.job.as_ref().ok_or_else(|| plain_err("not a job"))?;
            Ok(job.cancelled.load(Ordering::Relaxed))
        },
    );
    // Read the checkpoint restored at (re)start
    engine.register_fn(
        "checkpoint",
        |_: &mut JobApi| -> Result<Dynamic, Box<EvalAltResult>> {
            let state = state()?;
            let job = state.job.as_ref().ok_or_else(|| plain_err("not a job"))?;
            Ok(job
                .restored
                .clone()
                .map(from_json)
                .unwrap_or(Dynamic::UNIT))
        },
    );
    // Persist a new checkpoint
    engine.register_fn(
        "checkpoint",
        |_: &mut JobApi, data: Dynamic| -> Result<(), Box<EvalAltResult>> {
            let state = state()?;
            let job = state.job.as_ref().ok_or_else(|| plain_err("not a job"))?;
            let json = to_json(&data)?;
            (job.save)(json);
            Ok(())
        },
    );
}

// ============================================================================
// Request binding and evaluation
// ============================================================================

/// Plain request data extracted before evaluation
#[derive(Debug, Clone)]
pub struct HandlerRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    /// Lowercased header names
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub remote_addr: String,
}

/// Build the `request` map bound into the scope
pub fn request_map(req: &HandlerRequest) -> Map {
    let mut map = Map::new();
    map.insert("method".into(), req.method.clone().into());
    map.insert("path".into(), req.path.clone().into());
    map.insert("remote_addr".into(), req.remote_addr.clone().into());

    let mut query = Map::new();
    if let Ok(pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(&req.query) {
        for (k, v) in pairs {
            query.insert(k.into(), v.into());
        }
    }
    map.insert("query".into(), Dynamic::from_map(query));

    let mut headers = Map::new();
    let mut content_type = String::new();
    for (name, value) in &req.headers {
        if name == "content-type" {
            content_type = value.clone();
        }
        headers.insert(name.as_str().into(), value.clone().into());
    }
    map.insert("headers".into(), Dynamic::from_map(headers));

    let body: Dynamic = if req.body.is_empty() {
        Dynamic::UNIT
    } else if content_type.contains("json") {
        match serde_json::from_slice::<serde_json::Value>(&req.body) {
            Ok(json) => from_json(json),
            Err(_) => Dynamic::from(String::from_utf8_lossy(&req.body).into_owned()),
        }
    } else {
        match String::from_utf8(req.body.clone()) {
            Ok(text) => Dynamic::from(text),
            Err(_) => Dynamic::from_blob(req.body.clone()),
        }
    };
    map.insert("body".into(), body);

    map
}

/// How one invocation ended
#[derive(Debug)]
pub enum InvokeOutcome {
    /// respond() was called
    Responded(ResponseData),
    /// Script finished without responding
    NoResponse,
    /// CPU-time deadline fired
    TimedOut,
    /// Cancelled by the caller (client disconnect, job cancel)
    Cancelled,
    /// A capability raised auth_required
    AuthRequired,
    /// A capability raised forbidden
    Forbidden(String),
    /// The script threw; detail goes to the log, sanitized message to wire
    Errored(ScriptFailure),
}

/// Structured script error detail for the activity log
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScriptFailure {
    pub class: String,
    pub message: String,
    pub line: Option<usize>,
    pub context: Option<String>,
}

/// Progress-token values used to terminate evaluation
pub const TERM_TIMEOUT: &str = "timeout";
pub const TERM_CANCELLED: &str = "cancelled";

/// Evaluate a compiled handler with the given state bound. Runs on the
/// calling (blocking) thread; the caller is responsible for being off the
/// async reactor.
pub fn run_handler(
    engine: &Engine,
    ast: &AST,
    source: &str,
    state: Arc<InvocationState>,
    request: Option<Map>,
) -> InvokeOutcome {
    let mut scope = Scope::new();
    scope.push("fazt", FaztApi);
    if let Some(request) = request {
        scope.push_dynamic("request", Dynamic::from_map(request));
    }
    if state.job.is_some() {
        scope.push("job", JobApi);
    }

    CURRENT.with(|c| *c.borrow_mut() = Some(Arc::clone(&state)));
    let result = engine.run_ast_with_scope(&mut scope, ast);
    CURRENT.with(|c| *c.borrow_mut() = None);

    let response = state.response.lock().unwrap().data.take();

    match result {
        Ok(()) => match response {
            Some(data) => InvokeOutcome::Responded(data),
            None => InvokeOutcome::NoResponse,
        },
        Err(err) => interpret_error(*err, source, response),
    }
}

fn interpret_error(
    err: EvalAltResult,
    source: &str,
    response: Option<ResponseData>,
) -> InvokeOutcome {
    match err {
        // Errors raised inside function calls or modules carry the real
        // cause one level down
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _)
        | EvalAltResult::ErrorInModule(_, inner, _) => {
            interpret_error(*inner, source, response)
        }
        EvalAltResult::ErrorTerminated(token, _) => {
            let token = token.to_string();
            if token == TERM_CANCELLED {
                InvokeOutcome::Cancelled
            } else {
                InvokeOutcome::TimedOut
            }
        }
        EvalAltResult::ErrorRuntime(value, pos) => {
            if let Some(map) = value.read_lock::<Map>() {
                if let Some(code) = map.get("__fazt_code").map(|c| c.to_string()) {
                    let message = map
                        .get("message")
                        .map(|m| m.to_string())
                        .unwrap_or_default();
                    return match code.as_str() {
                        "auth_required" => InvokeOutcome::AuthRequired,
                        "forbidden" => InvokeOutcome::Forbidden(message),
                        _ => InvokeOutcome::Errored(failure("RuntimeError", &message, pos, source)),
                    };
                }
            }
            // respond() may have succeeded before a later statement threw;
            // the response already written wins over the error.
            if let Some(data) = response {
                return InvokeOutcome::Responded(data);
            }
            InvokeOutcome::Errored(failure("RuntimeError", &value.to_string(), pos, source))
        }
        other => {
            if let Some(data) = response {
                return InvokeOutcome::Responded(data);
            }
            let pos = other.position();
            let class = error_class(&other);
            InvokeOutcome::Errored(failure(class, &other.to_string(), pos, source))
        }
    }
}

fn error_class(err: &EvalAltResult) -> &'static str {
    match err {
        EvalAltResult::ErrorFunctionNotFound(..) => "FunctionNotFound",
        EvalAltResult::ErrorVariableNotFound(..) => "VariableNotFound",
        EvalAltResult::ErrorModuleNotFound(..) => "ModuleNotFound",
        EvalAltResult::ErrorIndexNotFound(..) => "IndexNotFound",
        EvalAltResult::ErrorPropertyNotFound(..) => "PropertyNotFound",
        EvalAltResult::ErrorMismatchDataType(..) | EvalAltResult::ErrorMismatchOutputType(..) => {
            "TypeMismatch"
        }
        EvalAltResult::ErrorArithmetic(..) => "Arithmetic",
        EvalAltResult::ErrorTooManyOperations(..) => "OperationLimit",
        EvalAltResult::ErrorDataTooLarge(..) => "MemoryLimit",
        EvalAltResult::ErrorStackOverflow(..) => "StackOverflow",
        _ => "ScriptError",
    }
}

fn failure(class: &str, message: &str, pos: Position, source: &str) -> ScriptFailure {
    let line = pos.line();
    let context = line.map(|line| {
        let lines: Vec<&str> = source.lines().collect();
        let start = line.saturating_sub(2).min(lines.len());
        let end = (line + 1).min(lines.len()).max(start);
        lines[start..end]
            .iter()
            .enumerate()
            .map(|(i, l)| format!("{:>4} | {l}", start + i + 1))
            .collect::<Vec<_>>()
            .join("\n")
    });
    ScriptFailure {
        class: class.to_string(),
        message: message.to_string(),
        line,
        context,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_map_parses_query_and_json_body() {
        let req = HandlerRequest {
            method: "POST".into(),
            path: "/api/items".into(),
            query: "a=1&b=two".into(),
            headers: vec![("content-type".into(), "application/json".into())],
            body: br#"{"name":"a"}"#.to_vec(),
            remote_addr: "10.0.0.1:5000".into(),
        };
        let map = request_map(&req);
        assert_eq!(map.get("method").unwrap().to_string(), "POST");

        let query = map.get("query").unwrap().read_lock::<Map>().unwrap();
        assert_eq!(query.get("b").unwrap().to_string(), "two");
        drop(query);

        let body = map.get("body").unwrap().read_lock::<Map>().unwrap();
        assert_eq!(body.get("name").unwrap().to_string(), "a");
    }

    #[test]
    fn request_map_falls_back_to_text_body() {
        let req = HandlerRequest {
            method: "POST".into(),
            path: "/api/raw".into(),
            query: String::new(),
            headers: vec![("content-type".into(), "text/plain".into())],
            body: b"plain".to_vec(),
            remote_addr: "10.0.0.1:5000".into(),
        };
        let map = request_map(&req);
        assert_eq!(map.get("body").unwrap().to_string(), "plain");
    }

    #[test]
    fn failure_extracts_source_context() {
        let source = "let a = 1;\nlet b = 2;\nboom();\nlet c = 3;";
        let f = failure("ScriptError", "boom", Position::new(3, 1), source);
        assert_eq!(f.line, Some(3));
        let ctx = f.context.unwrap();
        assert!(ctx.contains("boom()"));
        assert!(ctx.contains("   3 |"));
    }
}
