//! HTTP entry point
//!
//! Owns the shared application state and routes every request: host
//! canonicalization and alias resolution first, then the per-alias action
//! (redirect, reserved, split-then-proxy, proxy). Proxied requests fan out
//! to the VFS for static paths and to the handler invoker for /api/*.
//! Security headers are applied to every response on the way out.

use bytes::Bytes;
use http_body_util::{BodyExt, Limited};
use hyper::body::Incoming;
use hyper::{Method, Request, StatusCode};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::alias::{AliasMap, HostRoute, VARIANT_COOKIE};
use crate::apps::App;
use crate::auth::providers::ProviderRegistry;
use crate::auth::{cookie_value, Auth, Role, User, SESSION_COOKIE};
use crate::config::{Args, HANDLER_PREFIX};
use crate::edge::{EdgeLimiter, TlsFront};
use crate::events::{ActivityRecord, EventBuffer};
use crate::pubsub::SharedRegistry;
use crate::routes::{self, HttpResponse};
use crate::script::{self, AppInfo, HandlerRequest, InvocationState, InvokeOutcome, ScriptPool};
use crate::storage::{AppStorage, Scope};
use crate::store::Store;
use crate::types::{FaztError, Result};
use crate::vfs::Vfs;
use crate::worker::WorkerPool;

/// Largest request body the edge accepts
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub store: Store,
    pub vfs: Arc<Vfs>,
    pub aliases: AliasMap,
    pub scripts: Arc<ScriptPool>,
    pub workers: Arc<WorkerPool>,
    pub registry: SharedRegistry,
    pub events: Arc<EventBuffer>,
    pub auth: Arc<Auth>,
    pub providers: ProviderRegistry,
    pub rate_limiter: EdgeLimiter,
    pub tls: Option<Arc<TlsFront>>,
    pub started_at: Instant,
}

impl AppState {
    /// Session user from the request's cookie, if any
    pub async fn session_user(&self, req_headers: &hyper::HeaderMap) -> Option<User> {
        let cookie_header = req_headers.get("cookie")?.to_str().ok()?;
        let token = cookie_value(cookie_header, SESSION_COOKIE)?;
        self.auth.user_for_token(&token).await.ok().flatten()
    }
}

/// Route one request end to end
pub async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
    over_tls: bool,
) -> HttpResponse {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let host = req
        .headers()
        .get("host")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();

    debug!(%addr, %method, %path, %host, "request");

    // Per-IP token bucket ahead of any routing work
    if !state.rate_limiter.check(addr.ip()) {
        return finish(
            routes::error_response(&FaztError::RateLimited),
            &state,
            over_tls,
            None,
        );
    }

    let variant_cookie = req
        .headers()
        .get("cookie")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| cookie_value(h, VARIANT_COOKIE));

    let route = match state.aliases.resolve(&host, variant_cookie.as_deref()).await {
        Ok(route) => route,
        Err(e) => {
            warn!("alias resolution failed: {e}");
            return finish(routes::error_response(&e), &state, over_tls, None);
        }
    };

    let (response, set_variant) = match route {
        HostRoute::ControlPlane => (
            routes::admin::handle(Arc::clone(&state), addr, req, over_tls).await,
            None,
        ),
        HostRoute::Redirect { url, code } => {
            let status = if code == 301 {
                StatusCode::MOVED_PERMANENTLY
            } else {
                StatusCode::FOUND
            };
            (routes::redirect_response(status, &url), None)
        }
        HostRoute::NotFound => {
            let resp = state
                .vfs
                .not_found(state.args.universal_404_app.as_deref())
                .await
                .unwrap_or_else(|_| routes::not_found_response());
            (resp, None)
        }
        HostRoute::App {
            app_id,
            set_variant,
        } => (
            handle_app_request(Arc::clone(&state), addr, req, &app_id, over_tls).await,
            set_variant,
        ),
    };

    finish(response, &state, over_tls, set_variant)
}

/// Apply outbound policy: split stickiness cookie and security headers
fn finish(
    mut response: HttpResponse,
    state: &Arc<AppState>,
    over_tls: bool,
    set_variant: Option<String>,
) -> HttpResponse {
    if let Some(app_id) = set_variant {
        // Long-lived per-app stickiness cookie
        let cookie = format!(
            "{VARIANT_COOKIE}={app_id}; Path=/; Max-Age=31536000; SameSite=Lax{}",
            if over_tls { "; Secure" } else { "" }
        );
        if let Ok(value) = cookie.parse() {
            response.headers_mut().append("Set-Cookie", value);
        }
    }
    routes::apply_security_headers(&mut response, &state.args.domain, over_tls);
    response
}

/// Tenant-edge dispatch for one resolved app
async fn handle_app_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
    app_id: &str,
    over_tls: bool,
) -> HttpResponse {
    let Some(app) = crate::apps::get(&state.store, app_id).await.ok().flatten() else {
        return state
            .vfs
            .not_found(state.args.universal_404_app.as_deref())
            .await
            .unwrap_or_else(|_| routes::not_found_response());
    };

    let path = req.uri().path().to_string();

    // Realtime transport
    if path == "/_ws" {
        return super::websocket::handle_upgrade(state, req, &app.id).await;
    }

    // Auth routes consume the request
    if path.starts_with("/auth/") || path == "/auth" {
        return routes::edge::handle_auth(state, addr, req, over_tls).await;
    }

    // Agent endpoints for tooling; owner or admin only
    if path.starts_with("/_fazt/") || path == "/_fazt" {
        return routes::edge::handle_agent(state, req, &app).await;
    }

    // Private file tree requires a session
    if path.starts_with("/private/") {
        return routes::edge::handle_private(state, req, &app).await;
    }

    // Handler entry: /api/* when the app declares a main script that exists
    if path.starts_with(HANDLER_PREFIX) && is_handler_method(req.method()) {
        return invoke_handler(state, addr, req, &app).await;
    }

    // Everything else is static
    let if_none_match = req
        .headers()
        .get("if-none-match")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    match state
        .vfs
        .serve(
            &app.id,
            &path,
            app.manifest_parsed.spa,
            if_none_match.as_deref(),
            state.args.universal_404_app.as_deref(),
        )
        .await
    {
        Ok(resp) => resp,
        Err(e) => routes::error_response(&e),
    }
}

fn is_handler_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::POST | Method::PUT | Method::DELETE | Method::PATCH
    )
}

/// Read a request body with the edge size cap applied
pub async fn read_body(req: Request<Incoming>) -> Result<(hyper::http::request::Parts, Bytes)> {
    let (parts, body) = req.into_parts();
    let bytes = Limited::new(body, MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|_| FaztError::Validation("request body too large or unreadable".into()))?
        .to_bytes();
    Ok((parts, bytes))
}

/// Binds request, capability surface, and user identity into a script
/// context for one call, then maps the outcome onto the wire.
async fn invoke_handler(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
    app: &App,
) -> HttpResponse {
    let user = state.session_user(req.headers()).await;

    let compiled = match state
        .scripts
        .compiled_for(&app.id, &app.manifest_parsed.main, &state.vfs)
        .await
    {
        Ok(compiled) => compiled,
        Err(FaztError::NotFound(_)) => {
            // No handler deployed: fall back to static 404 semantics
            return state
                .vfs
                .not_found(state.args.universal_404_app.as_deref())
                .await
                .unwrap_or_else(|_| routes::not_found_response());
        }
        Err(e) => {
            state.events.record(
                ActivityRecord::system("script.compile_error", "app", &app.id)
                    .with_result(crate::events::ActionResult::Failure)
                    .with_weight(4)
                    .with_detail(serde_json::json!({ "error": e.to_string() })),
            );
            return routes::error_response(&FaztError::Script("compile failed".into()));
        }
    };

    let (parts, body) = match read_body(req).await {
        Ok(ok) => ok,
        Err(e) => return routes::error_response(&e),
    };

    let handler_request = HandlerRequest {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().unwrap_or("").to_string(),
        headers: parts
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_lowercase(), v.to_string()))
            })
            .collect(),
        body: body.to_vec(),
        remote_addr: addr.to_string(),
    };

    let cancelled = Arc::new(AtomicBool::new(false));
    let deadline =
        Instant::now() + std::time::Duration::from_millis(state.args.script_timeout_ms);

    let invocation = Arc::new(InvocationState::new(
        AppInfo {
            id: app.id.clone(),
            name: app.name.clone(),
            manifest: app.manifest.clone(),
        },
        crate::config::curated_env(),
        user.clone(),
        AppStorage::new(state.store.clone(), Scope::app(&app.id)),
        user.as_ref()
            .map(|u| AppStorage::new(state.store.clone(), Scope::user(&app.id, &u.id))),
        Arc::clone(&state.registry),
        Arc::clone(&state.events),
        Arc::clone(&state.vfs),
        Some(Arc::clone(&state.workers)),
        user.is_some(),
        deadline,
        Arc::clone(&cancelled),
        tokio::runtime::Handle::current(),
        None,
    ));

    // Client disconnect drops this future; the guard interrupts the script
    // at its next progress tick.
    let mut cancel_guard = CancelOnDrop {
        flag: Arc::clone(&cancelled),
        armed: true,
    };

    let outcome = state
        .scripts
        .invoke(compiled, invocation, Some(script::invoke::request_map(&handler_request)))
        .await;

    cancel_guard.armed = false;

    match outcome {
        InvokeOutcome::Responded(data) => {
            let status =
                StatusCode::from_u16(data.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            hyper::Response::builder()
                .status(status)
                .header("Content-Type", data.content_type)
                .body(http_body_util::Full::new(Bytes::from(data.body)))
                .unwrap()
        }
        InvokeOutcome::NoResponse => hyper::Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(http_body_util::Full::new(Bytes::new()))
            .unwrap(),
        InvokeOutcome::TimedOut => {
            warn!(app_id = %app.id, "handler hit the CPU-time cap");
            routes::error_response(&FaztError::ScriptTimeout(state.args.script_timeout_ms))
        }
        InvokeOutcome::Cancelled => routes::error_response(&FaztError::Script(
            "invocation cancelled".into(),
        )),
        InvokeOutcome::AuthRequired => routes::error_response(&FaztError::AuthRequired),
        InvokeOutcome::Forbidden(message) => {
            routes::error_response(&FaztError::Forbidden(message))
        }
        InvokeOutcome::Errored(failure) => {
            state.events.record(
                ActivityRecord::system("script.error", "app", &app.id)
                    .with_result(crate::events::ActionResult::Failure)
                    .with_weight(4)
                    .with_detail(serde_json::to_value(&failure).unwrap_or_default()),
            );
            routes::error_response(&FaztError::Script("handler failed".into()))
        }
    }
}

/// Sets the cancel flag when dropped before completion
struct CancelOnDrop {
    flag: Arc<AtomicBool>,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.flag.store(true, Ordering::Relaxed);
        }
    }
}

/// Require an owner or admin session, local mode excepted
pub async fn require_admin(
    state: &Arc<AppState>,
    headers: &hyper::HeaderMap,
) -> Result<Option<User>> {
    if state.args.local_mode {
        // Local mode trusts the machine owner
        return Ok(state.session_user(headers).await);
    }
    match state.session_user(headers).await {
        Some(user) if user.role.at_least(Role::Admin) => Ok(Some(user)),
        Some(_) => Err(FaztError::Forbidden("admin role required".into())),
        None => Err(FaztError::AuthRequired),
    }
}
