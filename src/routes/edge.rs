//! Tenant-edge routes: auth flows, private files, agent endpoints
//!
//! Auth endpoints live on every app host so the session cookie lands on the
//! root domain wherever login starts. The /_fazt/* agent surface is for
//! tooling and requires owner or admin.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

use super::{
    envelope_err, envelope_ok, error_response, html_response, not_found_response,
    redirect_response, HttpResponse,
};
use crate::apps::App;
use crate::auth::{dev, Auth};
use crate::events::{ActionResult, ActivityRecord, ActorType};
use crate::ids;
use crate::server::http::{read_body, require_admin, AppState};
use crate::storage::{AppStorage, Scope};
use crate::types::FaztError;

/// Internal scope holding pending OAuth state tokens
const OAUTH_SCOPE: &str = "_fazt:oauth";

/// OAuth state token lifetime
const OAUTH_STATE_TTL_MS: u64 = 10 * 60 * 1000;

fn oauth_storage(state: &Arc<AppState>) -> AppStorage {
    AppStorage::new(state.store.clone(), Scope::app(OAUTH_SCOPE))
}

/// Dispatch /auth/* on any host
pub async fn handle_auth(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
    over_tls: bool,
) -> HttpResponse {
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    let host = req
        .headers()
        .get("host")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();

    match (method, path.as_str()) {
        (Method::GET, p) if p.starts_with("/auth/login/") => {
            let provider = p.trim_start_matches("/auth/login/");
            handle_login(state, addr, &host, provider, over_tls).await
        }
        (Method::GET, p) if p.starts_with("/auth/callback/") => {
            let provider = p.trim_start_matches("/auth/callback/").to_string();
            handle_callback(state, addr, req, &host, &provider, over_tls).await
        }
        (Method::POST, "/auth/logout") => handle_logout(state, req).await,
        (Method::GET, "/auth/dev/login") => match dev::check_local(&host, over_tls) {
            Ok(()) => html_response(StatusCode::OK, dev::login_form()),
            Err(e) => error_response(&e),
        },
        (Method::POST, "/auth/dev/callback") => {
            handle_dev_callback(state, addr, req, &host, over_tls).await
        }
        _ => not_found_response(),
    }
}

async fn handle_login(
    state: Arc<AppState>,
    addr: SocketAddr,
    host: &str,
    provider: &str,
    over_tls: bool,
) -> HttpResponse {
    if let Err(e) = state.auth.check_login_rate(addr.ip()) {
        return error_response(&e);
    }

    if provider == "dev" {
        return match dev::check_local(host, over_tls) {
            Ok(()) => redirect_response(StatusCode::FOUND, "/auth/dev/login"),
            Err(e) => error_response(&e),
        };
    }

    let Some(oauth) = state.providers.get(provider) else {
        return error_response(&FaztError::NotFound(format!("provider {provider}")));
    };

    let csrf_state = ids::session_token();
    if let Err(e) = oauth_storage(&state)
        .kv()
        .set(&csrf_state, b"pending".to_vec(), Some(OAUTH_STATE_TTL_MS))
        .await
    {
        return error_response(&e);
    }

    let scheme = if over_tls { "https" } else { "http" };
    let redirect_uri = format!("{scheme}://{host}/auth/callback/{provider}");
    redirect_response(
        StatusCode::FOUND,
        &oauth.authorize_url(&redirect_uri, &csrf_state),
    )
}

async fn handle_callback(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
    host: &str,
    provider: &str,
    over_tls: bool,
) -> HttpResponse {
    if let Err(e) = state.auth.check_login_rate(addr.ip()) {
        return error_response(&e);
    }

    let query: std::collections::HashMap<String, String> =
        serde_urlencoded::from_str(req.uri().query().unwrap_or("")).unwrap_or_default();
    let Some(code) = query.get("code") else {
        return error_response(&FaztError::Validation("missing code parameter".into()));
    };
    let Some(csrf_state) = query.get("state") else {
        return error_response(&FaztError::Validation("missing state parameter".into()));
    };

    // The state token must exist and is consumed exactly once
    let oauth_kv = oauth_storage(&state);
    match oauth_kv.kv().get(csrf_state).await {
        Ok(Some(_)) => {
            let _ = oauth_kv.kv().delete(csrf_state).await;
        }
        _ => {
            return error_response(&FaztError::Validation(
                "unknown or expired state parameter".into(),
            ))
        }
    }

    let Some(oauth) = state.providers.get(provider) else {
        return error_response(&FaztError::NotFound(format!("provider {provider}")));
    };

    let scheme = if over_tls { "https" } else { "http" };
    let redirect_uri = format!("{scheme}://{host}/auth/callback/{provider}");
    let info = match oauth.callback(code, &redirect_uri).await {
        Ok(info) => info,
        Err(e) => {
            state.events.record(
                ActivityRecord::system("auth.callback_failed", "provider", provider)
                    .with_actor(ActorType::Anonymous, None)
                    .with_result(ActionResult::Failure)
                    .with_weight(3),
            );
            return error_response(&e);
        }
    };

    // Optional invite code carried through the flow grants a role
    let invited_role = match query.get("invite") {
        Some(code) => state.auth.redeem_invite(code).await.ok(),
        None => None,
    };

    let user = match state
        .auth
        .upsert_user(provider, &info.external_id, &info.email, &info.name, invited_role)
        .await
    {
        Ok(user) => user,
        Err(e) => return error_response(&e),
    };

    finish_login(&state, &user.id, over_tls).await
}

async fn handle_dev_callback(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
    host: &str,
    over_tls: bool,
) -> HttpResponse {
    if let Err(e) = dev::check_local(host, over_tls) {
        return error_response(&e);
    }
    if let Err(e) = state.auth.check_login_rate(addr.ip()) {
        return error_response(&e);
    }

    let (_, body) = match read_body(req).await {
        Ok(ok) => ok,
        Err(e) => return error_response(&e),
    };
    let login = match dev::parse_callback(&String::from_utf8_lossy(&body)) {
        Ok(login) => login,
        Err(e) => return error_response(&e),
    };

    let user = match state
        .auth
        .upsert_user(
            dev::DEV_PROVIDER,
            &login.email,
            &login.email,
            &login.name,
            Some(login.role),
        )
        .await
    {
        Ok(user) => user,
        Err(e) => return error_response(&e),
    };

    finish_login(&state, &user.id, over_tls).await
}

async fn finish_login(state: &Arc<AppState>, user_id: &str, over_tls: bool) -> HttpResponse {
    let session = match state.auth.create_session(user_id, None).await {
        Ok(session) => session,
        Err(e) => return error_response(&e),
    };
    let cookie = Auth::session_cookie(&session.token, &state.args.domain, over_tls);
    Response::builder()
        .status(StatusCode::FOUND)
        .header("Location", "/")
        .header("Set-Cookie", cookie)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

async fn handle_logout(state: Arc<AppState>, req: Request<Incoming>) -> HttpResponse {
    if let Some(header) = req.headers().get("cookie").and_then(|h| h.to_str().ok()) {
        if let Some(token) = crate::auth::cookie_value(header, crate::auth::SESSION_COOKIE) {
            if let Err(e) = state.auth.logout(&token).await {
                warn!("logout failed: {e}");
            }
        }
    }
    Response::builder()
        .status(StatusCode::FOUND)
        .header("Location", "/")
        .header("Set-Cookie", Auth::clear_session_cookie(&state.args.domain))
        .body(Full::new(Bytes::new()))
        .unwrap()
}

/// GET /private/* requires a session: browsers get a login redirect, API
/// clients get a bare 401, split on the Accept header.
pub async fn handle_private(
    state: Arc<AppState>,
    req: Request<Incoming>,
    app: &App,
) -> HttpResponse {
    let wants_html = req
        .headers()
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/html"));

    if state.session_user(req.headers()).await.is_none() {
        if wants_html {
            let provider = state.providers.default_provider();
            return redirect_response(StatusCode::FOUND, &format!("/auth/login/{provider}"));
        }
        return error_response(&FaztError::AuthRequired);
    }

    let path = req.uri().path();
    match state.vfs.get(&app.id, path).await {
        Ok(Some(file)) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", file.mime.as_str())
            .header("Cache-Control", "private, no-store")
            .body(Full::new(file.bytes))
            .unwrap(),
        Ok(None) => not_found_response(),
        Err(e) => error_response(&e),
    }
}

/// /_fazt/* agent endpoints; owner or admin only
pub async fn handle_agent(
    state: Arc<AppState>,
    req: Request<Incoming>,
    app: &App,
) -> HttpResponse {
    if let Err(e) = require_admin(&state, req.headers()).await {
        return error_response(&e);
    }

    let path = req.uri().path().to_string();
    let method = req.method().clone();
    let query: std::collections::HashMap<String, String> =
        serde_urlencoded::from_str(req.uri().query().unwrap_or("")).unwrap_or_default();

    match (method, path.as_str()) {
        (Method::GET, "/_fazt/info") => {
            let files = state.vfs.list(&app.id, "/").await.unwrap_or_default();
            envelope_ok(json!({
                "app": app.to_json(),
                "files": files.len(),
                "realtime_clients": state.registry.count(Some(&app.id)),
            }))
        }

        (Method::GET, "/_fazt/storage/kv") => {
            let prefix = query.get("prefix").cloned().unwrap_or_default();
            let storage = AppStorage::new(state.store.clone(), Scope::app(&app.id));
            match storage.kv().list(&prefix).await {
                Ok(keys) => envelope_ok(json!({ "keys": keys })),
                Err(e) => error_response(&e),
            }
        }

        (Method::GET, "/_fazt/storage/docs") => {
            let Some(collection) = query.get("collection") else {
                return envelope_err(
                    StatusCode::BAD_REQUEST,
                    "validation",
                    "collection parameter required",
                );
            };
            let storage = AppStorage::new(state.store.clone(), Scope::app(&app.id));
            match storage.docs().find(collection, &json!({})).await {
                Ok(docs) => envelope_ok(json!({ "docs": docs })),
                Err(e) => error_response(&e),
            }
        }

        (Method::GET, "/_fazt/storage/blobs") => {
            let prefix = query.get("prefix").cloned().unwrap_or_else(|| "/".into());
            let storage = AppStorage::new(state.store.clone(), Scope::app(&app.id));
            match storage.blobs().list(&prefix).await {
                Ok(blobs) => envelope_ok(serde_json::to_value(blobs).unwrap_or_default()),
                Err(e) => error_response(&e),
            }
        }

        (Method::GET, "/_fazt/logs") => {
            let limit = query
                .get("limit")
                .and_then(|l| l.parse().ok())
                .unwrap_or(100);
            match crate::events::recent(&state.store, limit).await {
                Ok(rows) => {
                    let rows: Vec<Value> = rows
                        .into_iter()
                        .filter(|r| r["resource_id"] == app.id.as_str())
                        .collect();
                    envelope_ok(json!({ "entries": rows }))
                }
                Err(e) => error_response(&e),
            }
        }

        (Method::GET, "/_fazt/errors") => {
            match crate::events::recent(&state.store, 500).await {
                Ok(rows) => {
                    let rows: Vec<Value> = rows
                        .into_iter()
                        .filter(|r| {
                            r["resource_id"] == app.id.as_str()
                                && (r["action"] == "script.error"
                                    || r["action"] == "script.compile_error"
                                    || r["action"] == "log.error")
                        })
                        .collect();
                    envelope_ok(json!({ "errors": rows }))
                }
                Err(e) => error_response(&e),
            }
        }

        (Method::POST, "/_fazt/snapshot") => snapshot_app(&state, app).await,
        (Method::POST, "/_fazt/restore") => restore_app(state, req, app).await,

        _ => not_found_response(),
    }
}

/// Export an app's files, KV entries, and documents as one JSON document
async fn snapshot_app(state: &Arc<AppState>, app: &App) -> HttpResponse {
    let files = match state.vfs.list(&app.id, "/").await {
        Ok(files) => files,
        Err(e) => return error_response(&e),
    };
    let mut file_entries = Vec::with_capacity(files.len());
    for meta in files {
        match state.vfs.get(&app.id, &meta.path).await {
            Ok(Some(file)) => file_entries.push(json!({
                "path": meta.path,
                "mime": file.mime,
                "content": BASE64.encode(&file.bytes),
            })),
            _ => continue,
        }
    }

    let storage = AppStorage::new(state.store.clone(), Scope::app(&app.id));
    let keys = storage.kv().list("").await.unwrap_or_default();
    let mut kv_entries = Vec::with_capacity(keys.len());
    for key in keys {
        if let Ok(Some(value)) = storage.kv().get(&key).await {
            kv_entries.push(json!({ "key": key, "value": BASE64.encode(&value) }));
        }
    }

    envelope_ok(json!({
        "app": app.to_json(),
        "files": file_entries,
        "kv": kv_entries,
    }))
}

/// Import a snapshot produced by /_fazt/snapshot into this app
async fn restore_app(
    state: Arc<AppState>,
    req: Request<Incoming>,
    app: &App,
) -> HttpResponse {
    let (_, body) = match read_body(req).await {
        Ok(ok) => ok,
        Err(e) => return error_response(&e),
    };
    let snapshot: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return error_response(&FaztError::Validation(format!("snapshot: {e}"))),
    };

    let mut restored_files = 0usize;
    if let Some(files) = snapshot["files"].as_array() {
        for entry in files {
            let (Some(path), Some(mime), Some(content)) = (
                entry["path"].as_str(),
                entry["mime"].as_str(),
                entry["content"].as_str(),
            ) else {
                continue;
            };
            let Ok(bytes) = BASE64.decode(content) else {
                continue;
            };
            if state.vfs.put(&app.id, path, bytes, mime).await.is_ok() {
                restored_files += 1;
            }
        }
    }

    let storage = AppStorage::new(state.store.clone(), Scope::app(&app.id));
    let mut restored_kv = 0usize;
    if let Some(entries) = snapshot["kv"].as_array() {
        for entry in entries {
            let (Some(key), Some(value)) = (entry["key"].as_str(), entry["value"].as_str())
            else {
                continue;
            };
            let Ok(bytes) = BASE64.decode(value) else {
                continue;
            };
            if storage.kv().set(key, bytes, None).await.is_ok() {
                restored_kv += 1;
            }
        }
    }

    state.scripts.invalidate_app(&app.id);
    state.events.record(
        ActivityRecord::system("app.restore", "app", &app.id).with_weight(3),
    );
    envelope_ok(json!({ "files": restored_files, "kv": restored_kv }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oauth_scope_cannot_collide_with_real_apps() {
        // App ids are app_ + base62; the internal scope uses a reserved
        // prefix outside that space.
        assert!(!crate::ids::is_valid_id(OAUTH_SCOPE, "app"));
    }

    #[test]
    fn oauth_state_ttl_is_bounded() {
        // State tokens must not outlive a login attempt by much
        assert!(OAUTH_STATE_TTL_MS <= 15 * 60 * 1000);
    }
}
