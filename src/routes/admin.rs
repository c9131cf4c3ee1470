//! Control-plane HTTP surface
//!
//! Served on the admin host (and the bare root domain). JSON envelopes
//! everywhere; owner or admin required outside local mode. Includes the
//! self-upgrade endpoint that swaps the running binary by rename and exits
//! with the status the supervisor treats as "relaunch me".

use hyper::body::Incoming;
use hyper::{Method, Request, StatusCode};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use super::{
    envelope_ok, error_response, html_response, not_found_response, version_info, HttpResponse,
};
use crate::alias::{AliasTarget, SplitArm};
use crate::events::{ActivityRecord, ActorType};
use crate::server::http::{read_body, require_admin, AppState};
use crate::types::FaztError;

/// Exit code the supervisor interprets as "binary replaced, relaunch"
const UPGRADE_EXIT_CODE: i32 = 42;

/// Entry point for all control-plane requests
pub async fn handle(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
    over_tls: bool,
) -> HttpResponse {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    // Auth flows run on the control plane too, so the root cookie can be
    // planted from here.
    if path.starts_with("/auth/") || path == "/auth" {
        return super::edge::handle_auth(state, addr, req, over_tls).await;
    }

    match (method.clone(), path.as_str()) {
        (Method::GET, "/") => {
            return html_response(
                StatusCode::OK,
                format!(
                    "<!doctype html><html><body><h1>fazt</h1>\
                     <p>sovereign PaaS on {}</p></body></html>",
                    state.args.domain
                ),
            )
        }
        (Method::GET, "/health") | (Method::GET, "/healthz") => {
            return envelope_ok(json!({"status": "ok"}))
        }
        (Method::GET, "/version") => return envelope_ok(version_info()),
        _ => {}
    }

    if !path.starts_with("/api/") {
        return not_found_response();
    }

    // Everything under /api/* is privileged
    let admin_user = match require_admin(&state, req.headers()).await {
        Ok(user) => user,
        Err(e) => return error_response(&e),
    };
    let actor_id = admin_user.as_ref().map(|u| u.id.clone());

    let result = dispatch_api(&state, req, &method, &path, actor_id).await;
    result.unwrap_or_else(|e| error_response(&e))
}

async fn dispatch_api(
    state: &Arc<AppState>,
    req: Request<Incoming>,
    method: &Method,
    path: &str,
    actor_id: Option<String>,
) -> Result<HttpResponse, FaztError> {
    let segments: Vec<&str> = path.trim_start_matches("/api/").split('/').collect();

    let record = |action: &str, resource_type: &str, resource_id: &str, weight: u8| {
        state.events.record(
            ActivityRecord::system(action, resource_type, resource_id)
                .with_actor(
                    if actor_id.is_some() {
                        ActorType::User
                    } else {
                        ActorType::System
                    },
                    actor_id.clone(),
                )
                .with_weight(weight),
        );
    };

    match (method, segments.as_slice()) {
        // ---- system ---------------------------------------------------------
        (&Method::GET, ["info"]) => {
            let schema_version = state.store.schema_version().await?;
            Ok(envelope_ok(json!({
                "version": version_info(),
                "domain": state.args.domain,
                "db_path": state.store.path().display().to_string(),
                "schema_version": schema_version,
                "uptime_secs": state.started_at.elapsed().as_secs(),
                "vfs_cache": state.vfs.cache_stats(),
                "workers": {
                    "running": state.workers.running_count(),
                    "memory_in_use": state.workers.memory_in_use(),
                },
                "realtime_clients": state.registry.count(None),
                "events_dropped": state.events.dropped(),
                "rate_limit_buckets": state.rate_limiter.bucket_count(),
            })))
        }

        (&Method::GET, ["activity"]) => {
            let rows = crate::events::recent(&state.store, 200).await?;
            Ok(envelope_ok(json!({ "entries": rows })))
        }

        // ---- apps -----------------------------------------------------------
        (&Method::GET, ["apps"]) => {
            let apps = crate::apps::list(&state.store).await?;
            Ok(envelope_ok(Value::Array(
                apps.iter().map(|a| a.to_json()).collect(),
            )))
        }
        (&Method::POST, ["apps"]) => {
            let body = json_body(req).await?;
            let manifest = body.get("manifest").unwrap_or(&body);
            let app = crate::apps::create(&state.store, manifest).await?;
            record("app.create", "app", &app.id, 3);
            Ok(envelope_ok(app.to_json()))
        }
        (&Method::GET, ["apps", id]) => {
            match crate::apps::get(&state.store, id).await? {
                Some(app) => Ok(envelope_ok(app.to_json())),
                None => Err(FaztError::NotFound(format!("app {id}"))),
            }
        }
        (&Method::PUT, ["apps", id]) => {
            let body = json_body(req).await?;
            let manifest = body.get("manifest").unwrap_or(&body);
            let app = crate::apps::update_manifest(&state.store, id, manifest).await?;
            state.scripts.invalidate_app(id);
            record("app.update", "app", id, 2);
            Ok(envelope_ok(app.to_json()))
        }
        (&Method::DELETE, ["apps", id]) => {
            let id = id.to_string();
            if !crate::apps::delete(&state.store, &id).await? {
                return Err(FaztError::NotFound(format!("app {id}")));
            }
            // Owned rows go with the app; running jobs get cancelled
            state.vfs.delete_app(&id).await?;
            crate::storage::AppStorage::delete_app_data(&state.store, &id).await?;
            state.workers.cancel_app(&id).await?;
            state.scripts.invalidate_app(&id);
            record("app.delete", "app", &id, 5);
            Ok(envelope_ok(json!({ "deleted": id })))
        }
        (&Method::POST, ["apps", id, "deploy"]) => {
            let id = id.to_string();
            if crate::apps::get(&state.store, &id).await?.is_none() {
                return Err(FaztError::NotFound(format!("app {id}")));
            }
            let (_, body) = read_body(req).await?;
            let count = crate::apps::deploy_zip(&state.vfs, &id, body.to_vec()).await?;
            state.scripts.invalidate_app(&id);
            record("app.deploy", "app", &id, 4);
            Ok(envelope_ok(json!({ "files": count })))
        }
        (&Method::POST, ["apps", id, "fork"]) => {
            let forked = crate::apps::fork(&state.store, &state.vfs, id).await?;
            record("app.fork", "app", &forked.id, 3);
            Ok(envelope_ok(forked.to_json()))
        }
        (&Method::GET, ["apps", id, "jobs"]) => {
            let jobs = state.workers.list(id).await?;
            Ok(envelope_ok(serde_json::to_value(jobs).unwrap_or_default()))
        }
        (&Method::GET, ["apps", id, "files"]) => {
            let files = state.vfs.list(id, "/").await?;
            Ok(envelope_ok(serde_json::to_value(files).unwrap_or_default()))
        }
        (&Method::PUT, ["apps", id, "files", rest @ ..]) => {
            let id = id.to_string();
            let path = format!("/{}", rest.join("/"));
            if crate::apps::get(&state.store, &id).await?.is_none() {
                return Err(FaztError::NotFound(format!("app {id}")));
            }
            let mime = req
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .unwrap_or_else(|| crate::vfs::mime_for_path(&path));
            let (_, body) = read_body(req).await?;
            state.vfs.put(&id, &path, body.to_vec(), &mime).await?;
            state.scripts.invalidate_app(&id);
            record("file.put", "app", &id, 2);
            Ok(envelope_ok(json!({ "path": path, "size": body.len() })))
        }
        (&Method::DELETE, ["apps", id, "files", rest @ ..]) => {
            let id = id.to_string();
            let path = format!("/{}", rest.join("/"));
            let deleted = state.vfs.delete(&id, &path).await?;
            state.scripts.invalidate_app(&id);
            record("file.delete", "app", &id, 2);
            Ok(envelope_ok(json!({ "path": path, "deleted": deleted })))
        }

        // ---- aliases --------------------------------------------------------
        (&Method::GET, ["aliases"]) => {
            let aliases = state.aliases.list().await?;
            Ok(envelope_ok(serde_json::to_value(aliases).unwrap_or_default()))
        }
        (&Method::PUT, ["aliases", subdomain]) => {
            let subdomain = subdomain.to_string();
            let body = json_body(req).await?;
            let target = parse_alias_target(&body)?;
            state.aliases.upsert(&subdomain, target).await?;
            // New subdomain means a new certificate to provision
            if let Some(tls) = &state.tls {
                tls.spawn_provision(format!("{subdomain}.{}", state.args.domain), false);
            }
            record("alias.set", "alias", &subdomain, 3);
            Ok(envelope_ok(json!({ "subdomain": subdomain })))
        }
        (&Method::DELETE, ["aliases", subdomain]) => {
            let subdomain = subdomain.to_string();
            if !state.aliases.delete(&subdomain).await? {
                return Err(FaztError::NotFound(format!("alias {subdomain}")));
            }
            record("alias.delete", "alias", &subdomain, 3);
            Ok(envelope_ok(json!({ "deleted": subdomain })))
        }

        // ---- users & invites ------------------------------------------------
        (&Method::GET, ["users"]) => {
            let users = state
                .store
                .read(|conn| {
                    let mut stmt = conn.prepare_cached(
                        "SELECT id, provider, email, name, role, created_at FROM users
                         ORDER BY created_at",
                    )?;
                    let rows = stmt.query_map([], |r| {
                        Ok(json!({
                            "id": r.get::<_, String>(0)?,
                            "provider": r.get::<_, String>(1)?,
                            "email": r.get::<_, String>(2)?,
                            "name": r.get::<_, String>(3)?,
                            "role": r.get::<_, String>(4)?,
                            "created_at": r.get::<_, String>(5)?,
                        }))
                    })?;
                    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
                })
                .await?;
            Ok(envelope_ok(Value::Array(users)))
        }
        (&Method::POST, ["invites"]) => {
            let body = json_body(req).await?;
            let role = crate::auth::Role::parse(
                body.get("role").and_then(|r| r.as_str()).unwrap_or("user"),
            )?;
            let code = state.auth.create_invite(role, None).await?;
            record("invite.create", "invite", &code, 2);
            Ok(envelope_ok(json!({ "code": code, "role": role.as_str() })))
        }

        // ---- peers (CLI bookkeeping; unused by the pipeline) ----------------
        (&Method::GET, ["peers"]) => {
            let peers = state
                .store
                .read(|conn| {
                    let mut stmt = conn.prepare_cached(
                        "SELECT name, url, last_seen, version FROM peers ORDER BY name",
                    )?;
                    let rows = stmt.query_map([], |r| {
                        Ok(json!({
                            "name": r.get::<_, String>(0)?,
                            "url": r.get::<_, String>(1)?,
                            "last_seen": r.get::<_, Option<String>>(2)?,
                            "version": r.get::<_, Option<String>>(3)?,
                        }))
                    })?;
                    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
                })
                .await?;
            Ok(envelope_ok(Value::Array(peers)))
        }

        // ---- raw SQL --------------------------------------------------------
        (&Method::POST, ["sql"]) => {
            let body = json_body(req).await?;
            let query = body
                .get("query")
                .and_then(|q| q.as_str())
                .ok_or_else(|| FaztError::Validation("query is required".into()))?
                .to_string();
            let write = body.get("write").and_then(|w| w.as_bool()).unwrap_or(false);
            record("sql.execute", "db", if write { "write" } else { "read" }, 6);
            run_sql(state, query, write).await
        }

        // ---- self-upgrade ---------------------------------------------------
        (&Method::POST, ["upgrade"]) => {
            let (_, body) = read_body(req).await?;
            if body.len() < 1024 {
                return Err(FaztError::Validation(
                    "upgrade payload too small to be a binary".into(),
                ));
            }
            record("system.upgrade", "system", "binary", 9);
            perform_upgrade(body.to_vec())?;
            Ok(envelope_ok(json!({
                "status": "replaced",
                "exit_code": UPGRADE_EXIT_CODE,
            })))
        }

        _ => Ok(not_found_response()),
    }
}

async fn json_body(req: Request<Incoming>) -> Result<Value, FaztError> {
    let (_, body) = read_body(req).await?;
    serde_json::from_slice(&body)
        .map_err(|e| FaztError::Validation(format!("invalid JSON body: {e}")))
}

/// Parse the {type, targets} alias body into the tagged target
fn parse_alias_target(body: &Value) -> Result<AliasTarget, FaztError> {
    let kind = body
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| FaztError::Validation("alias type is required".into()))?;
    let targets = body.get("targets").unwrap_or(&Value::Null);

    let target = match kind {
        "proxy" => AliasTarget::Proxy {
            app_id: targets
                .get("app_id")
                .and_then(|a| a.as_str())
                .ok_or_else(|| FaztError::Validation("proxy targets need app_id".into()))?
                .to_string(),
        },
        "redirect" => AliasTarget::Redirect {
            url: targets
                .get("url")
                .and_then(|u| u.as_str())
                .ok_or_else(|| FaztError::Validation("redirect targets need url".into()))?
                .to_string(),
            code: targets.get("code").and_then(|c| c.as_u64()).unwrap_or(302) as u16,
        },
        "reserved" => AliasTarget::Reserved {},
        "split" => {
            let arms = targets
                .as_array()
                .ok_or_else(|| FaztError::Validation("split targets must be an array".into()))?;
            let weighted = arms
                .iter()
                .map(|arm| {
                    Ok(SplitArm {
                        app_id: arm
                            .get("app_id")
                            .and_then(|a| a.as_str())
                            .ok_or_else(|| {
                                FaztError::Validation("split arm needs app_id".into())
                            })?
                            .to_string(),
                        weight: arm.get("weight").and_then(|w| w.as_u64()).unwrap_or(0) as u32,
                    })
                })
                .collect::<Result<Vec<_>, FaztError>>()?;
            AliasTarget::Split { weighted }
        }
        other => {
            return Err(FaztError::Validation(format!("unknown alias type {other}")))
        }
    };
    Ok(target)
}

/// Run a SQL statement: reads on the pooled read path, writes through the
/// write queue, selected by the caller's explicit `write` flag.
async fn run_sql(
    state: &Arc<AppState>,
    query: String,
    write: bool,
) -> Result<HttpResponse, FaztError> {
    if write {
        let affected = state
            .store
            .writes()
            .submit(move |tx| Ok(tx.execute(&query, [])?))
            .await?;
        return Ok(envelope_ok(json!({ "rows_affected": affected })));
    }

    let rows = state
        .store
        .read(move |conn| {
            let mut stmt = conn.prepare(&query)?;
            let column_names: Vec<String> =
                stmt.column_names().iter().map(|c| c.to_string()).collect();
            let column_count = column_names.len();
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                if out.len() >= 1000 {
                    break;
                }
                let mut object = serde_json::Map::new();
                for (i, name) in column_names.iter().enumerate().take(column_count) {
                    let value = match row.get_ref(i)? {
                        rusqlite::types::ValueRef::Null => Value::Null,
                        rusqlite::types::ValueRef::Integer(n) => json!(n),
                        rusqlite::types::ValueRef::Real(f) => json!(f),
                        rusqlite::types::ValueRef::Text(t) => {
                            json!(String::from_utf8_lossy(t))
                        }
                        rusqlite::types::ValueRef::Blob(b) => {
                            json!(format!("<{} bytes>", b.len()))
                        }
                    };
                    object.insert(name.clone(), value);
                }
                out.push(Value::Object(object));
            }
            Ok(out)
        })
        .await?;
    Ok(envelope_ok(json!({ "rows": rows })))
}

/// Atomically replace the running binary and schedule the exit the
/// supervisor expects.
fn perform_upgrade(binary: Vec<u8>) -> Result<(), FaztError> {
    let current = std::env::current_exe()
        .map_err(|e| FaztError::Internal(format!("current_exe: {e}")))?;
    let staging = current.with_extension("new");

    std::fs::write(&staging, binary)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o755))?;
    }
    // Rename is atomic on the same filesystem; the running inode stays valid
    std::fs::rename(&staging, &current)?;
    info!("binary replaced, exiting for supervisor relaunch");

    tokio::spawn(async {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        std::process::exit(UPGRADE_EXIT_CODE);
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_id(n: &str) -> String {
        format!("app_{n:0>12}")
    }

    #[test]
    fn alias_bodies_parse() {
        let target = parse_alias_target(&json!({
            "type": "proxy",
            "targets": { "app_id": app_id("1") },
        }))
        .unwrap();
        assert_eq!(target.kind(), "proxy");

        let target = parse_alias_target(&json!({
            "type": "redirect",
            "targets": { "url": "https://x.org/", "code": 301 },
        }))
        .unwrap();
        assert_eq!(target.kind(), "redirect");

        let target = parse_alias_target(&json!({
            "type": "split",
            "targets": [
                { "app_id": app_id("1"), "weight": 1 },
                { "app_id": app_id("2"), "weight": 1 },
            ],
        }))
        .unwrap();
        assert_eq!(target.kind(), "split");

        assert!(parse_alias_target(&json!({"type": "teleport"})).is_err());
        assert!(parse_alias_target(&json!({"type": "proxy", "targets": {}})).is_err());
    }
}
