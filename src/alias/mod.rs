//! Host-based routing
//!
//! Maps an incoming Host header to a routing decision. Reserved subdomains
//! win over the alias table; the alias table wins over the app-id-as-
//! subdomain fallback, even when a subdomain happens to equal an app id.

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::RESERVED_SUBDOMAINS;
use crate::ids;
use crate::store::Store;
use crate::types::{FaztError, Result};

/// Cookie carrying split-traffic stickiness
pub const VARIANT_COOKIE: &str = "X-Fazt-Variant";

/// One weighted arm of a split alias
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SplitArm {
    pub app_id: String,
    pub weight: u32,
}

/// Alias target, tagged by alias kind.
///
/// Kept as a closed variant rather than a free-form map so the weight and
/// URL invariants are checked at construction, not at request time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum AliasTarget {
    Proxy { app_id: String },
    Redirect { url: String, code: u16 },
    Split { weighted: Vec<SplitArm> },
    Reserved {},
}

impl AliasTarget {
    /// Kind tag stored alongside the targets JSON
    pub fn kind(&self) -> &'static str {
        match self {
            AliasTarget::Proxy { .. } => "proxy",
            AliasTarget::Redirect { .. } => "redirect",
            AliasTarget::Split { .. } => "split",
            AliasTarget::Reserved {} => "reserved",
        }
    }

    /// Validate construction invariants: redirect URLs parse and use a
    /// permitted status, split weights sum above zero.
    pub fn validate(&self) -> Result<()> {
        match self {
            AliasTarget::Proxy { app_id } => {
                if !ids::is_valid_id(app_id, "app") {
                    return Err(FaztError::Validation(format!("invalid app id: {app_id}")));
                }
            }
            AliasTarget::Redirect { url, code } => {
                reqwest::Url::parse(url)
                    .map_err(|e| FaztError::Validation(format!("redirect url: {e}")))?;
                if *code != 301 && *code != 302 {
                    return Err(FaztError::Validation(format!(
                        "redirect code must be 301 or 302, got {code}"
                    )));
                }
            }
            AliasTarget::Split { weighted } => {
                if weighted.is_empty() || weighted.iter().map(|a| a.weight as u64).sum::<u64>() == 0
                {
                    return Err(FaztError::Validation(
                        "split weights must sum above zero".into(),
                    ));
                }
                for arm in weighted {
                    if !ids::is_valid_id(&arm.app_id, "app") {
                        return Err(FaztError::Validation(format!(
                            "invalid app id in split: {}",
                            arm.app_id
                        )));
                    }
                }
            }
            AliasTarget::Reserved {} => {}
        }
        Ok(())
    }

    fn from_row(kind: &str, targets_json: &str) -> Result<Self> {
        let target = match kind {
            "proxy" => AliasTarget::Proxy {
                app_id: serde_json::from_str::<serde_json::Value>(targets_json)?
                    .get("app_id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| FaztError::Database("proxy alias missing app_id".into()))?
                    .to_string(),
            },
            "redirect" | "split" | "reserved" => serde_json::from_str(targets_json)?,
            other => return Err(FaztError::Database(format!("unknown alias kind {other}"))),
        };
        Ok(target)
    }
}

/// Full alias row for control-plane listings
#[derive(Debug, Clone, Serialize)]
pub struct Alias {
    pub subdomain: String,
    pub kind: String,
    pub target: AliasTarget,
    pub updated_at: String,
}

/// Routing decision for one request
#[derive(Debug, Clone, PartialEq)]
pub enum HostRoute {
    /// Bare root domain or the admin subdomain: the control plane answers
    ControlPlane,
    /// Proxy to an app. `set_variant` carries a sticky cookie that must be
    /// written on the response when a fresh split draw happened.
    App {
        app_id: String,
        set_variant: Option<String>,
    },
    Redirect { url: String, code: u16 },
    /// Reserved alias or unmatched host: 404, via the universal-404 app
    NotFound,
}

/// Resolves Host headers against reserved names, the alias table, and the
/// app-id fallback
pub struct AliasMap {
    store: Store,
    root_domain: String,
}

impl AliasMap {
    pub fn new(store: Store, root_domain: &str) -> Self {
        Self {
            store,
            root_domain: root_domain.to_lowercase(),
        }
    }

    /// Extract the subdomain from a Host header value. Empty string means
    /// the bare root domain; None means the host is outside the root domain
    /// entirely (looked up verbatim as a custom-domain alias).
    pub fn subdomain_of(&self, host: &str) -> Option<String> {
        let host = host.to_lowercase();
        let host = host.split(':').next().unwrap_or("").to_string();
        if host == self.root_domain {
            return Some(String::new());
        }
        host.strip_suffix(&format!(".{}", self.root_domain))
            .map(|s| s.to_string())
    }

    /// Resolve a Host header plus an optional sticky-variant cookie value
    pub async fn resolve(&self, host: &str, variant_cookie: Option<&str>) -> Result<HostRoute> {
        let lookup_key = match self.subdomain_of(host) {
            Some(sub) if sub.is_empty() => return Ok(HostRoute::ControlPlane),
            Some(sub) => {
                if RESERVED_SUBDOMAINS.contains(&sub.as_str()) {
                    return Ok(match sub.as_str() {
                        "admin" | "root" => HostRoute::ControlPlane,
                        _ => HostRoute::NotFound,
                    });
                }
                sub
            }
            // Host outside the root domain: custom-domain aliases match verbatim
            None => host
                .to_lowercase()
                .split(':')
                .next()
                .unwrap_or("")
                .to_string(),
        };

        if let Some(alias) = self.get(&lookup_key).await? {
            return Ok(match alias.target {
                AliasTarget::Proxy { app_id } => HostRoute::App {
                    app_id,
                    set_variant: None,
                },
                AliasTarget::Redirect { url, code } => HostRoute::Redirect { url, code },
                AliasTarget::Reserved {} => HostRoute::NotFound,
                AliasTarget::Split { weighted } => pick_split(&weighted, variant_cookie),
            });
        }

        // App-id-as-subdomain fallback; the alias table above stays
        // authoritative when both match.
        if ids::is_valid_id(&lookup_key, "app") && self.app_exists(&lookup_key).await? {
            return Ok(HostRoute::App {
                app_id: lookup_key,
                set_variant: None,
            });
        }

        Ok(HostRoute::NotFound)
    }

    /// Fetch one alias row
    pub async fn get(&self, subdomain: &str) -> Result<Option<Alias>> {
        let sub = subdomain.to_string();
        self.store
            .read(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT kind, targets, updated_at FROM aliases WHERE subdomain = ?1",
                )?;
                let mut rows = stmt.query([&sub])?;
                match rows.next()? {
                    Some(row) => {
                        let kind: String = row.get(0)?;
                        let targets: String = row.get(1)?;
                        let updated_at: String = row.get(2)?;
                        Ok(Some(Alias {
                            subdomain: sub.clone(),
                            target: AliasTarget::from_row(&kind, &targets)?,
                            kind,
                            updated_at,
                        }))
                    }
                    None => Ok(None),
                }
            })
            .await
    }

    /// Create or replace an alias after validating its target
    pub async fn upsert(&self, subdomain: &str, target: AliasTarget) -> Result<()> {
        target.validate()?;
        let sub = subdomain.trim().to_lowercase();
        if sub.is_empty() {
            return Err(FaztError::Validation("subdomain must not be empty".into()));
        }
        if RESERVED_SUBDOMAINS.contains(&sub.as_str()) {
            return Err(FaztError::Validation(format!("subdomain {sub} is reserved")));
        }
        let kind = target.kind().to_string();
        let targets_json = match &target {
            AliasTarget::Proxy { app_id } => serde_json::json!({ "app_id": app_id }).to_string(),
            other => serde_json::to_string(other)?,
        };
        let now = Utc::now().to_rfc3339();
        self.store
            .writes()
            .submit(move |tx| {
                tx.execute(
                    "INSERT INTO aliases (subdomain, kind, targets, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (subdomain) DO UPDATE SET
                       kind = excluded.kind,
                       targets = excluded.targets,
                       updated_at = excluded.updated_at",
                    rusqlite::params![sub, kind, targets_json, now],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn delete(&self, subdomain: &str) -> Result<bool> {
        let sub = subdomain.to_lowercase();
        self.store
            .writes()
            .submit(move |tx| {
                let n = tx.execute("DELETE FROM aliases WHERE subdomain = ?1", [sub])?;
                Ok(n > 0)
            })
            .await
    }

    pub async fn list(&self) -> Result<Vec<Alias>> {
        self.store
            .read(|conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT subdomain, kind, targets, updated_at FROM aliases ORDER BY subdomain",
                )?;
                let rows = stmt.query_map([], |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                    ))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    let (subdomain, kind, targets, updated_at) = row?;
                    out.push(Alias {
                        subdomain,
                        target: AliasTarget::from_row(&kind, &targets)?,
                        kind,
                        updated_at,
                    });
                }
                Ok(out)
            })
            .await
    }

    async fn app_exists(&self, app_id: &str) -> Result<bool> {
        let id = app_id.to_string();
        self.store
            .read(move |conn| {
                let n: i64 =
                    conn.query_row("SELECT COUNT(*) FROM apps WHERE id = ?1", [id], |r| r.get(0))?;
                Ok(n > 0)
            })
            .await
    }
}

/// Sticky split selection: honor a valid cookie, otherwise draw by weight
/// and report the cookie to set.
fn pick_split(weighted: &[SplitArm], variant_cookie: Option<&str>) -> HostRoute {
    if let Some(cookie_app) = variant_cookie {
        if weighted.iter().any(|a| a.app_id == cookie_app) {
            return HostRoute::App {
                app_id: cookie_app.to_string(),
                set_variant: None,
            };
        }
    }

    let total: u64 = weighted.iter().map(|a| a.weight as u64).sum();
    let mut draw = rand::thread_rng().gen_range(0..total.max(1));
    for arm in weighted {
        if draw < arm.weight as u64 {
            return HostRoute::App {
                app_id: arm.app_id.clone(),
                set_variant: Some(arm.app_id.clone()),
            };
        }
        draw -= arm.weight as u64;
    }
    // Unreachable with validated weights; pick the first arm defensively
    HostRoute::App {
        app_id: weighted[0].app_id.clone(),
        set_variant: Some(weighted[0].app_id.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_map() -> (AliasMap, Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("alias.db")).unwrap();
        (AliasMap::new(store.clone(), "example.com"), store, dir)
    }

    fn app(id_suffix: &str) -> String {
        format!("app_{:0>12}", id_suffix)
    }

    async fn insert_app(store: &Store, id: &str) {
        let id = id.to_string();
        store
            .writes()
            .submit(move |tx| {
                tx.execute(
                    "INSERT INTO apps (id, name, manifest, created_at, updated_at)
                     VALUES (?1, 'x', '{}', '2026-01-01', '2026-01-01')",
                    [id],
                )?;
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn subdomain_extraction() {
        let (map, _store, _dir) = temp_map().await;
        assert_eq!(map.subdomain_of("example.com:443"), Some(String::new()));
        assert_eq!(map.subdomain_of("My-App.Example.Com"), Some("my-app".into()));
        assert_eq!(map.subdomain_of("other.org"), None);
    }

    #[tokio::test]
    async fn reserved_subdomains_win_over_aliases() {
        let (map, _store, _dir) = temp_map().await;
        assert_eq!(
            map.resolve("admin.example.com", None).await.unwrap(),
            HostRoute::ControlPlane
        );
        assert_eq!(
            map.resolve("404.example.com", None).await.unwrap(),
            HostRoute::NotFound
        );
    }

    #[tokio::test]
    async fn proxy_alias_resolves() {
        let (map, _store, _dir) = temp_map().await;
        map.upsert("blog", AliasTarget::Proxy { app_id: app("1") })
            .await
            .unwrap();
        match map.resolve("blog.example.com", None).await.unwrap() {
            HostRoute::App { app_id, set_variant } => {
                assert_eq!(app_id, app("1"));
                assert!(set_variant.is_none());
            }
            other => panic!("unexpected route: {other:?}"),
        }
    }

    #[tokio::test]
    async fn split_weights_validated() {
        let (map, _store, _dir) = temp_map().await;
        let err = map
            .upsert(
                "promo",
                AliasTarget::Split {
                    weighted: vec![SplitArm { app_id: app("1"), weight: 0 }],
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FaztError::Validation(_)));
    }

    #[tokio::test]
    async fn split_sticky_cookie_honored() {
        let (map, _store, _dir) = temp_map().await;
        map.upsert(
            "promo",
            AliasTarget::Split {
                weighted: vec![
                    SplitArm { app_id: app("1"), weight: 1 },
                    SplitArm { app_id: app("2"), weight: 1 },
                ],
            },
        )
        .await
        .unwrap();

        let a1 = app("1");
        match map.resolve("promo.example.com", Some(a1.as_str())).await.unwrap() {
            HostRoute::App { app_id, set_variant } => {
                assert_eq!(app_id, a1);
                assert!(set_variant.is_none());
            }
            other => panic!("unexpected route: {other:?}"),
        }

        // Fresh client: some arm is drawn and a cookie is requested
        match map.resolve("promo.example.com", None).await.unwrap() {
            HostRoute::App { set_variant, .. } => assert!(set_variant.is_some()),
            other => panic!("unexpected route: {other:?}"),
        }
    }

    #[tokio::test]
    async fn split_draw_is_roughly_even() {
        let arms = vec![
            SplitArm { app_id: app("1"), weight: 1 },
            SplitArm { app_id: app("2"), weight: 1 },
        ];
        let mut first = 0usize;
        let trials = 10_000;
        for _ in 0..trials {
            if let HostRoute::App { app_id, .. } = pick_split(&arms, None) {
                if app_id == app("1") {
                    first += 1;
                }
            }
        }
        let share = first as f64 / trials as f64;
        assert!((0.45..=0.55).contains(&share), "split share {share}");
    }

    #[tokio::test]
    async fn alias_table_beats_app_id_fallback() {
        let (map, store, _dir) = temp_map().await;
        let colliding = app("9");
        insert_app(&store, &colliding).await;
        insert_app(&store, &app("8")).await;

        // No alias: fallback reaches the app directly
        match map
            .resolve(&format!("{colliding}.example.com"), None)
            .await
            .unwrap()
        {
            HostRoute::App { app_id, .. } => assert_eq!(app_id, colliding),
            other => panic!("unexpected route: {other:?}"),
        }

        // Alias with the same subdomain: table is authoritative
        map.upsert(&colliding, AliasTarget::Proxy { app_id: app("8") })
            .await
            .unwrap();
        match map
            .resolve(&format!("{colliding}.example.com"), None)
            .await
            .unwrap()
        {
            HostRoute::App { app_id, .. } => assert_eq!(app_id, app("8")),
            other => panic!("unexpected route: {other:?}"),
        }
    }

    #[tokio::test]
    async fn redirect_validation() {
        let (map, _store, _dir) = temp_map().await;
        assert!(map
            .upsert("r", AliasTarget::Redirect { url: "not a url".into(), code: 301 })
            .await
            .is_err());
        assert!(map
            .upsert("r", AliasTarget::Redirect { url: "https://x.org/".into(), code: 307 })
            .await
            .is_err());
        assert!(map
            .upsert("r", AliasTarget::Redirect { url: "https://x.org/".into(), code: 302 })
            .await
            .is_ok());
    }
}
