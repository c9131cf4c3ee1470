//! Authentication and authorization
//!
//! Sessions are opaque high-entropy tokens stored in the database and
//! carried by a root-domain cookie, which is what gives SSO across app
//! subdomains. Identity comes from OAuth providers or, in local mode only,
//! the dev provider. The first user ever created becomes the owner.

pub mod dev;
pub mod providers;

use chrono::{Duration, Utc};
use cookie::{Cookie, SameSite};
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::events::{ActionResult, ActivityRecord, ActorType, EventBuffer};
use crate::ids;
use crate::store::Store;
use crate::types::{FaztError, Result};

/// Session cookie name
pub const SESSION_COOKIE: &str = "fazt_session";

/// Session lifetime
const SESSION_TTL_DAYS: i64 = 30;

/// Login attempts allowed per IP per window
const LOGIN_BURST: u32 = 5;
/// Window over which the login bucket refills completely
const LOGIN_WINDOW_SECS: u64 = 15 * 60;

/// Role hierarchy: owner > admin > user
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
    Owner,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::User => "user",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "owner" => Ok(Role::Owner),
            "admin" => Ok(Role::Admin),
            "user" => Ok(Role::User),
            other => Err(FaztError::Validation(format!("unknown role: {other}"))),
        }
    }

    /// True when this role satisfies a required role
    pub fn at_least(&self, required: Role) -> bool {
        self >= &required
    }
}

/// A registered user
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: String,
    pub provider: String,
    pub external_id: String,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub created_at: String,
}

/// A live session row
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub user_id: String,
    pub app_id: Option<String>,
    pub expires_at: String,
}

type LoginLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

/// Auth service: user/session persistence plus the login limiter
pub struct Auth {
    store: Store,
    events: Arc<EventBuffer>,
    login_limiter: LoginLimiter,
}

impl Auth {
    pub fn new(store: Store, events: Arc<EventBuffer>) -> Self {
        let per_attempt = std::time::Duration::from_secs(LOGIN_WINDOW_SECS / LOGIN_BURST as u64);
        let quota = Quota::with_period(per_attempt)
            .expect("nonzero period")
            .allow_burst(NonZeroU32::new(LOGIN_BURST).expect("nonzero burst"));
        Self {
            store,
            events,
            login_limiter: RateLimiter::keyed(quota),
        }
    }

    /// Check the per-IP login bucket; brute-force lockout surfaces as
    /// RateLimited and lands in the activity log.
    pub fn check_login_rate(&self, ip: IpAddr) -> Result<()> {
        if self.login_limiter.check_key(&ip).is_err() {
            self.events.record(
                ActivityRecord::system("auth.lockout", "ip", &ip.to_string())
                    .with_actor(ActorType::Anonymous, None)
                    .with_result(ActionResult::Failure)
                    .with_weight(5),
            );
            return Err(FaztError::RateLimited);
        }
        Ok(())
    }

    /// Find-or-create a user for a provider identity. One (provider,
    /// external id) pair maps to exactly one user; the first user created
    /// becomes owner, later signups default to `user` unless an invite
    /// grants more.
    pub async fn upsert_user(
        &self,
        provider: &str,
        external_id: &str,
        email: &str,
        name: &str,
        invited_role: Option<Role>,
    ) -> Result<User> {
        let provider = provider.to_string();
        let external_id = external_id.to_string();
        let email = email.to_string();
        let name = name.to_string();
        let new_id = ids::user_id();
        let now = Utc::now().to_rfc3339();

        let user = self
            .store
            .writes()
            .submit(move |tx| {
                let existing = tx
                    .query_row(
                        "SELECT id, email, name, role, created_at FROM users
                         WHERE provider = ?1 AND external_id = ?2",
                        rusqlite::params![provider, external_id],
                        |r| {
                            Ok((
                                r.get::<_, String>(0)?,
                                r.get::<_, String>(3)?,
                                r.get::<_, String>(4)?,
                            ))
                        },
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(FaztError::from(other)),
                    })?;

                if let Some((id, role, created_at)) = existing {
                    // Keep profile fields fresh on every login
                    tx.execute(
                        "UPDATE users SET email = ?2, name = ?3 WHERE id = ?1",
                        rusqlite::params![id, email, name],
                    )?;
                    return Ok(User {
                        id,
                        provider,
                        external_id,
                        email,
                        name,
                        role: Role::parse(&role)?,
                        created_at,
                    });
                }

                let user_count: i64 =
                    tx.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
                let role = if user_count == 0 {
                    Role::Owner
                } else {
                    invited_role.unwrap_or(Role::User)
                };

                tx.execute(
                    "INSERT INTO users (id, provider, external_id, email, name, role, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        new_id,
                        provider,
                        external_id,
                        email,
                        name,
                        role.as_str(),
                        now
                    ],
                )?;
                Ok(User {
                    id: new_id,
                    provider,
                    external_id,
                    email,
                    name,
                    role,
                    created_at: now,
                })
            })
            .await?;

        self.events.record(
            ActivityRecord::system("auth.login", "user", &user.id)
                .with_actor(ActorType::User, Some(user.id.clone()))
                .with_weight(2),
        );
        Ok(user)
    }

    /// Create a session, optionally scoped to one app
    pub async fn create_session(&self, user_id: &str, app_id: Option<&str>) -> Result<Session> {
        let token = ids::session_token();
        let session = Session {
            token: token.clone(),
            user_id: user_id.to_string(),
            app_id: app_id.map(str::to_string),
            expires_at: (Utc::now() + Duration::days(SESSION_TTL_DAYS)).to_rfc3339(),
        };
        let s = session.clone();
        let now = Utc::now().to_rfc3339();
        self.store
            .writes()
            .submit(move |tx| {
                tx.execute(
                    "INSERT INTO sessions (token, user_id, app_id, expires_at, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![s.token, s.user_id, s.app_id, s.expires_at, now],
                )?;
                Ok(())
            })
            .await?;
        Ok(session)
    }

    /// Resolve a session token to its user; expired sessions are invisible
    pub async fn user_for_token(&self, token: &str) -> Result<Option<User>> {
        let token = token.to_string();
        let now = Utc::now().to_rfc3339();
        self.store
            .read(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT u.id, u.provider, u.external_id, u.email, u.name, u.role, u.created_at
                     FROM sessions s JOIN users u ON u.id = s.user_id
                     WHERE s.token = ?1 AND s.expires_at >= ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![token, now])?;
                match rows.next()? {
                    Some(r) => Ok(Some(User {
                        id: r.get(0)?,
                        provider: r.get(1)?,
                        external_id: r.get(2)?,
                        email: r.get(3)?,
                        name: r.get(4)?,
                        role: Role::parse(&r.get::<_, String>(5)?)?,
                        created_at: r.get(6)?,
                    })),
                    None => Ok(None),
                }
            })
            .await
    }

    /// Revoke one session
    pub async fn logout(&self, token: &str) -> Result<()> {
        let token = token.to_string();
        self.store
            .writes()
            .submit(move |tx| {
                tx.execute("DELETE FROM sessions WHERE token = ?1", [token])?;
                Ok(())
            })
            .await
    }

    /// Create an invite granting a role on redemption
    pub async fn create_invite(&self, role: Role, expires_in: Option<Duration>) -> Result<String> {
        let code = ids::invite_code();
        let c = code.clone();
        let expires_at = expires_in.map(|d| (Utc::now() + d).to_rfc3339());
        self.store
            .writes()
            .submit(move |tx| {
                tx.execute(
                    "INSERT INTO invites (code, role, consumed, expires_at) VALUES (?1, ?2, 0, ?3)",
                    rusqlite::params![c, role.as_str(), expires_at],
                )?;
                Ok(())
            })
            .await?;
        Ok(code)
    }

    /// Consume an invite; returns the granted role. A consumed or expired
    /// code is rejected.
    pub async fn redeem_invite(&self, code: &str) -> Result<Role> {
        let code = code.to_string();
        let now = Utc::now().to_rfc3339();
        self.store
            .writes()
            .submit(move |tx| {
                let row = tx
                    .query_row(
                        "SELECT role, consumed, expires_at FROM invites WHERE code = ?1",
                        [&code],
                        |r| {
                            Ok((
                                r.get::<_, String>(0)?,
                                r.get::<_, i64>(1)?,
                                r.get::<_, Option<String>>(2)?,
                            ))
                        },
                    )
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => {
                            Err(FaztError::NotFound("invite".into()))
                        }
                        other => Err(other.into()),
                    })?;

                let (role, consumed, expires_at) = row;
                if consumed != 0 {
                    return Err(FaztError::Validation("invite already consumed".into()));
                }
                if let Some(exp) = expires_at {
                    if exp < now {
                        return Err(FaztError::Validation("invite expired".into()));
                    }
                }
                tx.execute("UPDATE invites SET consumed = 1 WHERE code = ?1", [&code])?;
                Role::parse(&role)
            })
            .await
    }

    /// Build the session Set-Cookie value: HttpOnly, SameSite=Lax, scoped
    /// to the root domain, Secure when served over TLS.
    pub fn session_cookie(token: &str, root_domain: &str, secure: bool) -> String {
        let mut cookie = Cookie::new(SESSION_COOKIE, token.to_string());
        cookie.set_http_only(true);
        cookie.set_same_site(SameSite::Lax);
        cookie.set_path("/");
        cookie.set_secure(secure);
        if root_domain != "localhost" && root_domain.parse::<IpAddr>().is_err() {
            cookie.set_domain(root_domain.to_string());
        }
        cookie.set_max_age(cookie::time::Duration::days(SESSION_TTL_DAYS));
        cookie.to_string()
    }

    /// Expired cookie for logout
    pub fn clear_session_cookie(root_domain: &str) -> String {
        let mut cookie = Cookie::new(SESSION_COOKIE, "");
        cookie.set_path("/");
        cookie.set_max_age(cookie::time::Duration::seconds(0));
        if root_domain != "localhost" && root_domain.parse::<IpAddr>().is_err() {
            cookie.set_domain(root_domain.to_string());
        }
        cookie.to_string()
    }
}

/// Pull one cookie value out of a Cookie header
pub fn cookie_value(header: &str, name: &str) -> Option<String> {
    for part in header.split(';') {
        if let Ok(cookie) = Cookie::parse(part.trim().to_string()) {
            if cookie.name() == name {
                return Some(cookie.value().to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::Registry;

    async fn temp_auth() -> (Auth, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("auth.db")).unwrap();
        let events = EventBuffer::start(store.clone(), Arc::new(Registry::new()));
        (Auth::new(store, events), dir)
    }

    #[test]
    fn role_order() {
        assert!(Role::Owner.at_least(Role::Admin));
        assert!(Role::Admin.at_least(Role::User));
        assert!(!Role::User.at_least(Role::Admin));
        assert!(Role::Admin.at_least(Role::Admin));
    }

    #[tokio::test]
    async fn first_user_becomes_owner() {
        let (auth, _dir) = temp_auth().await;
        let first = auth
            .upsert_user("dev", "1", "a@x.org", "A", None)
            .await
            .unwrap();
        assert_eq!(first.role, Role::Owner);

        let second = auth
            .upsert_user("dev", "2", "b@x.org", "B", None)
            .await
            .unwrap();
        assert_eq!(second.role, Role::User);
    }

    #[tokio::test]
    async fn provider_identity_maps_to_one_user() {
        let (auth, _dir) = temp_auth().await;
        let a = auth
            .upsert_user("github", "77", "a@x.org", "A", None)
            .await
            .unwrap();
        let b = auth
            .upsert_user("github", "77", "new@x.org", "A2", None)
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.email, "new@x.org");
    }

    #[tokio::test]
    async fn sessions_round_trip_and_revoke() {
        let (auth, _dir) = temp_auth().await;
        let user = auth
            .upsert_user("dev", "1", "a@x.org", "A", None)
            .await
            .unwrap();
        let session = auth.create_session(&user.id, None).await.unwrap();

        let resolved = auth.user_for_token(&session.token).await.unwrap().unwrap();
        assert_eq!(resolved.id, user.id);

        auth.logout(&session.token).await.unwrap();
        assert!(auth.user_for_token(&session.token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invites_grant_roles_once() {
        let (auth, _dir) = temp_auth().await;
        // Seed an owner so invited users are not first
        auth.upsert_user("dev", "0", "o@x.org", "O", None).await.unwrap();

        let code = auth.create_invite(Role::Admin, None).await.unwrap();
        assert_eq!(auth.redeem_invite(&code).await.unwrap(), Role::Admin);
        assert!(auth.redeem_invite(&code).await.is_err());
    }

    #[tokio::test]
    async fn login_bucket_locks_out() {
        let (auth, _dir) = temp_auth().await;
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        for _ in 0..5 {
            auth.check_login_rate(ip).unwrap();
        }
        assert!(matches!(
            auth.check_login_rate(ip),
            Err(FaztError::RateLimited)
        ));
        // Other IPs unaffected
        auth.check_login_rate("10.0.0.2".parse().unwrap()).unwrap();
    }

    #[test]
    fn session_cookie_attributes() {
        let c = Auth::session_cookie("tok", "example.com", true);
        assert!(c.contains("HttpOnly"));
        assert!(c.contains("SameSite=Lax"));
        assert!(c.contains("Secure"));
        assert!(c.contains("Domain=example.com"));

        let local = Auth::session_cookie("tok", "localhost", false);
        assert!(!local.contains("Domain="));
        assert!(!local.contains("Secure"));
    }

    #[test]
    fn cookie_header_parsing() {
        let header = "a=1; fazt_session=tok123; b=2";
        assert_eq!(cookie_value(header, SESSION_COOKIE).unwrap(), "tok123");
        assert!(cookie_value(header, "missing").is_none());
    }
}
