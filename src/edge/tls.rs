//! TLS termination and certificate management
//!
//! Certificates live in the certs table so the database stays the single
//! portable artifact. Provisioning runs before serve starts: ACME when an
//! email is configured, a self-signed wildcard as the local fallback. An
//! ACME failure is fatal only when there is no cached certificate to serve
//! with; otherwise the cached one is used and provisioning retries in the
//! background.

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio_rustls::rustls::crypto::ring::sign::any_supported_type;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use super::acme::{AcmeClient, ChallengeStore};
use crate::store::Store;
use crate::types::{FaztError, Result};

/// Certificates older than this are re-provisioned
const RENEW_AFTER_DAYS: i64 = 60;

/// SNI resolver over in-memory certified keys with a fallback
pub struct CertResolver {
    by_domain: DashMap<String, Arc<CertifiedKey>>,
    fallback: std::sync::RwLock<Option<Arc<CertifiedKey>>>,
}

impl std::fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertResolver")
            .field("domains", &self.by_domain.len())
            .field("has_fallback", &self.fallback.read().unwrap().is_some())
            .finish()
    }
}

impl CertResolver {
    fn new() -> Self {
        Self {
            by_domain: DashMap::new(),
            fallback: std::sync::RwLock::new(None),
        }
    }

    fn install(&self, domain: &str, key: Arc<CertifiedKey>, fallback: bool) {
        self.by_domain.insert(domain.to_string(), Arc::clone(&key));
        if fallback {
            *self.fallback.write().unwrap() = Some(key);
        }
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        if let Some(name) = client_hello.server_name() {
            if let Some(key) = self.by_domain.get(name) {
                return Some(Arc::clone(&key));
            }
            // Wildcard-style match on the parent domain
            if let Some((_, parent)) = name.split_once('.') {
                if let Some(key) = self.by_domain.get(parent) {
                    return Some(Arc::clone(&key));
                }
            }
        }
        self.fallback.read().unwrap().clone()
    }
}

/// Certificate manager + acceptor composition
pub struct TlsFront {
    store: Store,
    resolver: Arc<CertResolver>,
    acceptor: TlsAcceptor,
    pub challenges: Arc<ChallengeStore>,
    acme: Option<Arc<AcmeClient>>,
    root_domain: String,
}

impl TlsFront {
    /// Build the TLS configuration and kick off certificate provisioning
    /// for the root domain. Returns an error (startup fatal) only when
    /// provisioning fails AND no cached certificate exists.
    pub async fn new(
        store: Store,
        root_domain: &str,
        acme_email: Option<&str>,
        acme_directory: &str,
    ) -> Result<Arc<Self>> {
        let resolver = Arc::new(CertResolver::new());
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::clone(&resolver) as Arc<dyn ResolvesServerCert>);
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let front = Arc::new(Self {
            store,
            resolver,
            acceptor,
            challenges: Arc::new(ChallengeStore::new()),
            acme: acme_email.map(|email| Arc::new(AcmeClient::new(acme_directory, email))),
            root_domain: root_domain.to_string(),
        });

        front.ensure_cert(root_domain, true).await?;
        Ok(front)
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        self.acceptor.clone()
    }

    /// Make a certificate available for a domain: fresh cache hit, ACME
    /// provisioning, or (without ACME) a self-signed fallback.
    pub async fn ensure_cert(self: &Arc<Self>, domain: &str, fallback: bool) -> Result<()> {
        if let Some((cert_pem, key_pem, updated_at)) = self.load_cached(domain).await? {
            let fresh = Utc::now() - updated_at < ChronoDuration::days(RENEW_AFTER_DAYS);
            self.install_pem(domain, &cert_pem, &key_pem, fallback)?;
            if fresh {
                return Ok(());
            }
            // Stale but usable: serve it and renew in the background
            info!(domain, "cached certificate stale, renewing in background");
            self.spawn_provision(domain.to_string(), fallback);
            return Ok(());
        }

        match self.provision(domain).await {
            Ok((cert_pem, key_pem)) => {
                self.persist(domain, &cert_pem, &key_pem).await?;
                self.install_pem(domain, &cert_pem, &key_pem, fallback)?;
                Ok(())
            }
            // No cached certificate to fall back to: fatal by contract
            Err(e) => Err(e),
        }
    }

    /// Provisioning for alias subdomains, retried in the background
    pub fn spawn_provision(self: &Arc<Self>, domain: String, fallback: bool) {
        let front = Arc::clone(self);
        tokio::spawn(async move {
            let mut delay = std::time::Duration::from_secs(5);
            for _ in 0..5 {
                match front.provision(&domain).await {
                    Ok((cert_pem, key_pem)) => {
                        if let Err(e) = front.persist(&domain, &cert_pem, &key_pem).await {
                            warn!(domain, "certificate persist failed: {e}");
                        }
                        if let Err(e) = front.install_pem(&domain, &cert_pem, &key_pem, fallback) {
                            warn!(domain, "certificate install failed: {e}");
                        }
                        return;
                    }
                    Err(e) => {
                        warn!(domain, "certificate provisioning failed, retrying: {e}");
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(std::time::Duration::from_secs(300));
                    }
                }
            }
        });
    }

    async fn provision(&self, domain: &str) -> Result<(String, String)> {
        match &self.acme {
            Some(acme) => {
                let issued = acme.provision(domain, &self.challenges).await?;
                Ok((issued.cert_pem, issued.key_pem))
            }
            None => {
                // Local mode: self-signed covering the domain and one level
                // of subdomains
                let cert = rcgen::generate_simple_self_signed(vec![
                    domain.to_string(),
                    format!("*.{domain}"),
                ])
                .map_err(|e| FaztError::CertProvision(format!("self-signed: {e}")))?;
                Ok((cert.cert.pem(), cert.key_pair.serialize_pem()))
            }
        }
    }

    fn install_pem(
        &self,
        domain: &str,
        cert_pem: &str,
        key_pem: &str,
        fallback: bool,
    ) -> Result<()> {
        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut cert_pem.as_bytes())
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| FaztError::CertProvision(format!("cert parse: {e}")))?;
        if certs.is_empty() {
            return Err(FaztError::CertProvision("no certificates in PEM".into()));
        }
        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_bytes())
            .map_err(|e| FaztError::CertProvision(format!("key parse: {e}")))?
            .ok_or_else(|| FaztError::CertProvision("no private key in PEM".into()))?;
        let signing_key = any_supported_type(&key)
            .map_err(|e| FaztError::CertProvision(format!("unsupported key: {e}")))?;

        let certified = Arc::new(CertifiedKey::new(certs, signing_key));
        self.resolver.install(domain, certified, fallback);
        info!(domain, "certificate installed");
        Ok(())
    }

    async fn load_cached(
        &self,
        domain: &str,
    ) -> Result<Option<(String, String, chrono::DateTime<Utc>)>> {
        let domain = domain.to_string();
        self.store
            .read(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT cert_pem, key_pem, updated_at FROM certs WHERE domain = ?1",
                )?;
                let mut rows = stmt.query([domain])?;
                match rows.next()? {
                    Some(r) => {
                        let cert: String = r.get(0)?;
                        let key: String = r.get(1)?;
                        let updated: String = r.get(2)?;
                        let updated = chrono::DateTime::parse_from_rfc3339(&updated)
                            .map(|dt| dt.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now() - ChronoDuration::days(365));
                        Ok(Some((cert, key, updated)))
                    }
                    None => Ok(None),
                }
            })
            .await
    }

    async fn persist(&self, domain: &str, cert_pem: &str, key_pem: &str) -> Result<()> {
        let domain = domain.to_string();
        let cert = cert_pem.to_string();
        let key = key_pem.to_string();
        let now = Utc::now().to_rfc3339();
        self.store
            .writes()
            .submit(move |tx| {
                tx.execute(
                    "INSERT INTO certs (domain, cert_pem, key_pem, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (domain) DO UPDATE SET
                       cert_pem = excluded.cert_pem,
                       key_pem = excluded.key_pem,
                       updated_at = excluded.updated_at",
                    rusqlite::params![domain, cert, key, now],
                )?;
                Ok(())
            })
            .await
    }

    pub fn root_domain(&self) -> &str {
        &self.root_domain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_front() -> (Arc<TlsFront>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("tls.db")).unwrap();
        // No ACME email: self-signed path
        let front = TlsFront::new(store, "example.test", None, "https://unused.invalid")
            .await
            .unwrap();
        (front, dir)
    }

    #[tokio::test]
    async fn self_signed_provisioning_installs_and_persists() {
        let (front, _dir) = temp_front().await;
        let cached = front.load_cached("example.test").await.unwrap();
        assert!(cached.is_some());
        assert!(front.resolver.by_domain.contains_key("example.test"));
        assert!(front.resolver.fallback.read().unwrap().is_some());
    }

    #[tokio::test]
    async fn cached_cert_is_reused() {
        let (front, dir) = temp_front().await;
        let (first_pem, _, _) = front.load_cached("example.test").await.unwrap().unwrap();

        // Reopen against the same database; the cached cert must be loaded,
        // not regenerated
        let store = Store::open(&dir.path().join("tls.db")).unwrap();
        let front2 = TlsFront::new(store, "example.test", None, "https://unused.invalid")
            .await
            .unwrap();
        let (second_pem, _, _) = front2.load_cached("example.test").await.unwrap().unwrap();
        assert_eq!(first_pem, second_pem);
    }
}
