//! Configuration for Fazt
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

/// Fazt - sovereign PaaS: one binary, one database, many apps
#[derive(Parser, Debug, Clone)]
#[command(name = "fazt")]
#[command(about = "Single-binary multi-tenant app host")]
pub struct Args {
    /// Address to listen on for HTTPS (or plain HTTP in local mode)
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:443")]
    pub listen: SocketAddr,

    /// Address for the plain-HTTP listener (ACME challenges + https redirect)
    #[arg(long, env = "HTTP_LISTEN", default_value = "0.0.0.0:80")]
    pub http_listen: SocketAddr,

    /// Root domain apps hang off of (e.g. example.com serves my-app.example.com)
    #[arg(long, env = "FAZT_DOMAIN", default_value = "localhost")]
    pub domain: String,

    /// Database file path (highest precedence; see db_path() for fallbacks)
    #[arg(long, env = "FAZT_DB")]
    pub db: Option<PathBuf>,

    /// Run without TLS and enable the dev auth provider
    #[arg(long, env = "LOCAL_MODE", default_value = "false")]
    pub local_mode: bool,

    /// ACME account contact email (required for certificate provisioning)
    #[arg(long, env = "ACME_EMAIL")]
    pub acme_email: Option<String>,

    /// ACME directory URL
    #[arg(
        long,
        env = "ACME_DIRECTORY",
        default_value = "https://acme-v02.api.letsencrypt.org/directory"
    )]
    pub acme_directory: String,

    /// Maximum concurrent accepted connections
    #[arg(long, env = "MAX_CONNS", default_value = "1024")]
    pub max_conns: usize,

    /// Maximum concurrent connections per source IP
    #[arg(long, env = "MAX_CONNS_PER_IP", default_value = "64")]
    pub max_conns_per_ip: usize,

    /// Sustained per-IP request rate (requests per second)
    #[arg(long, env = "RATE_LIMIT_RPS", default_value = "500")]
    pub rate_limit_rps: u32,

    /// Per-IP request burst allowance
    #[arg(long, env = "RATE_LIMIT_BURST", default_value = "1000")]
    pub rate_limit_burst: u32,

    /// Read-header deadline in seconds
    #[arg(long, env = "HEADER_TIMEOUT_SECS", default_value = "5")]
    pub header_timeout_secs: u64,

    /// Script context pool size
    #[arg(long, env = "SCRIPT_POOL_SIZE", default_value = "100")]
    pub script_pool_size: usize,

    /// Handler CPU-time cap in milliseconds
    #[arg(long, env = "SCRIPT_TIMEOUT_MS", default_value = "5000")]
    pub script_timeout_ms: u64,

    /// VFS cache budget in bytes
    #[arg(long, env = "VFS_CACHE_BYTES", default_value = "67108864")]
    pub vfs_cache_bytes: usize,

    /// Process-wide worker memory budget in bytes
    #[arg(long, env = "WORKER_MEMORY_BYTES", default_value = "268435456")]
    pub worker_memory_bytes: u64,

    /// Maximum concurrent worker jobs
    #[arg(long, env = "WORKER_MAX_CONCURRENT", default_value = "20")]
    pub worker_max_concurrent: usize,

    /// Maximum concurrent worker jobs per app
    #[arg(long, env = "WORKER_MAX_PER_APP", default_value = "5")]
    pub worker_max_per_app: usize,

    /// Maximum daemons per app
    #[arg(long, env = "WORKER_MAX_DAEMONS_PER_APP", default_value = "2")]
    pub worker_max_daemons_per_app: usize,

    /// App id of the universal 404 app, if one is deployed
    #[arg(long, env = "UNIVERSAL_404_APP")]
    pub universal_404_app: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Subdomains that are never resolvable through the alias table
pub const RESERVED_SUBDOMAINS: &[&str] = &["admin", "root", "404"];

/// Handler route prefix on the tenant edge
pub const HANDLER_PREFIX: &str = "/api/";

impl Args {
    /// Validate cross-field constraints before serving
    pub fn validate(&self) -> Result<(), String> {
        if self.domain.trim().is_empty() {
            return Err("domain must not be empty".into());
        }
        if !self.local_mode && self.acme_email.is_none() {
            return Err("ACME_EMAIL is required outside local mode".into());
        }
        if self.max_conns == 0 || self.max_conns_per_ip == 0 {
            return Err("connection caps must be positive".into());
        }
        if self.max_conns_per_ip > self.max_conns {
            return Err("per-IP cap cannot exceed the global connection cap".into());
        }
        if self.rate_limit_rps == 0 || self.rate_limit_burst < self.rate_limit_rps {
            return Err("rate limit burst must be >= sustained rate".into());
        }
        if self.script_pool_size == 0 {
            return Err("script pool size must be positive".into());
        }
        Ok(())
    }

    /// Effective database path, highest precedence first: explicit flag or
    /// FAZT_DB env (both land in `db`), systemd working directory when
    /// installed as a service, then `~/.fazt/data.db`.
    pub fn db_path(&self) -> PathBuf {
        if let Some(ref p) = self.db {
            return p.clone();
        }
        if std::env::var_os("INVOCATION_ID").is_some() {
            if let Ok(cwd) = std::env::current_dir() {
                return cwd.join("data.db");
            }
        }
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        home.join(".fazt").join("data.db")
    }

    /// Admin host for the control plane (`admin.{domain}`)
    pub fn admin_host(&self) -> String {
        format!("admin.{}", self.domain)
    }

    /// True when the configured domain is machine-specific: a bare IP or a
    /// nip.io-style magic domain. Real DNS names are trusted unconditionally,
    /// even when unreachable locally; overriding them has broken deployments.
    pub fn domain_is_machine_specific(&self) -> bool {
        if self.domain.parse::<IpAddr>().is_ok() {
            return true;
        }
        self.domain.ends_with(".nip.io")
    }
}

/// Curated environment for handler scripts: only variables the operator
/// explicitly prefixed with `FAZT_ENV_` are exposed, with the prefix
/// stripped. Process secrets never leak in by default.
pub fn curated_env() -> std::collections::HashMap<String, String> {
    std::env::vars()
        .filter_map(|(k, v)| k.strip_prefix("FAZT_ENV_").map(|name| (name.to_string(), v)))
        .collect()
}

/// Check whether a request host counts as local for dev-provider gating
pub fn is_local_host(host: &str) -> bool {
    let host = host.split(':').next().unwrap_or(host);
    host == "localhost"
        || host.starts_with("127.")
        || host.ends_with(".nip.io")
        || host.ends_with(".local")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args::parse_from(["fazt", "--local-mode", "--domain", "localhost"])
    }

    #[test]
    fn local_mode_needs_no_acme_email() {
        assert!(base_args().validate().is_ok());
    }

    #[test]
    fn production_requires_acme_email() {
        let mut args = base_args();
        args.local_mode = false;
        assert!(args.validate().is_err());
    }

    #[test]
    fn machine_specific_domains_detected() {
        let mut args = base_args();
        args.domain = "10.1.2.3".into();
        assert!(args.domain_is_machine_specific());
        args.domain = "10-1-2-3.nip.io".into();
        assert!(args.domain_is_machine_specific());
        args.domain = "example.com".into();
        assert!(!args.domain_is_machine_specific());
    }

    #[test]
    fn local_hosts_recognized() {
        assert!(is_local_host("localhost:8080"));
        assert!(is_local_host("127.0.0.1"));
        assert!(is_local_host("myapp.10-0-0-1.nip.io"));
        assert!(!is_local_host("example.com"));
    }

    #[test]
    fn explicit_db_flag_wins() {
        let args = Args::parse_from(["fazt", "--local-mode", "--db", "/tmp/x.db"]);
        assert_eq!(args.db_path(), PathBuf::from("/tmp/x.db"));
    }
}
