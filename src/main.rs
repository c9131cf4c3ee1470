//! Fazt - one binary, one database, many apps

use clap::Parser;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fazt::auth::providers::ProviderRegistry;
use fazt::auth::Auth;
use fazt::config::Args;
use fazt::edge::{EdgeLimiter, TlsFront};
use fazt::events::EventBuffer;
use fazt::pubsub::Registry;
use fazt::script::ScriptPool;
use fazt::server::AppState;
use fazt::store::Store;
use fazt::vfs::Vfs;
use fazt::worker::{WorkerLimits, WorkerPool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let mut args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("fazt={log_level},info").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    // Portable database: override machine-specific domains that no longer
    // match this machine. Real DNS names are trusted unconditionally -
    // overriding them has broken production deployments before.
    if args.domain_is_machine_specific() {
        if let Some(local_ip) = detect_local_ip() {
            if args.domain != local_ip && !args.domain.ends_with(".nip.io") {
                warn!(
                    configured = %args.domain,
                    detected = %local_ip,
                    "configured domain looks machine-specific and stale; using detected IP"
                );
                args.domain = local_ip;
            }
        }
    }

    let db_path = args.db_path();

    info!("======================================");
    info!("  Fazt - sovereign PaaS");
    info!("  one binary, one database, many apps");
    info!("======================================");
    info!("Domain: {}", args.domain);
    info!("Listen: {}", args.listen);
    info!("Database: {}", db_path.display());
    info!(
        "Mode: {}",
        if args.local_mode { "LOCAL" } else { "PRODUCTION" }
    );
    info!("Script pool: {} contexts", args.script_pool_size);
    info!(
        "Worker budget: {} MiB, {} concurrent",
        args.worker_memory_bytes / (1024 * 1024),
        args.worker_max_concurrent
    );
    info!("======================================");

    // Migration failure is fatal by contract
    let store = match Store::open(&db_path) {
        Ok(store) => store,
        Err(e) => {
            error!("Store open failed: {}", e);
            std::process::exit(1);
        }
    };

    let registry = Arc::new(Registry::new());
    let events = EventBuffer::start(store.clone(), Arc::clone(&registry));
    let vfs = Arc::new(Vfs::new(store.clone(), args.vfs_cache_bytes));
    let aliases = fazt::alias::AliasMap::new(store.clone(), &args.domain);
    let scripts = Arc::new(ScriptPool::new(args.script_pool_size));
    let workers = WorkerPool::new(
        store.clone(),
        Arc::clone(&vfs),
        Arc::clone(&registry),
        Arc::clone(&events),
        WorkerLimits {
            memory_bytes: args.worker_memory_bytes,
            max_concurrent: args.worker_max_concurrent,
            max_per_app: args.worker_max_per_app,
            max_daemons_per_app: args.worker_max_daemons_per_app,
        },
    );
    let auth = Arc::new(Auth::new(store.clone(), Arc::clone(&events)));
    let providers = ProviderRegistry::from_env();
    if providers.names().is_empty() && !args.local_mode {
        warn!("no OAuth providers configured; only invited flows will work");
    } else if !providers.names().is_empty() {
        info!("OAuth providers: {}", providers.names().join(", "));
    }

    // Certificate provisioning starts before serve so the TLS config is
    // valid on first accept; fatal only without a cached certificate.
    let tls = if args.local_mode {
        None
    } else {
        match TlsFront::new(
            store.clone(),
            &args.domain,
            args.acme_email.as_deref(),
            &args.acme_directory,
        )
        .await
        {
            Ok(front) => {
                front.spawn_provision(args.admin_host(), false);
                Some(front)
            }
            Err(e) => {
                error!("Certificate provisioning failed with no cached cert: {}", e);
                std::process::exit(1);
            }
        }
    };

    let rate_limiter = EdgeLimiter::new(args.rate_limit_rps, args.rate_limit_burst);

    let state = Arc::new(AppState {
        args,
        store,
        vfs,
        aliases,
        scripts,
        workers,
        registry,
        events,
        auth,
        providers,
        rate_limiter,
        tls,
        started_at: Instant::now(),
    });

    if let Err(e) = fazt::server::run(state).await {
        error!("Server error: {:?}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Best-effort local IP detection via a UDP socket that never sends
fn detect_local_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}
