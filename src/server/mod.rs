//! Server composition and accept loops
//!
//! Production: a TLS listener on the main address plus a plain-HTTP listener
//! on port 80 answering ACME challenges and redirecting everything else to
//! https. Local mode: one plain-HTTP listener, dev provider enabled. Both
//! sit behind the connection limiter.

pub mod http;
pub mod websocket;

pub use http::AppState;

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{error, info, warn};

use crate::edge::{ConnGuard, ConnLimiter};
use crate::types::Result;

/// Start background tasks and serve until the process exits
pub async fn run(state: Arc<AppState>) -> Result<()> {
    spawn_background_tasks(&state);

    let restored = state.workers.restore_daemons().await?;
    if restored > 0 {
        info!(count = restored, "daemons restored from checkpoints");
    }

    if state.args.local_mode {
        info!("local mode: serving plain HTTP, dev auth provider enabled");
        let limiter = ConnLimiter::bind(
            state.args.listen,
            state.args.max_conns,
            state.args.max_conns_per_ip,
        )?;
        serve_plain(state, limiter).await
    } else {
        // ACME challenges and https redirects on port 80, also limited
        let http_limiter = ConnLimiter::bind(
            state.args.http_listen,
            state.args.max_conns,
            state.args.max_conns_per_ip,
        )?;
        let challenge_state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = serve_challenge_listener(challenge_state, http_limiter).await {
                error!("http listener failed: {e}");
            }
        });

        let limiter = ConnLimiter::bind(
            state.args.listen,
            state.args.max_conns,
            state.args.max_conns_per_ip,
        )?;
        serve_tls(state, limiter).await
    }
}

fn spawn_background_tasks(state: &Arc<AppState>) {
    state.rate_limiter.spawn_eviction_task();

    // Lazy TTL sweep for expired KV rows
    let store = state.store.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match crate::storage::kv::sweep_expired(&store).await {
                Ok(0) => {}
                Ok(n) => info!(swept = n, "expired KV rows removed"),
                Err(e) => warn!("KV sweep failed: {e}"),
            }
        }
    });
}

async fn serve_plain(state: Arc<AppState>, limiter: ConnLimiter) -> Result<()> {
    info!(addr = %limiter.local_addr()?, "serving HTTP");
    loop {
        let (stream, addr, guard) = limiter.accept().await?;
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            serve_connection(state, stream, addr, guard, false).await;
        });
    }
}

async fn serve_tls(state: Arc<AppState>, limiter: ConnLimiter) -> Result<()> {
    let tls = state
        .tls
        .clone()
        .expect("TLS front must exist outside local mode");
    info!(addr = %limiter.local_addr()?, "serving HTTPS");

    loop {
        let (stream, addr, guard) = limiter.accept().await?;
        let state = Arc::clone(&state);
        let acceptor = tls.acceptor();
        tokio::spawn(async move {
            // TLS handshake with its own deadline; handshake stragglers do
            // not hold a connection slot open
            let handshake =
                tokio::time::timeout(Duration::from_secs(10), acceptor.accept(stream)).await;
            match handshake {
                Ok(Ok(tls_stream)) => {
                    serve_tls_connection(state, tls_stream, addr, guard).await;
                }
                Ok(Err(e)) => warn!(%addr, "TLS handshake failed: {e}"),
                Err(_) => warn!(%addr, "TLS handshake timed out"),
            }
        });
    }
}

async fn serve_connection(
    state: Arc<AppState>,
    stream: TcpStream,
    addr: std::net::SocketAddr,
    guard: ConnGuard,
    over_tls: bool,
) {
    let header_timeout = Duration::from_secs(state.args.header_timeout_secs);
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { Ok::<_, hyper::Error>(http::handle_request(state, addr, req, over_tls).await) }
    });

    if let Err(e) = http1::Builder::new()
        .header_read_timeout(header_timeout)
        .serve_connection(io, service)
        .with_upgrades()
        .await
    {
        // Client disconnects during keep-alive are routine
        tracing::debug!(%addr, "connection ended: {e}");
    }
    drop(guard);
}

async fn serve_tls_connection(
    state: Arc<AppState>,
    stream: tokio_rustls::server::TlsStream<TcpStream>,
    addr: std::net::SocketAddr,
    guard: ConnGuard,
) {
    let header_timeout = Duration::from_secs(state.args.header_timeout_secs);
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { Ok::<_, hyper::Error>(http::handle_request(state, addr, req, true).await) }
    });

    if let Err(e) = http1::Builder::new()
        .header_read_timeout(header_timeout)
        .serve_connection(io, service)
        .with_upgrades()
        .await
    {
        tracing::debug!(%addr, "connection ended: {e}");
    }
    drop(guard);
}

/// Port-80 listener: ACME challenge answers, https redirect for the rest
async fn serve_challenge_listener(state: Arc<AppState>, limiter: ConnLimiter) -> Result<()> {
    info!(addr = %limiter.local_addr()?, "HTTP listener up (ACME + redirect)");
    loop {
        let (stream, addr, guard) = limiter.accept().await?;
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let state = Arc::clone(&state);
                async move { Ok::<_, hyper::Error>(handle_http_80(state, req)) }
            });
            if let Err(e) = http1::Builder::new()
                .header_read_timeout(Duration::from_secs(5))
                .serve_connection(io, service)
                .await
            {
                tracing::debug!(%addr, "http connection ended: {e}");
            }
            drop(guard);
        });
    }
}

fn handle_http_80(
    state: Arc<AppState>,
    req: Request<hyper::body::Incoming>,
) -> Response<Full<Bytes>> {
    let path = req.uri().path();

    if let Some(token) = path.strip_prefix("/.well-known/acme-challenge/") {
        if let Some(tls) = &state.tls {
            if let Some(key_auth) = tls.challenges.answer(token) {
                return Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "text/plain")
                    .body(Full::new(Bytes::from(key_auth)))
                    .unwrap();
            }
        }
        return Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"unknown challenge")))
            .unwrap();
    }

    let host = req
        .headers()
        .get("host")
        .and_then(|h| h.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_string())
        .unwrap_or_else(|| state.args.domain.clone());
    let location = format!("https://{host}{}", req.uri());
    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header("Location", location)
        .body(Full::new(Bytes::new()))
        .unwrap()
}
