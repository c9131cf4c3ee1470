//! WebSocket upgrade for the realtime transport
//!
//! `GET /_ws` on any app host upgrades into a pub/sub client scoped to that
//! app. The connection task handles heartbeat and frame dispatch.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use std::sync::Arc;
use tracing::error;

use crate::pubsub;
use crate::routes::HttpResponse;
use crate::server::http::AppState;

pub async fn handle_upgrade(
    state: Arc<AppState>,
    req: Request<Incoming>,
    app_id: &str,
) -> HttpResponse {
    if !hyper_tungstenite::is_upgrade_request(&req) {
        return Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(Full::new(Bytes::from_static(
                b"websocket upgrade required for /_ws",
            )))
            .unwrap();
    }

    match hyper_tungstenite::upgrade(req, None) {
        Ok((response, websocket)) => {
            let registry = Arc::clone(&state.registry);
            let app_id = app_id.to_string();
            tokio::spawn(async move {
                match websocket.await {
                    Ok(ws) => pubsub::client::run(registry, app_id, ws).await,
                    Err(e) => error!("websocket handshake failed: {e}"),
                }
            });

            let (parts, _) = response.into_parts();
            Response::from_parts(parts, Full::new(Bytes::new()))
        }
        Err(e) => {
            error!("websocket upgrade error: {e}");
            Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(Full::new(Bytes::from(format!("upgrade failed: {e}"))))
                .unwrap()
        }
    }
}
