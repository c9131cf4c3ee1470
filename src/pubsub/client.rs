//! Client connection handling for the channel transport
//!
//! One task per connection: drains the registry-side outbound queue into the
//! socket, reads subscribe/unsubscribe/message frames off the wire, and runs
//! the heartbeat. A missed pong or an outbound overflow (sender dropped by a
//! kick) closes the connection.

use futures_util::{SinkExt, StreamExt};
use hyper_tungstenite::WebSocketStream;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, timeout_at, Instant};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::{app_channel, MessageKind, Registry, WireMessage};

/// Ping cadence
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// How long a pong may lag before the connection is closed
pub const PONG_TIMEOUT: Duration = Duration::from_secs(10);

type Socket = WebSocketStream<TokioIo<hyper::upgrade::Upgraded>>;

/// Run one client connection until it closes, errs, or is kicked.
pub async fn run(registry: Arc<Registry>, app_id: String, ws: Socket) {
    let (client_id, mut outbound) = registry.connect(&app_id);
    let (mut sink, mut stream) = ws.split();

    let mut heartbeat = interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately; skip it so the first ping waits a period
    heartbeat.tick().await;

    let mut awaiting_pong: Option<Instant> = None;

    loop {
        let pong_deadline = awaiting_pong.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            // Outbound: registry -> socket. None means we were kicked.
            maybe_msg = outbound.recv() => {
                match maybe_msg {
                    Some(msg) => {
                        let text = match serde_json::to_string(&msg) {
                            Ok(t) => t,
                            Err(e) => {
                                warn!(client = client_id, "unserializable outbound message: {e}");
                                continue;
                            }
                        };
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        debug!(client = client_id, "outbound closed (kicked)");
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            // Inbound: socket -> registry
            maybe_frame = stream.next() => {
                match maybe_frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<WireMessage>(&text) {
                            Ok(msg) => handle_frame(&registry, client_id, &app_id, msg, &mut awaiting_pong),
                            Err(e) => debug!(client = client_id, "ignoring malformed frame: {e}"),
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        awaiting_pong = None;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames ignored
                    Some(Err(e)) => {
                        debug!(client = client_id, "socket error: {e}");
                        break;
                    }
                }
            }

            // Heartbeat: issue a ping and arm the pong deadline
            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                // JSON-level ping too, for clients that speak only frames
                let ping = serde_json::to_string(&WireMessage::ping()).expect("static shape");
                let _ = sink.send(Message::Text(ping.into())).await;
                if awaiting_pong.is_none() {
                    awaiting_pong = Some(Instant::now() + PONG_TIMEOUT);
                }
            }

            // Pong deadline passed without an answer
            _ = timeout_at(pong_deadline, std::future::pending::<()>()), if awaiting_pong.is_some() => {
                warn!(client = client_id, "pong timeout, closing");
                break;
            }
        }
    }

    registry.disconnect(client_id);
}

fn handle_frame(
    registry: &Registry,
    client_id: u64,
    app_id: &str,
    msg: WireMessage,
    awaiting_pong: &mut Option<Instant>,
) {
    match msg.kind {
        MessageKind::Subscribe => {
            if let Some(channel) = msg.channel {
                registry.subscribe(client_id, &app_channel(app_id, &channel));
            }
        }
        MessageKind::Unsubscribe => {
            if let Some(channel) = msg.channel {
                registry.unsubscribe(client_id, &app_channel(app_id, &channel));
            }
        }
        MessageKind::Message => {
            if let (Some(channel), Some(payload)) = (msg.channel, msg.payload) {
                registry.broadcast(&app_channel(app_id, &channel), payload);
            }
        }
        MessageKind::Pong => {
            *awaiting_pong = None;
        }
        MessageKind::Ping => {
            // JSON-level ping from the client; no state to update
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_messages_round_trip() {
        let msg = WireMessage::message("news", json!({"a": 1}));
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains("\"type\":\"message\""));
        let back: WireMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn subscribe_frame_parses() {
        let msg: WireMessage =
            serde_json::from_str(r#"{"type":"subscribe","channel":"chat"}"#).unwrap();
        assert_eq!(msg.kind, MessageKind::Subscribe);
        assert_eq!(msg.channel.as_deref(), Some("chat"));
        assert!(msg.payload.is_none());
    }

    #[test]
    fn frames_update_registry() {
        let registry = Registry::new();
        let (id, _rx) = registry.connect("app_1");
        let mut awaiting = None;

        handle_frame(
            &registry,
            id,
            "app_1",
            serde_json::from_str(r#"{"type":"subscribe","channel":"c"}"#).unwrap(),
            &mut awaiting,
        );
        assert_eq!(registry.subscribers(&app_channel("app_1", "c")), 1);

        handle_frame(
            &registry,
            id,
            "app_1",
            serde_json::from_str(r#"{"type":"unsubscribe","channel":"c"}"#).unwrap(),
            &mut awaiting,
        );
        assert_eq!(registry.subscribers(&app_channel("app_1", "c")), 0);
    }

    #[test]
    fn pong_frame_clears_deadline() {
        let registry = Registry::new();
        let (id, _rx) = registry.connect("app_1");
        let mut awaiting = Some(Instant::now());
        handle_frame(
            &registry,
            id,
            "app_1",
            serde_json::from_str(r#"{"type":"pong"}"#).unwrap(),
            &mut awaiting,
        );
        assert!(awaiting.is_none());
    }
}
