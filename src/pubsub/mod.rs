//! In-memory channel registry
//!
//! Channels are named topics for ephemeral fan-out. Subscribers hang off a
//! persistent WebSocket connection; each has a small bounded outbound buffer
//! and is kicked on overflow so one slow reader cannot stall a channel.
//!
//! Ordering: for a single channel, broadcasts are delivered in the order the
//! registry accepted them (the channel entry stays locked for the duration
//! of one fan-out). No ordering holds across channels.

pub mod client;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Outbound buffer per subscriber; overflow kicks the subscriber
pub const SUBSCRIBER_BUFFER: usize = 64;

/// Wire message for the channel transport
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Subscribe,
    Unsubscribe,
    Message,
    Ping,
    Pong,
}

impl WireMessage {
    pub fn message(channel: &str, payload: serde_json::Value) -> Self {
        Self {
            kind: MessageKind::Message,
            channel: Some(channel.to_string()),
            payload: Some(payload),
        }
    }

    pub fn ping() -> Self {
        Self {
            kind: MessageKind::Ping,
            channel: None,
            payload: None,
        }
    }
}

/// Handle to one connected client
#[derive(Clone)]
struct ClientHandle {
    app_id: String,
    tx: mpsc::Sender<WireMessage>,
}

/// Channel registry shared across the process
pub struct Registry {
    /// channel name -> subscriber ids in subscription order
    channels: DashMap<String, BTreeMap<u64, ClientHandle>>,
    /// all connected clients
    clients: DashMap<u64, ClientHandle>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            clients: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a connection; returns its client id and the outbound queue
    pub fn connect(&self, app_id: &str) -> (u64, mpsc::Receiver<WireMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.clients.insert(
            id,
            ClientHandle {
                app_id: app_id.to_string(),
                tx,
            },
        );
        debug!(client = id, app_id, "pubsub client connected");
        (id, rx)
    }

    /// Drop a connection and all of its subscriptions
    pub fn disconnect(&self, client_id: u64) {
        self.clients.remove(&client_id);
        self.channels.retain(|_, subs| {
            subs.remove(&client_id);
            !subs.is_empty()
        });
        debug!(client = client_id, "pubsub client disconnected");
    }

    pub fn subscribe(&self, client_id: u64, channel: &str) -> bool {
        let Some(handle) = self.clients.get(&client_id) else {
            return false;
        };
        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(client_id, handle.clone());
        true
    }

    pub fn unsubscribe(&self, client_id: u64, channel: &str) {
        if let Some(mut subs) = self.channels.get_mut(channel) {
            subs.remove(&client_id);
        }
        self.channels.remove_if(channel, |_, subs| subs.is_empty());
    }

    /// Live subscriber count for one channel
    pub fn subscribers(&self, channel: &str) -> usize {
        self.channels.get(channel).map(|s| s.len()).unwrap_or(0)
    }

    /// Total connected clients (optionally restricted to one app)
    pub fn count(&self, app_id: Option<&str>) -> usize {
        match app_id {
            None => self.clients.len(),
            Some(app) => self
                .clients
                .iter()
                .filter(|entry| entry.value().app_id == app)
                .count(),
        }
    }

    /// Fan a payload out to a channel. Slow subscribers whose buffers are
    /// full are kicked after the fan-out. Returns delivered count.
    pub fn broadcast(&self, channel: &str, payload: serde_json::Value) -> usize {
        let msg = WireMessage::message(channel, payload);
        let mut delivered = 0usize;
        let mut overflowed: Vec<u64> = Vec::new();

        if let Some(subs) = self.channels.get(channel) {
            // The entry guard serializes concurrent broadcasts to this
            // channel, which is what gives per-channel FIFO.
            for (id, handle) in subs.iter() {
                match handle.tx.try_send(msg.clone()) {
                    Ok(()) => delivered += 1,
                    Err(_) => overflowed.push(*id),
                }
            }
        }

        for id in overflowed {
            debug!(client = id, channel, "kicking slow subscriber");
            self.kick(id);
        }
        delivered
    }

    /// Send a payload to every client of an app regardless of subscriptions
    pub fn broadcast_all(&self, app_id: &str, payload: serde_json::Value) -> usize {
        let msg = WireMessage {
            kind: MessageKind::Message,
            channel: None,
            payload: Some(payload),
        };
        let mut delivered = 0usize;
        let mut overflowed: Vec<u64> = Vec::new();
        for entry in self.clients.iter() {
            if entry.value().app_id != app_id {
                continue;
            }
            match entry.value().tx.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => overflowed.push(*entry.key()),
            }
        }
        for id in overflowed {
            self.kick(id);
        }
        delivered
    }

    /// Forcibly disconnect a client. Dropping its outbound sender ends the
    /// connection task, which completes the cleanup.
    pub fn kick(&self, client_id: u64) {
        self.disconnect(client_id);
    }
}

/// Shared registry type used across subsystems
pub type SharedRegistry = Arc<Registry>;

/// Internal channel carrying live app log records
pub fn app_log_channel(app_id: &str) -> String {
    format!("_fazt:logs:{app_id}")
}

/// Namespace a script-facing channel name under its app
pub fn app_channel(app_id: &str, channel: &str) -> String {
    format!("{app_id}:{channel}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribe_and_broadcast() {
        let reg = Registry::new();
        let (id, mut rx) = reg.connect("app_1");
        assert!(reg.subscribe(id, "news"));
        assert_eq!(reg.subscribers("news"), 1);

        let delivered = reg.broadcast("news", json!({"n": 1}));
        assert_eq!(delivered, 1);

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.kind, MessageKind::Message);
        assert_eq!(msg.channel.as_deref(), Some("news"));
        assert_eq!(msg.payload.unwrap()["n"], 1);
    }

    #[tokio::test]
    async fn per_channel_order_preserved() {
        let reg = Registry::new();
        let (id, mut rx) = reg.connect("app_1");
        reg.subscribe(id, "seq");

        for i in 0..10 {
            reg.broadcast("seq", json!(i));
        }
        for i in 0..10 {
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.payload.unwrap(), json!(i));
        }
    }

    #[tokio::test]
    async fn slow_subscriber_is_kicked() {
        let reg = Registry::new();
        let (id, _rx) = reg.connect("app_1");
        reg.subscribe(id, "firehose");

        // Never drain: the buffer fills and the overflowing broadcast kicks
        for i in 0..(SUBSCRIBER_BUFFER + 1) {
            reg.broadcast("firehose", json!(i));
        }
        assert_eq!(reg.subscribers("firehose"), 0);
        assert_eq!(reg.count(None), 0);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let reg = Registry::new();
        let (id, mut rx) = reg.connect("app_1");
        reg.subscribe(id, "c");
        reg.unsubscribe(id, "c");
        assert_eq!(reg.broadcast("c", json!(1)), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn count_is_per_app() {
        let reg = Registry::new();
        let (_a, _rxa) = reg.connect("app_1");
        let (_b, _rxb) = reg.connect("app_2");
        assert_eq!(reg.count(None), 2);
        assert_eq!(reg.count(Some("app_1")), 1);
    }

    #[tokio::test]
    async fn disconnect_clears_empty_channels() {
        let reg = Registry::new();
        let (id, _rx) = reg.connect("app_1");
        reg.subscribe(id, "x");
        reg.disconnect(id);
        assert_eq!(reg.subscribers("x"), 0);
        assert!(reg.channels.is_empty());
    }
}
