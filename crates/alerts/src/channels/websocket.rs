//! WebSocket broadcast channel: pushes alerts to registered dashboard
//! clients per stream, pruning stale connections on failed sends.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use voxsentinel_common::models::Alert;

use super::AlertChannel;

/// A registered client: the outbound half of its socket.
type ClientSender = mpsc::UnboundedSender<String>;

/// Broadcasts alerts to per-stream client registries. Clients register
/// the sending half of their connection; whatever serves the socket
/// (outside this crate) forwards the strings onto the wire.
pub struct WebSocketChannel {
    name: String,
    /// stream_id -> connected clients; nil key holds all-stream clients.
    clients: DashMap<Uuid, Vec<ClientSender>>,
    enabled: bool,
}

impl WebSocketChannel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            clients: DashMap::new(),
            enabled: true,
        }
    }

    /// Registers a client for one stream's alerts.
    pub fn register(&self, stream_id: Uuid, sender: ClientSender) {
        self.clients.entry(stream_id).or_default().push(sender);
    }

    /// Registers a client receiving alerts for every stream.
    pub fn register_all_streams(&self, sender: ClientSender) {
        self.register(Uuid::nil(), sender);
    }

    pub fn client_count(&self) -> usize {
        self.clients.iter().map(|e| e.value().len()).sum()
    }

    /// Sends `payload` to every client of `stream_id`, dropping clients
    /// whose connection has gone away. Returns the delivery count.
    fn broadcast(&self, stream_id: Uuid, payload: &str) -> usize {
        let mut delivered = 0;
        if let Some(mut entry) = self.clients.get_mut(&stream_id) {
            entry.retain(|client| {
                if client.send(payload.to_string()).is_ok() {
                    delivered += 1;
                    true
                } else {
                    false
                }
            });
        }
        delivered
    }
}

#[async_trait]
impl AlertChannel for WebSocketChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    async fn send(&self, alert: &Alert) -> anyhow::Result<bool> {
        let payload = serde_json::to_string(alert)?;
        let delivered =
            self.broadcast(alert.stream_id, &payload) + self.broadcast(Uuid::nil(), &payload);
        debug!(channel = %self.name, delivered, "websocket broadcast");
        Ok(delivered > 0)
    }

    async fn close(&self) {
        self.clients.clear();
    }
}
