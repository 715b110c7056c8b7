//! Delivery channel contract and built-in transports.

pub mod slack;
pub mod webhook;
pub mod websocket;

pub use slack::SlackChannel;
pub use webhook::WebhookChannel;
pub use websocket::WebSocketChannel;

use async_trait::async_trait;

use voxsentinel_common::models::Alert;

/// Contract every alert delivery channel implements.
///
/// `send` returns `Ok(true)` on confirmed delivery, `Ok(false)` on a clean
/// refusal; both `Ok(false)` and `Err` make the dispatcher enqueue a retry.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    /// Channel name used in delivery tracking and logs.
    fn name(&self) -> &str;

    /// Runtime kill switch; a disabled channel is skipped, not removed.
    fn enabled(&self) -> bool {
        true
    }

    async fn send(&self, alert: &Alert) -> anyhow::Result<bool>;

    /// Releases transport resources.
    async fn close(&self) {}
}
