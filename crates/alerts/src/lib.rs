//! Alert dispatch: event parsing, dedup + rate limiting, channel fan-out,
//! delivery retries, and persistence hooks.

pub mod channels;
pub mod dispatcher;
pub mod retry;
pub mod throttle;

pub use channels::{AlertChannel, SlackChannel, WebSocketChannel, WebhookChannel};
pub use dispatcher::{AlertDispatcher, AlertSink, ConfiguredChannel};
pub use retry::{RetryTask, RetryWorker};
pub use throttle::{MemorySuppression, RedisSuppression, SuppressionStore};
