//! Delivery retry worker: bounded attempts with exponential backoff,
//! retrying only the channel that failed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use voxsentinel_common::models::Alert;

use crate::channels::AlertChannel;

/// One failed delivery queued for retry.
#[derive(Debug, Clone)]
pub struct RetryTask {
    pub alert_json: String,
    pub channel_name: String,
}

/// Worker draining the retry queue. Each task gets at most `max_retries`
/// attempts with `base_delay * 2^(n-1)` backoff; exhaustion abandons the
/// delivery with an error log.
pub struct RetryWorker {
    channels: HashMap<String, Arc<dyn AlertChannel>>,
    max_retries: u32,
    base_delay: Duration,
}

impl RetryWorker {
    pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(5);

    pub fn new(
        channels: HashMap<String, Arc<dyn AlertChannel>>,
        max_retries: u32,
        base_delay: Duration,
    ) -> Self {
        Self {
            channels,
            max_retries,
            base_delay,
        }
    }

    /// Retries one task to completion. Returns `true` on delivery.
    pub async fn attempt(&self, task: &RetryTask) -> bool {
        let alert: Alert = match serde_json::from_str(&task.alert_json) {
            Ok(alert) => alert,
            Err(err) => {
                error!(channel = %task.channel_name, error = %err, "retry payload undecodable");
                return false;
            }
        };
        let Some(channel) = self.channels.get(&task.channel_name) else {
            error!(channel = %task.channel_name, "retry for unknown channel");
            return false;
        };

        for attempt in 1..=self.max_retries {
            tokio::time::sleep(self.base_delay * 2u32.pow(attempt - 1)).await;
            match channel.send(&alert).await {
                Ok(true) => {
                    info!(
                        channel = %task.channel_name,
                        alert_id = %alert.alert_id,
                        attempt,
                        "retry delivered"
                    );
                    return true;
                }
                Ok(false) => {
                    warn!(channel = %task.channel_name, attempt, "retry refused");
                }
                Err(err) => {
                    warn!(channel = %task.channel_name, attempt, error = %err, "retry failed");
                }
            }
        }

        error!(
            channel = %task.channel_name,
            alert_id = %alert.alert_id,
            attempts = self.max_retries,
            "delivery abandoned after retries"
        );
        false
    }

    /// Drains the queue until it closes or the stop event fires. Tasks run
    /// concurrently so one slow endpoint cannot starve the queue.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<RetryTask>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        info!("retry worker started");
        loop {
            tokio::select! {
                task = rx.recv() => {
                    let Some(task) = task else { break };
                    let worker = Arc::clone(&self);
                    tokio::spawn(async move {
                        worker.attempt(&task).await;
                    });
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("retry worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;
    use voxsentinel_common::models::{AlertType, MatchType, Severity};

    struct FlakyChannel {
        succeed_on: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AlertChannel for FlakyChannel {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn send(&self, _alert: &Alert) -> anyhow::Result<bool> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(call >= self.succeed_on)
        }
    }

    fn alert_json() -> String {
        let alert = Alert {
            alert_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            stream_id: Uuid::new_v4(),
            segment_id: None,
            alert_type: AlertType::Keyword,
            severity: Severity::High,
            matched_rule: "gun".into(),
            match_type: MatchType::Exact,
            similarity_score: None,
            matched_text: "gun".into(),
            surrounding_context: String::new(),
            speaker_id: None,
            sentiment_scores: None,
            asr_backend_used: None,
            delivered_to: vec![],
            delivery_status: HashMap::new(),
            deduplicated: false,
            created_at: Utc::now(),
        };
        serde_json::to_string(&alert).unwrap()
    }

    fn worker(channel: Arc<FlakyChannel>) -> RetryWorker {
        let mut channels: HashMap<String, Arc<dyn AlertChannel>> = HashMap::new();
        channels.insert("flaky".into(), channel);
        RetryWorker::new(channels, 3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn retry_succeeds_on_later_attempt() {
        let channel = Arc::new(FlakyChannel {
            succeed_on: 2,
            calls: AtomicUsize::new(0),
        });
        let worker = worker(channel.clone());
        let task = RetryTask {
            alert_json: alert_json(),
            channel_name: "flaky".into(),
        };
        assert!(worker.attempt(&task).await);
        assert_eq!(channel.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhaustion_abandons_delivery() {
        let channel = Arc::new(FlakyChannel {
            succeed_on: usize::MAX,
            calls: AtomicUsize::new(0),
        });
        let worker = worker(channel.clone());
        let task = RetryTask {
            alert_json: alert_json(),
            channel_name: "flaky".into(),
        };
        assert!(!worker.attempt(&task).await);
        assert_eq!(channel.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unknown_channel_is_abandoned() {
        let worker = worker(Arc::new(FlakyChannel {
            succeed_on: 1,
            calls: AtomicUsize::new(0),
        }));
        let task = RetryTask {
            alert_json: alert_json(),
            channel_name: "missing".into(),
        };
        assert!(!worker.attempt(&task).await);
    }

    #[tokio::test]
    async fn undecodable_payload_is_abandoned() {
        let worker = worker(Arc::new(FlakyChannel {
            succeed_on: 1,
            calls: AtomicUsize::new(0),
        }));
        let task = RetryTask {
            alert_json: "not json".into(),
            channel_name: "flaky".into(),
        };
        assert!(!worker.attempt(&task).await);
    }
}
