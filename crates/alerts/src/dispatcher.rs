//! Central alert routing: parse raw events, suppress duplicates and
//! floods, fan out to channels, enqueue retries, persist.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use voxsentinel_common::models::{
    Alert, AlertChannelConfig, DeliveryOutcome, KeywordMatchEvent, SentimentEvent,
};
use voxsentinel_common::{metrics, RedisBus};

use crate::channels::AlertChannel;
use crate::retry::RetryTask;
use crate::throttle::SuppressionStore;

/// Persists dispatched alerts. Failures are logged, never fatal.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn write(&self, alert: &Alert) -> anyhow::Result<()>;
}

/// A transport paired with its operator-facing routing configuration.
pub struct ConfiguredChannel {
    pub config: AlertChannelConfig,
    pub transport: Arc<dyn AlertChannel>,
}

pub struct AlertDispatcher {
    suppression: Arc<dyn SuppressionStore>,
    channels: Vec<ConfiguredChannel>,
    retry_tx: Option<mpsc::UnboundedSender<RetryTask>>,
    sink: Option<Arc<dyn AlertSink>>,
}

impl AlertDispatcher {
    pub fn new(
        suppression: Arc<dyn SuppressionStore>,
        channels: Vec<ConfiguredChannel>,
        retry_tx: Option<mpsc::UnboundedSender<RetryTask>>,
        sink: Option<Arc<dyn AlertSink>>,
    ) -> Self {
        Self {
            suppression,
            channels,
            retry_tx,
            sink,
        }
    }

    /// Parses a raw pub/sub event into an alert based on its channel kind.
    /// Returns `None` for unknown channels or malformed payloads.
    pub fn parse_event(channel: &str, payload: &str) -> Option<Alert> {
        if channel.starts_with("match_events:") {
            let event: KeywordMatchEvent = serde_json::from_str(payload).ok()?;
            Some(Alert::from_keyword_event(event))
        } else if channel.starts_with("sentiment_events:") {
            let event: SentimentEvent = serde_json::from_str(payload).ok()?;
            Some(Alert::from_sentiment_event(event))
        } else {
            None
        }
    }

    /// Runs one alert through dedup, throttle, fan-out, record, persist.
    /// Returns `true` when at least one channel confirmed delivery.
    pub async fn dispatch(&self, alert: &mut Alert) -> bool {
        let stream_label = alert.stream_id.to_string();

        // Dedup: identical (stream, rule, match_type) within the TTL.
        match self
            .suppression
            .is_duplicate(alert.stream_id, &alert.matched_rule, alert.match_type.as_str())
            .await
        {
            Ok(true) => {
                alert.deduplicated = true;
                metrics::ALERTS_SUPPRESSED
                    .with_label_values(&[&stream_label, "dedup"])
                    .inc();
                debug!(alert_id = %alert.alert_id, rule = %alert.matched_rule, "alert deduplicated");
                return false;
            }
            Ok(false) => {}
            Err(err) => {
                // Suppression store down: deliver rather than go silent.
                warn!(error = %err, "dedup check failed, continuing");
            }
        }

        // Throttle: per-stream budget over the trailing minute.
        match self.suppression.is_throttled(alert.stream_id).await {
            Ok(true) => {
                metrics::ALERTS_SUPPRESSED
                    .with_label_values(&[&stream_label, "throttle"])
                    .inc();
                warn!(stream_id = %alert.stream_id, "alert throttled");
                return false;
            }
            Ok(false) => {}
            Err(err) => {
                warn!(error = %err, "throttle check failed, continuing");
            }
        }

        // Fan-out.
        let mut any_delivered = false;
        for channel in &self.channels {
            if !channel.transport.enabled() || !channel.config.accepts(alert) {
                continue;
            }
            let name = channel.transport.name().to_string();
            match channel.transport.send(alert).await {
                Ok(true) => {
                    alert.delivered_to.push(name.clone());
                    alert.delivery_status.insert(name, DeliveryOutcome::Delivered);
                    any_delivered = true;
                }
                Ok(false) => {
                    alert.delivery_status.insert(name.clone(), DeliveryOutcome::Failed);
                    self.enqueue_retry(alert, &name);
                }
                Err(err) => {
                    warn!(channel = %name, error = %err, "channel send raised");
                    alert.delivery_status.insert(name.clone(), DeliveryOutcome::Error);
                    self.enqueue_retry(alert, &name);
                }
            }
        }

        // Record the dispatch against the throttle window.
        if let Err(err) = self.suppression.record(alert.stream_id).await {
            warn!(error = %err, "throttle record failed");
        }
        metrics::ALERTS_DISPATCHED
            .with_label_values(&[&stream_label])
            .inc();

        // Persist; storage problems never fail dispatch.
        if let Some(sink) = &self.sink {
            if let Err(err) = sink.write(alert).await {
                warn!(alert_id = %alert.alert_id, error = %err, "alert persist failed");
            }
        }

        any_delivered
    }

    fn enqueue_retry(&self, alert: &Alert, channel_name: &str) {
        let Some(retry_tx) = &self.retry_tx else {
            return;
        };
        match serde_json::to_string(alert) {
            Ok(alert_json) => {
                let task = RetryTask {
                    alert_json,
                    channel_name: channel_name.to_string(),
                };
                if retry_tx.send(task).is_err() {
                    warn!(channel = %channel_name, "retry worker gone, delivery abandoned");
                }
            }
            Err(err) => {
                warn!(error = %err, "alert serialization for retry failed");
            }
        }
    }

    /// Subscribes to all match and sentiment event channels and dispatches
    /// until the stop event fires.
    pub async fn run(&self, bus: RedisBus, mut stop_rx: watch::Receiver<bool>) {
        let mut pubsub = match bus.psubscribe(&["match_events:*", "sentiment_events:*"]).await {
            Ok(pubsub) => pubsub,
            Err(err) => {
                warn!(error = %err, "alert listener subscribe failed");
                return;
            }
        };
        info!("alert dispatcher listening");

        let mut messages = pubsub.on_message();
        loop {
            tokio::select! {
                message = messages.next() => {
                    let Some(message) = message else { break };
                    let channel = message.get_channel_name().to_string();
                    let payload: String = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(err) => {
                            warn!(error = %err, "unreadable event payload");
                            continue;
                        }
                    };
                    match Self::parse_event(&channel, &payload) {
                        Some(mut alert) => {
                            self.dispatch(&mut alert).await;
                        }
                        None => {
                            warn!(channel = %channel, "corrupt event dropped");
                        }
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }

        for channel in &self.channels {
            channel.transport.close().await;
        }
        info!("alert dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::MemorySuppression;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;
    use voxsentinel_common::models::{AlertType, ChannelType, MatchType, Severity};

    struct MockChannel {
        name: String,
        enabled: bool,
        outcome: Result<bool, String>,
        sends: AtomicUsize,
    }

    impl MockChannel {
        fn ok(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                enabled: true,
                outcome: Ok(true),
                sends: AtomicUsize::new(0),
            })
        }

        fn failing(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                enabled: true,
                outcome: Ok(false),
                sends: AtomicUsize::new(0),
            })
        }

        fn raising(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                enabled: true,
                outcome: Err("boom".into()),
                sends: AtomicUsize::new(0),
            })
        }

        fn disabled(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                enabled: false,
                outcome: Ok(true),
                sends: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl AlertChannel for MockChannel {
        fn name(&self) -> &str {
            &self.name
        }
        fn enabled(&self) -> bool {
            self.enabled
        }
        async fn send(&self, _alert: &Alert) -> anyhow::Result<bool> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            match &self.outcome {
                Ok(ok) => Ok(*ok),
                Err(msg) => Err(anyhow::anyhow!("{msg}")),
            }
        }
    }

    struct RecordingSink {
        written: Mutex<Vec<Alert>>,
        fail: bool,
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn write(&self, alert: &Alert) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("db down");
            }
            self.written.lock().push(alert.clone());
            Ok(())
        }
    }

    fn accept_all_config() -> AlertChannelConfig {
        AlertChannelConfig {
            channel_id: Uuid::new_v4(),
            channel_type: ChannelType::Webhook,
            config: serde_json::json!({}),
            min_severity: Severity::Low,
            alert_types: vec![],
            stream_ids: vec![],
            enabled: true,
        }
    }

    fn configured(transport: Arc<dyn AlertChannel>) -> ConfiguredChannel {
        ConfiguredChannel {
            config: accept_all_config(),
            transport,
        }
    }

    fn sample_alert() -> Alert {
        Alert {
            alert_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            stream_id: Uuid::new_v4(),
            segment_id: None,
            alert_type: AlertType::Keyword,
            severity: Severity::High,
            matched_rule: "gun".into(),
            match_type: MatchType::Exact,
            similarity_score: Some(1.0),
            matched_text: "gun".into(),
            surrounding_context: "he has a gun".into(),
            speaker_id: None,
            sentiment_scores: None,
            asr_backend_used: None,
            delivered_to: vec![],
            delivery_status: HashMap::new(),
            deduplicated: false,
            created_at: Utc::now(),
        }
    }

    fn suppression() -> Arc<MemorySuppression> {
        Arc::new(MemorySuppression::new(10, 30))
    }

    #[test]
    fn parse_keyword_event() {
        let stream_id = Uuid::new_v4();
        let payload = serde_json::json!({
            "keyword": "gun",
            "rule_id": Uuid::new_v4(),
            "match_type": "exact",
            "matched_text": "he has a gun",
            "surrounding_context": "context here",
            "severity": "critical",
            "stream_id": stream_id,
            "session_id": Uuid::new_v4(),
        });
        let alert =
            AlertDispatcher::parse_event("match_events:1", &payload.to_string()).unwrap();
        assert_eq!(alert.alert_type, AlertType::Keyword);
        assert_eq!(alert.matched_rule, "gun");
        assert_eq!(alert.severity, Severity::Critical);
        assert_eq!(alert.stream_id, stream_id);
    }

    #[test]
    fn parse_sentiment_event() {
        let payload = serde_json::json!({
            "stream_id": Uuid::new_v4(),
            "session_id": Uuid::new_v4(),
            "sentiment_label": "negative",
            "sentiment_score": 0.92,
        });
        let alert =
            AlertDispatcher::parse_event("sentiment_events:1", &payload.to_string()).unwrap();
        assert_eq!(alert.alert_type, AlertType::Sentiment);
        assert_eq!(alert.matched_rule, "negative");
        assert_eq!(alert.severity, Severity::Medium);
        assert_eq!(alert.match_type, MatchType::SentimentThreshold);
    }

    #[test]
    fn parse_keyword_event_without_severity_defaults_high() {
        let payload = serde_json::json!({
            "keyword": "bomb",
            "rule_id": Uuid::new_v4(),
            "match_type": "exact",
            "matched_text": "bomb",
            "surrounding_context": "a bomb threat",
            "stream_id": Uuid::new_v4(),
            "session_id": Uuid::new_v4(),
        });
        let alert =
            AlertDispatcher::parse_event("match_events:1", &payload.to_string()).unwrap();
        assert_eq!(alert.severity, Severity::High);
    }

    #[test]
    fn parse_invalid_json_is_none() {
        assert!(AlertDispatcher::parse_event("match_events:1", "not json").is_none());
    }

    #[test]
    fn parse_unknown_channel_is_none() {
        let payload = serde_json::json!({"stream_id": Uuid::new_v4()});
        assert!(AlertDispatcher::parse_event("other_channel", &payload.to_string()).is_none());
    }

    #[test]
    fn parse_missing_fields_is_none() {
        assert!(AlertDispatcher::parse_event("match_events:1", r#"{"keyword": "gun"}"#).is_none());
    }

    #[tokio::test]
    async fn dispatch_sends_to_all_enabled_channels() {
        let ws = MockChannel::ok("ws");
        let webhook = MockChannel::ok("webhook");
        let dispatcher = AlertDispatcher::new(
            suppression(),
            vec![configured(ws.clone()), configured(webhook.clone())],
            None,
            None,
        );

        let mut alert = sample_alert();
        assert!(dispatcher.dispatch(&mut alert).await);
        assert_eq!(ws.sends.load(Ordering::SeqCst), 1);
        assert_eq!(webhook.sends.load(Ordering::SeqCst), 1);
        assert_eq!(alert.delivered_to, vec!["ws", "webhook"]);
        assert_eq!(
            alert.delivery_status.get("ws"),
            Some(&DeliveryOutcome::Delivered)
        );
    }

    #[tokio::test]
    async fn dispatch_skips_disabled_channels() {
        let channel = MockChannel::disabled("off");
        let dispatcher = AlertDispatcher::new(
            suppression(),
            vec![configured(channel.clone())],
            None,
            None,
        );

        let mut alert = sample_alert();
        assert!(!dispatcher.dispatch(&mut alert).await);
        assert_eq!(channel.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dispatch_respects_min_severity() {
        let channel = MockChannel::ok("picky");
        let mut configured = configured(channel.clone());
        configured.config.min_severity = Severity::Critical;
        let dispatcher = AlertDispatcher::new(suppression(), vec![configured], None, None);

        let mut alert = sample_alert(); // High < Critical
        assert!(!dispatcher.dispatch(&mut alert).await);
        assert_eq!(channel.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_send_marks_status_and_enqueues_retry() {
        let channel = MockChannel::failing("webhook");
        let (retry_tx, mut retry_rx) = mpsc::unbounded_channel();
        let dispatcher = AlertDispatcher::new(
            suppression(),
            vec![configured(channel)],
            Some(retry_tx),
            None,
        );

        let mut alert = sample_alert();
        assert!(!dispatcher.dispatch(&mut alert).await);
        assert_eq!(
            alert.delivery_status.get("webhook"),
            Some(&DeliveryOutcome::Failed)
        );
        assert!(alert.delivered_to.is_empty());
        let task = retry_rx.try_recv().unwrap();
        assert_eq!(task.channel_name, "webhook");
    }

    #[tokio::test]
    async fn raising_send_marks_error_and_enqueues_retry() {
        let channel = MockChannel::raising("broken");
        let (retry_tx, mut retry_rx) = mpsc::unbounded_channel();
        let dispatcher = AlertDispatcher::new(
            suppression(),
            vec![configured(channel)],
            Some(retry_tx),
            None,
        );

        let mut alert = sample_alert();
        assert!(!dispatcher.dispatch(&mut alert).await);
        assert_eq!(
            alert.delivery_status.get("broken"),
            Some(&DeliveryOutcome::Error)
        );
        assert!(retry_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn duplicate_alert_is_suppressed() {
        let channel = MockChannel::ok("ws");
        let dispatcher = AlertDispatcher::new(
            suppression(),
            vec![configured(channel.clone())],
            None,
            None,
        );

        let mut first = sample_alert();
        assert!(dispatcher.dispatch(&mut first).await);

        // Same (stream, rule, match_type) inside the TTL.
        let mut second = sample_alert();
        second.stream_id = first.stream_id;
        assert!(!dispatcher.dispatch(&mut second).await);
        assert!(second.deduplicated);
        assert_eq!(channel.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn throttled_stream_drops_alerts() {
        let channel = MockChannel::ok("ws");
        let store = Arc::new(MemorySuppression::new(0, 2));
        let dispatcher = AlertDispatcher::new(
            store,
            vec![configured(channel.clone())],
            None,
            None,
        );

        let stream_id = Uuid::new_v4();
        for i in 0..3 {
            let mut alert = sample_alert();
            alert.stream_id = stream_id;
            alert.matched_rule = format!("rule-{i}");
            dispatcher.dispatch(&mut alert).await;
        }
        // Two dispatched, the third suppressed by the throttle.
        assert_eq!(channel.sends.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn throttle_law_over_burst() {
        let channel = MockChannel::ok("ws");
        let store = Arc::new(MemorySuppression::new(0, 30));
        let dispatcher = AlertDispatcher::new(
            store,
            vec![configured(channel.clone())],
            None,
            None,
        );

        let stream_id = Uuid::new_v4();
        let mut delivered = 0;
        for i in 0..31 {
            let mut alert = sample_alert();
            alert.stream_id = stream_id;
            alert.matched_rule = format!("distinct-{i}");
            if dispatcher.dispatch(&mut alert).await {
                delivered += 1;
            } else {
                assert!(alert.delivered_to.is_empty());
            }
        }
        assert_eq!(delivered, 30);
        assert_eq!(channel.sends.load(Ordering::SeqCst), 30);
    }

    #[tokio::test]
    async fn sink_receives_dispatched_alert() {
        let sink = Arc::new(RecordingSink {
            written: Mutex::new(vec![]),
            fail: false,
        });
        let dispatcher = AlertDispatcher::new(
            suppression(),
            vec![configured(MockChannel::ok("ws"))],
            None,
            Some(sink.clone()),
        );

        let mut alert = sample_alert();
        dispatcher.dispatch(&mut alert).await;
        let written = sink.written.lock();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].delivered_to, vec!["ws"]);
    }

    #[tokio::test]
    async fn sink_failure_does_not_fail_dispatch() {
        let sink = Arc::new(RecordingSink {
            written: Mutex::new(vec![]),
            fail: true,
        });
        let dispatcher = AlertDispatcher::new(
            suppression(),
            vec![configured(MockChannel::ok("ws"))],
            None,
            Some(sink),
        );

        let mut alert = sample_alert();
        assert!(dispatcher.dispatch(&mut alert).await);
    }
}
