use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::rule::Severity;

/// Category of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertType {
    Keyword,
    Sentiment,
    Compliance,
    Intent,
}

/// How the alert was matched. Extends the rule match modes with the
/// sentiment-threshold and intent origins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Fuzzy,
    Regex,
    SentimentThreshold,
    Intent,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Exact => "exact",
            MatchType::Fuzzy => "fuzzy",
            MatchType::Regex => "regex",
            MatchType::SentimentThreshold => "sentiment_threshold",
            MatchType::Intent => "intent",
        }
    }
}

/// Per-channel delivery outcome recorded on the alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryOutcome {
    Delivered,
    Failed,
    Error,
}

/// Delivery transport kind for a configured channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Websocket,
    Webhook,
    Slack,
    Teams,
    Email,
    Sms,
    Signal,
}

/// Published on `match_events:{stream_id}` for every keyword hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordMatchEvent {
    pub keyword: String,
    pub rule_id: Uuid,
    pub match_type: MatchType,
    /// 1.0 for exact, the ratio for fuzzy, absent for regex.
    #[serde(default)]
    pub similarity_score: Option<f32>,
    pub matched_text: String,
    /// The full sliding-window text at match time.
    pub surrounding_context: String,
    /// Rule severity; keyword alerts default to high when absent.
    #[serde(default = "default_keyword_severity")]
    pub severity: Severity,
    pub stream_id: Uuid,
    pub session_id: Uuid,
    #[serde(default)]
    pub speaker_id: Option<String>,
}

/// Published on `sentiment_events:{stream_id}` when escalation triggers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentEvent {
    pub stream_id: Uuid,
    pub session_id: Uuid,
    #[serde(default)]
    pub speaker_id: Option<String>,
    pub sentiment_label: String,
    pub sentiment_score: f32,
}

/// A dispatched (or suppressed) alert with its delivery bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: Uuid,
    pub session_id: Uuid,
    pub stream_id: Uuid,
    #[serde(default)]
    pub segment_id: Option<Uuid>,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub matched_rule: String,
    pub match_type: MatchType,
    #[serde(default)]
    pub similarity_score: Option<f32>,
    #[serde(default)]
    pub matched_text: String,
    #[serde(default)]
    pub surrounding_context: String,
    #[serde(default)]
    pub speaker_id: Option<String>,
    #[serde(default)]
    pub sentiment_scores: Option<HashMap<String, f32>>,
    #[serde(default)]
    pub asr_backend_used: Option<String>,
    /// Channels that confirmed delivery.
    #[serde(default)]
    pub delivered_to: Vec<String>,
    /// Outcome per attempted channel.
    #[serde(default)]
    pub delivery_status: HashMap<String, DeliveryOutcome>,
    #[serde(default)]
    pub deduplicated: bool,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    /// Builds an alert from a keyword match event. Severity comes from the
    /// rule, defaulting to high for keyword alerts.
    pub fn from_keyword_event(event: KeywordMatchEvent) -> Self {
        Self {
            alert_id: Uuid::new_v4(),
            session_id: event.session_id,
            stream_id: event.stream_id,
            segment_id: None,
            alert_type: AlertType::Keyword,
            severity: event.severity,
            matched_rule: event.keyword,
            match_type: event.match_type,
            similarity_score: event.similarity_score,
            matched_text: event.matched_text,
            surrounding_context: event.surrounding_context,
            speaker_id: event.speaker_id,
            sentiment_scores: None,
            asr_backend_used: None,
            delivered_to: Vec::new(),
            delivery_status: HashMap::new(),
            deduplicated: false,
            created_at: Utc::now(),
        }
    }

    /// Builds an alert from a sentiment escalation event (medium severity,
    /// sentiment-threshold match).
    pub fn from_sentiment_event(event: SentimentEvent) -> Self {
        let mut scores = HashMap::new();
        scores.insert(event.sentiment_label.clone(), event.sentiment_score);
        Self {
            alert_id: Uuid::new_v4(),
            session_id: event.session_id,
            stream_id: event.stream_id,
            segment_id: None,
            alert_type: AlertType::Sentiment,
            severity: Severity::Medium,
            matched_rule: event.sentiment_label,
            match_type: MatchType::SentimentThreshold,
            similarity_score: None,
            matched_text: String::new(),
            surrounding_context: String::new(),
            speaker_id: event.speaker_id,
            sentiment_scores: Some(scores),
            asr_backend_used: None,
            delivered_to: Vec::new(),
            delivery_status: HashMap::new(),
            deduplicated: false,
            created_at: Utc::now(),
        }
    }
}

/// Operator configuration for one delivery channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertChannelConfig {
    pub channel_id: Uuid,
    pub channel_type: ChannelType,
    /// Transport-specific settings (webhook URL, headers, ...).
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default = "min_severity_default")]
    pub min_severity: Severity,
    /// Alert types this channel accepts; empty means all.
    #[serde(default)]
    pub alert_types: Vec<AlertType>,
    /// Streams this channel is scoped to; empty means all.
    #[serde(default)]
    pub stream_ids: Vec<Uuid>,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn default_keyword_severity() -> Severity {
    Severity::High
}

fn min_severity_default() -> Severity {
    Severity::Low
}

fn enabled_default() -> bool {
    true
}

impl AlertChannelConfig {
    /// Whether this channel should receive `alert`.
    pub fn accepts(&self, alert: &Alert) -> bool {
        if !self.enabled || alert.severity < self.min_severity {
            return false;
        }
        if !self.alert_types.is_empty() && !self.alert_types.contains(&alert.alert_type) {
            return false;
        }
        if !self.stream_ids.is_empty() && !self.stream_ids.contains(&alert.stream_id) {
            return false;
        }
        true
    }
}
