//! Slack delivery via incoming webhook with a block-kit message layout.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use voxsentinel_common::models::{Alert, Severity};

use super::AlertChannel;

pub struct SlackChannel {
    name: String,
    webhook_url: String,
    client: reqwest::Client,
    enabled: bool,
}

impl SlackChannel {
    pub fn new(name: &str, webhook_url: &str) -> Self {
        Self {
            name: name.to_string(),
            webhook_url: webhook_url.to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            enabled: true,
        }
    }

    fn severity_emoji(severity: Severity) -> &'static str {
        match severity {
            Severity::Low => ":large_blue_circle:",
            Severity::Medium => ":large_yellow_circle:",
            Severity::High => ":large_orange_circle:",
            Severity::Critical => ":red_circle:",
        }
    }

    /// Block-kit payload: header with severity, fields, and the window
    /// context as a quoted section.
    pub fn format_payload(alert: &Alert) -> serde_json::Value {
        let header = format!(
            "{} {} alert: {}",
            Self::severity_emoji(alert.severity),
            alert.severity.as_str(),
            alert.matched_rule
        );
        let mut fields = vec![
            json!({"type": "mrkdwn", "text": format!("*Stream:*\n{}", alert.stream_id)}),
            json!({"type": "mrkdwn", "text": format!("*Type:*\n{}", alert.match_type.as_str())}),
        ];
        if let Some(speaker) = &alert.speaker_id {
            fields.push(json!({"type": "mrkdwn", "text": format!("*Speaker:*\n{speaker}")}));
        }
        if !alert.matched_text.is_empty() {
            fields.push(json!({
                "type": "mrkdwn",
                "text": format!("*Matched:*\n{}", alert.matched_text)
            }));
        }

        let mut blocks = vec![
            json!({
                "type": "header",
                "text": {"type": "plain_text", "text": header, "emoji": true}
            }),
            json!({"type": "section", "fields": fields}),
        ];
        if !alert.surrounding_context.is_empty() {
            blocks.push(json!({
                "type": "section",
                "text": {
                    "type": "mrkdwn",
                    "text": format!("> {}", alert.surrounding_context)
                }
            }));
        }

        json!({"blocks": blocks})
    }
}

#[async_trait]
impl AlertChannel for SlackChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    async fn send(&self, alert: &Alert) -> anyhow::Result<bool> {
        let payload = Self::format_payload(alert);
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?;
        debug!(channel = %self.name, status = %response.status(), "slack message posted");
        Ok(response.status().is_success())
    }
}
