//! Webhook delivery: JSON POST with configurable headers and an internal
//! bounded retry before the dispatcher-level retry takes over.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use voxsentinel_common::models::Alert;

use super::AlertChannel;

pub struct WebhookChannel {
    name: String,
    url: String,
    headers: Vec<(String, String)>,
    client: reqwest::Client,
    max_attempts: u32,
    enabled: bool,
}

impl WebhookChannel {
    pub fn new(name: &str, url: &str, headers: Vec<(String, String)>) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            headers,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            max_attempts: 3,
            enabled: true,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    async fn post_once(&self, alert: &Alert) -> anyhow::Result<bool> {
        let mut request = self.client.post(&self.url).json(alert);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        let response = request.send().await?;
        Ok(response.status().is_success())
    }
}

#[async_trait]
impl AlertChannel for WebhookChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    async fn send(&self, alert: &Alert) -> anyhow::Result<bool> {
        let mut last_error: Option<anyhow::Error> = None;
        for attempt in 1..=self.max_attempts {
            match self.post_once(alert).await {
                Ok(true) => {
                    debug!(channel = %self.name, alert_id = %alert.alert_id, "webhook delivered");
                    return Ok(true);
                }
                Ok(false) => {
                    warn!(channel = %self.name, attempt, "webhook endpoint refused the alert");
                }
                Err(err) => {
                    warn!(channel = %self.name, attempt, error = %err, "webhook post failed");
                    last_error = Some(err);
                }
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(Duration::from_millis(200 * 2u64.pow(attempt - 1))).await;
            }
        }
        match last_error {
            Some(err) => Err(err),
            None => Ok(false),
        }
    }
}
