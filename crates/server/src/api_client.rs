//! Client for the management REST API (the external collaborator owning
//! stream, rule, and channel configuration).

use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use voxsentinel_common::models::{AlertChannelConfig, KeywordRule, Stream};

pub struct ManagementApi {
    http: reqwest::Client,
    base_url: String,
}

impl ManagementApi {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// `GET /api/v1/streams?status=active`
    pub async fn active_streams(&self) -> anyhow::Result<Vec<Stream>> {
        let url = format!("{}/api/v1/streams", self.base_url);
        let streams = self
            .http
            .get(&url)
            .query(&[("status", "active")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(streams)
    }

    /// `GET /api/v1/rules`
    pub async fn rules(&self) -> anyhow::Result<Vec<KeywordRule>> {
        let url = format!("{}/api/v1/rules", self.base_url);
        let rules = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(rules)
    }

    /// `GET /api/v1/alert-channels`
    pub async fn alert_channels(&self) -> anyhow::Result<Vec<AlertChannelConfig>> {
        let url = format!("{}/api/v1/alert-channels", self.base_url);
        let channels = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(channels)
    }

    /// `PATCH /api/v1/streams/{id}` marking the stream errored after
    /// reconnection exhaustion.
    pub async fn mark_stream_error(&self, stream_id: Uuid) -> anyhow::Result<()> {
        let url = format!("{}/api/v1/streams/{stream_id}", self.base_url);
        self.http
            .patch(&url)
            .json(&json!({"status": "error"}))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
