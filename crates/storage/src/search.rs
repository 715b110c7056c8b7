//! Search indexing over an Elasticsearch-compatible HTTP API.
//!
//! Only the redacted text is ever indexed.

use std::time::Duration;

use serde_json::json;
use tracing::{debug, info};

use voxsentinel_common::models::TranscriptSegment;

pub const INDEX_NAME: &str = "transcripts";

pub struct SearchIndexer {
    client: reqwest::Client,
    base_url: String,
    index: String,
}

impl SearchIndexer {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            index: INDEX_NAME.to_string(),
        }
    }

    fn mapping() -> serde_json::Value {
        json!({
            "mappings": {
                "properties": {
                    "segment_id": {"type": "keyword"},
                    "session_id": {"type": "keyword"},
                    "stream_id": {"type": "keyword"},
                    "speaker_id": {"type": "keyword"},
                    "timestamp": {"type": "date"},
                    "text": {"type": "text", "analyzer": "standard"},
                    "sentiment_label": {"type": "keyword"},
                    "language": {"type": "keyword"}
                }
            }
        })
    }

    /// Builds the indexed document for one segment.
    pub fn document_for(segment: &TranscriptSegment) -> serde_json::Value {
        json!({
            "segment_id": segment.segment_id,
            "session_id": segment.session_id,
            "stream_id": segment.stream_id,
            "speaker_id": segment.speaker_id,
            "timestamp": segment.start_time.to_rfc3339(),
            "text": segment.text_redacted,
            "sentiment_label": segment.sentiment_label,
            "language": segment.language,
        })
    }

    /// Creates the index with its mapping if it does not exist yet.
    pub async fn ensure_index(&self) -> anyhow::Result<()> {
        let url = format!("{}/{}", self.base_url, self.index);
        let head = self.client.head(&url).send().await?;
        if head.status().is_success() {
            return Ok(());
        }
        let response = self
            .client
            .put(&url)
            .json(&Self::mapping())
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("index creation failed: {}", response.status());
        }
        info!(index = %self.index, "search index created");
        Ok(())
    }

    /// Indexes a single segment, keyed by segment_id.
    pub async fn index_segment(&self, segment: &TranscriptSegment) -> anyhow::Result<()> {
        let url = format!(
            "{}/{}/_doc/{}",
            self.base_url, self.index, segment.segment_id
        );
        let response = self
            .client
            .put(&url)
            .json(&Self::document_for(segment))
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("index write failed: {}", response.status());
        }
        debug!(segment_id = %segment.segment_id, "segment indexed");
        Ok(())
    }

    /// Full-text search with optional session/stream filters.
    pub async fn search(
        &self,
        query_text: &str,
        session_id: Option<&str>,
        stream_id: Option<&str>,
        size: usize,
    ) -> anyhow::Result<serde_json::Value> {
        let mut must = vec![json!({"match": {"text": {"query": query_text}}})];
        if let Some(session_id) = session_id {
            must.push(json!({"term": {"session_id": session_id}}));
        }
        if let Some(stream_id) = stream_id {
            must.push(json!({"term": {"stream_id": stream_id}}));
        }

        let body = json!({
            "query": {"bool": {"must": must}},
            "highlight": {"fields": {"text": {}}},
            "size": size,
        });

        let url = format!("{}/{}/_search", self.base_url, self.index);
        let response = self.client.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("search failed: {}", response.status());
        }
        Ok(response.json().await?)
    }
}
