//! Rebuilds transcript segments from `redacted_tokens:{sid}` entries and
//! hands them to the writer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use voxsentinel_common::models::{TranscriptSegment, WordTimestamp};
use voxsentinel_common::{keys, metrics, RedisBus};

use crate::writer::TranscriptWriter;

/// Rebuilds a segment from one redacted-token entry.
///
/// `retain_original` controls whether the pre-redaction text is stored;
/// the segment hash always covers the original when retained.
pub fn segment_from_fields(
    stream_id: Uuid,
    fields: &HashMap<String, String>,
    asr_backend: &str,
    retain_original: bool,
) -> anyhow::Result<TranscriptSegment> {
    let get = |name: &str| {
        fields
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("redacted token missing '{name}'"))
    };

    let start_time = DateTime::parse_from_rfc3339(get("start_time")?)?.with_timezone(&Utc);
    let end_time = DateTime::parse_from_rfc3339(get("end_time")?)?.with_timezone(&Utc);
    let session_id: Uuid = get("session_id")?.parse()?;

    let entities: Vec<String> =
        serde_json::from_str(get("entities_found")?).unwrap_or_default();
    let word_timestamps: Vec<WordTimestamp> = fields
        .get("word_timestamps")
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();

    let sentiment_label = fields
        .get("sentiment_label")
        .filter(|label| !label.is_empty())
        .cloned();
    let sentiment_score = fields
        .get("sentiment_score")
        .and_then(|raw| raw.parse::<f32>().ok());

    let speaker_id = fields
        .get("speaker_id")
        .filter(|speaker| !speaker.is_empty() && speaker.as_str() != "SPEAKER_UNKNOWN")
        .cloned();

    let text_original = get("text_original")?.clone();

    Ok(TranscriptSegment {
        segment_id: Uuid::new_v4(),
        session_id,
        stream_id,
        speaker_id,
        start_time,
        end_time,
        start_offset_ms: fields
            .get("start_ms")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0),
        end_offset_ms: fields
            .get("end_ms")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0),
        text_redacted: get("text_redacted")?.clone(),
        text_original: retain_original.then_some(text_original),
        word_timestamps,
        language: fields
            .get("language")
            .cloned()
            .unwrap_or_else(|| "en".to_string()),
        asr_backend: asr_backend.to_string(),
        asr_confidence: fields
            .get("confidence")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0.0),
        sentiment_label,
        sentiment_score,
        pii_entities_found: entities,
        segment_hash: None,
        created_at: Utc::now(),
    })
}

/// Per-stream storage loop.
pub struct StorageConsumer {
    bus: RedisBus,
    writer: Arc<TranscriptWriter>,
    asr_backend: String,
    retain_original: bool,
}

impl StorageConsumer {
    pub fn new(
        bus: RedisBus,
        writer: Arc<TranscriptWriter>,
        asr_backend: &str,
        retain_original: bool,
    ) -> Self {
        Self {
            bus,
            writer,
            asr_backend: asr_backend.to_string(),
            retain_original,
        }
    }

    pub async fn run(&self, stream_id: Uuid, stop_rx: watch::Receiver<bool>) {
        let in_key = keys::redacted_tokens(stream_id);
        let mut last_id = "0".to_string();

        info!(stream_id = %stream_id, "storage consumer started");

        while !*stop_rx.borrow() {
            let entries = match self.bus.xread(&in_key, &last_id, 10, 1000).await {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(stream_id = %stream_id, error = %err, "storage queue read failed");
                    metrics::QUEUE_READ_ERRORS
                        .with_label_values(&["storage"])
                        .inc();
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            for entry in entries {
                last_id = entry.id.clone();
                let mut segment = match segment_from_fields(
                    stream_id,
                    &entry.fields,
                    &self.asr_backend,
                    self.retain_original,
                ) {
                    Ok(segment) => segment,
                    Err(err) => {
                        warn!(stream_id = %stream_id, entry_id = %entry.id, error = %err, "bad redacted token");
                        continue;
                    }
                };

                // Write failures log and continue: the queue is at-least-once
                // and a restart reprocesses from the cursor.
                if let Err(err) = self.writer.write_segment(&mut segment).await {
                    warn!(
                        stream_id = %stream_id,
                        segment_id = %segment.segment_id,
                        error = %err,
                        "segment persist failed"
                    );
                }
            }
        }

        info!(stream_id = %stream_id, "storage consumer stopped");
    }
}
