//! Per-stream ASR routing: speech chunks in, transcript tokens out.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use voxsentinel_common::models::TranscriptToken;
use voxsentinel_common::{keys, metrics, RedisBus, QUEUE_MAXLEN};

use crate::failover::{AsrError, FailoverManager};

/// Serializes a token as a `transcript_tokens:{sid}` entry field.
pub fn token_entry(token: &TranscriptToken) -> anyhow::Result<[(&'static str, String); 1]> {
    Ok([("token", serde_json::to_string(token)?)])
}

/// Consumes `speech_chunks:{sid}` and produces `transcript_tokens:{sid}`
/// through the failover manager.
pub struct AsrRouter {
    bus: RedisBus,
    failover: Arc<FailoverManager>,
}

impl AsrRouter {
    pub fn new(bus: RedisBus, failover: Arc<FailoverManager>) -> Self {
        Self { bus, failover }
    }

    pub async fn run(&self, stream_id: Uuid, stop_rx: watch::Receiver<bool>) {
        let in_key = keys::speech_chunks(stream_id);
        let out_key = keys::transcript_tokens(stream_id);
        let stream_label = stream_id.to_string();
        let mut last_id = "0".to_string();

        info!(stream_id = %stream_id, engine = %self.failover.active_engine_name(), "asr router started");

        while !*stop_rx.borrow() {
            let entries = match self.bus.xread(&in_key, &last_id, 10, 1000).await {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(stream_id = %stream_id, error = %err, "asr queue read failed");
                    metrics::QUEUE_READ_ERRORS.with_label_values(&["asr"]).inc();
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            for entry in entries {
                last_id = entry.id.clone();

                let Some(pcm_b64) = entry.fields.get("pcm_b64") else {
                    warn!(stream_id = %stream_id, entry_id = %entry.id, "speech chunk missing pcm_b64");
                    continue;
                };
                let pcm = match BASE64.decode(pcm_b64) {
                    Ok(pcm) => pcm,
                    Err(err) => {
                        warn!(stream_id = %stream_id, error = %err, "speech chunk payload not base64");
                        continue;
                    }
                };

                let tokens = match self.failover.stream_audio(&pcm).await {
                    Ok(tokens) => tokens,
                    Err(AsrError::CircuitOpen { engine }) => {
                        // No fallback: abandon this chunk and keep consuming.
                        metrics::ASR_CIRCUIT_OPEN_DROPS
                            .with_label_values(&[&stream_label])
                            .inc();
                        warn!(stream_id = %stream_id, engine = %engine, "chunk abandoned, circuit open");
                        continue;
                    }
                    Err(AsrError::Engine(err)) => {
                        warn!(stream_id = %stream_id, error = %err, "asr inference failed");
                        continue;
                    }
                };

                for token in &tokens {
                    let fields = match token_entry(token) {
                        Ok(fields) => fields,
                        Err(err) => {
                            warn!(stream_id = %stream_id, error = %err, "token serialization failed");
                            continue;
                        }
                    };
                    if let Err(err) = self.bus.xadd(&out_key, &fields, QUEUE_MAXLEN).await {
                        warn!(stream_id = %stream_id, error = %err, "token publish failed");
                    }
                }
            }
        }

        info!(stream_id = %stream_id, "asr router stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn token_entry_serializes_under_token_field() {
        let token = TranscriptToken {
            text: "hello".into(),
            is_final: true,
            start_time: Utc::now(),
            end_time: Utc::now(),
            start_ms: 0,
            end_ms: 500,
            confidence: 0.8,
            language: "en".into(),
            word_timestamps: vec![],
        };
        let [(field, payload)] = token_entry(&token).unwrap();
        assert_eq!(field, "token");
        let parsed: TranscriptToken = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed.text, "hello");
        assert!(parsed.is_final);
    }
}
