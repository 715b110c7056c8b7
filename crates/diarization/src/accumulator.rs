//! Windowed diarization over speech chunks.
//!
//! Accumulates PCM until the window fills, diarizes off the I/O loop, and
//! publishes each speaker turn to `diarization_events:{sid}` offset by the
//! samples already processed. The buffer shifts by the window size.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use voxsentinel_common::models::SpeakerSegment;
use voxsentinel_common::{keys, metrics, RedisBus, BYTES_PER_SAMPLE, SAMPLE_RATE};

use crate::model::DiarizerModel;

pub struct DiarizationAccumulator {
    bus: RedisBus,
    model: Arc<dyn DiarizerModel>,
    window_bytes: usize,
}

impl DiarizationAccumulator {
    pub fn new(bus: RedisBus, model: Arc<dyn DiarizerModel>, window_seconds: f32) -> Self {
        let window_bytes = (window_seconds * SAMPLE_RATE as f32) as usize * BYTES_PER_SAMPLE;
        Self {
            bus,
            model,
            window_bytes,
        }
    }

    pub async fn run(&self, stream_id: Uuid, stop_rx: watch::Receiver<bool>) {
        let in_key = keys::speech_chunks(stream_id);
        let out_channel = keys::diarization_events(stream_id);
        let mut last_id = "0".to_string();
        let mut buffer: Vec<u8> = Vec::with_capacity(self.window_bytes * 2);
        let mut total_samples: u64 = 0;

        info!(stream_id = %stream_id, window_bytes = self.window_bytes, "diarization accumulator started");

        while !*stop_rx.borrow() {
            let entries = match self.bus.xread(&in_key, &last_id, 10, 1000).await {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(stream_id = %stream_id, error = %err, "diarization queue read failed");
                    metrics::QUEUE_READ_ERRORS
                        .with_label_values(&["diarization"])
                        .inc();
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            for entry in entries {
                last_id = entry.id.clone();
                let Some(pcm_b64) = entry.fields.get("pcm_b64") else {
                    continue;
                };
                match BASE64.decode(pcm_b64) {
                    Ok(pcm) => buffer.extend_from_slice(&pcm),
                    Err(err) => {
                        warn!(stream_id = %stream_id, error = %err, "speech chunk payload not base64");
                        continue;
                    }
                }

                while buffer.len() >= self.window_bytes {
                    let window: Vec<u8> = buffer.drain(..self.window_bytes).collect();
                    let window_start_ms = total_samples * 1000 / SAMPLE_RATE as u64;
                    total_samples += (window.len() / BYTES_PER_SAMPLE) as u64;

                    let model = Arc::clone(&self.model);
                    let segments =
                        match tokio::task::spawn_blocking(move || model.diarize(&window)).await {
                            Ok(Ok(segments)) => segments,
                            Ok(Err(err)) => {
                                warn!(stream_id = %stream_id, error = %err, "diarization inference failed");
                                continue;
                            }
                            Err(err) => {
                                warn!(stream_id = %stream_id, error = %err, "diarization worker panicked");
                                continue;
                            }
                        };

                    debug!(
                        stream_id = %stream_id,
                        window_start_ms,
                        segments = segments.len(),
                        "diarization window processed"
                    );

                    for segment in segments {
                        let absolute = SpeakerSegment {
                            speaker_id: segment.speaker_id,
                            start_ms: window_start_ms + segment.start_ms,
                            end_ms: window_start_ms + segment.end_ms,
                        };
                        match serde_json::to_string(&absolute) {
                            Ok(payload) => {
                                if let Err(err) =
                                    self.bus.publish(&out_channel, &payload).await
                                {
                                    warn!(stream_id = %stream_id, error = %err, "diarization publish failed");
                                }
                            }
                            Err(err) => {
                                warn!(stream_id = %stream_id, error = %err, "segment serialization failed");
                            }
                        }
                    }
                }
            }
        }

        info!(stream_id = %stream_id, "diarization accumulator stopped");
    }
}
