//! The VAD gate: consumes `audio_chunks:{sid}`, classifies each chunk,
//! and forwards speech chunks unmodified to `speech_chunks:{sid}`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use voxsentinel_common::{keys, metrics, RedisBus, QUEUE_MAXLEN};

use crate::model::VadModel;

/// Threshold comparison is inclusive: a score exactly at the threshold
/// passes the gate.
pub fn passes_gate(score: f32, threshold: f32) -> bool {
    score >= threshold
}

/// Per-stream `(speech, total)` counters over a wall-clock window.
pub struct SpeechRatioWindow {
    speech: u64,
    total: u64,
    period: Duration,
    started: Instant,
}

impl SpeechRatioWindow {
    pub fn new(period: Duration) -> Self {
        Self {
            speech: 0,
            total: 0,
            period,
            started: Instant::now(),
        }
    }

    pub fn record(&mut self, is_speech: bool) {
        self.total += 1;
        if is_speech {
            self.speech += 1;
        }
    }

    /// When the window has elapsed, returns the speech ratio and resets.
    /// Returns `None` while the window is still open or empty.
    pub fn maybe_flush(&mut self) -> Option<f32> {
        if self.started.elapsed() < self.period {
            return None;
        }
        let ratio = if self.total > 0 {
            self.speech as f32 / self.total as f32
        } else {
            0.0
        };
        let had_data = self.total > 0;
        self.speech = 0;
        self.total = 0;
        self.started = Instant::now();
        had_data.then_some(ratio)
    }
}

/// Consumes audio chunks, classifies, and forwards speech.
pub struct VadGate {
    bus: RedisBus,
    model: Arc<dyn VadModel>,
    threshold: f32,
    metric_window: Duration,
}

impl VadGate {
    pub fn new(bus: RedisBus, model: Arc<dyn VadModel>, threshold: f32) -> Self {
        Self {
            bus,
            model,
            threshold,
            metric_window: Duration::from_secs(60),
        }
    }

    /// Blocking loop: read chunks, classify, forward speech. Exits when the
    /// stop event fires.
    pub async fn run(&self, stream_id: Uuid, stop_rx: watch::Receiver<bool>) {
        let in_key = keys::audio_chunks(stream_id);
        let out_key = keys::speech_chunks(stream_id);
        let stream_label = stream_id.to_string();
        let mut last_id = "0".to_string();
        let mut window = SpeechRatioWindow::new(self.metric_window);

        info!(stream_id = %stream_id, "vad gate started");

        while !*stop_rx.borrow() {
            let entries = match self.bus.xread(&in_key, &last_id, 10, 1000).await {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(stream_id = %stream_id, error = %err, "vad queue read failed");
                    metrics::QUEUE_READ_ERRORS.with_label_values(&["vad"]).inc();
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            for entry in entries {
                last_id = entry.id.clone();

                let Some(pcm_b64) = entry.fields.get("pcm_b64") else {
                    warn!(stream_id = %stream_id, entry_id = %entry.id, "chunk missing pcm_b64");
                    continue;
                };
                let pcm = match BASE64.decode(pcm_b64) {
                    Ok(pcm) => pcm,
                    Err(err) => {
                        warn!(stream_id = %stream_id, error = %err, "chunk payload not base64");
                        continue;
                    }
                };

                let model = Arc::clone(&self.model);
                let score = match tokio::task::spawn_blocking(move || model.classify(&pcm)).await {
                    Ok(Ok(score)) => score,
                    Ok(Err(err)) => {
                        warn!(stream_id = %stream_id, error = %err, "vad inference failed");
                        continue;
                    }
                    Err(err) => {
                        warn!(stream_id = %stream_id, error = %err, "vad worker panicked");
                        continue;
                    }
                };

                let is_speech = passes_gate(score, self.threshold);
                window.record(is_speech);

                if is_speech {
                    // Forward the original fields untouched.
                    let fields: Vec<(&str, String)> = entry
                        .fields
                        .iter()
                        .map(|(k, v)| (k.as_str(), v.clone()))
                        .collect();
                    if let Err(err) = self.bus.xadd(&out_key, &fields, QUEUE_MAXLEN).await {
                        warn!(stream_id = %stream_id, error = %err, "speech chunk publish failed");
                    }
                    debug!(stream_id = %stream_id, score, "speech chunk forwarded");
                } else {
                    metrics::VAD_DROPPED
                        .with_label_values(&[&stream_label])
                        .inc();
                    debug!(stream_id = %stream_id, score, "non-speech chunk dropped");
                }
            }

            if let Some(ratio) = window.maybe_flush() {
                metrics::VAD_SPEECH_RATIO
                    .with_label_values(&[&stream_label])
                    .set(ratio as f64);
                info!(stream_id = %stream_id, ratio, "speech ratio window flushed");
            }
        }

        info!(stream_id = %stream_id, "vad gate stopped");
    }
}
