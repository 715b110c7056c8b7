//! Whisper-style batch engine: accumulates PCM until the configured
//! window fills, runs one batch transcription, and yields segment-level
//! final tokens with word timings offset by the samples already processed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tracing::info;

use voxsentinel_common::models::{TranscriptToken, WordTimestamp};
use voxsentinel_common::{BYTES_PER_SAMPLE, SAMPLE_RATE};

use crate::engine::AsrEngine;

/// One transcribed segment from a batch model, times relative to the
/// transcribed buffer.
#[derive(Debug, Clone)]
pub struct WhisperSegment {
    pub text: String,
    pub start_s: f64,
    pub end_s: f64,
    pub words: Vec<WhisperWord>,
    pub language: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WhisperWord {
    pub word: String,
    pub start_s: f64,
    pub end_s: f64,
    pub probability: f32,
}

/// Batch transcription backend. Synchronous and CPU-bound; the engine
/// runs it through `spawn_blocking`.
pub trait WhisperModel: Send + Sync {
    fn transcribe(&self, samples: &[f32]) -> anyhow::Result<Vec<WhisperSegment>>;
}

struct EngineState {
    buffer: Vec<u8>,
    total_samples: u64,
    session_start: Option<DateTime<Utc>>,
}

/// Accumulating batch ASR engine.
pub struct WhisperEngine {
    model: Arc<dyn WhisperModel>,
    accumulation_bytes: usize,
    state: Mutex<EngineState>,
}

impl WhisperEngine {
    pub fn new(model: Arc<dyn WhisperModel>, accumulation_seconds: f32) -> Self {
        let accumulation_bytes =
            (accumulation_seconds * SAMPLE_RATE as f32) as usize * BYTES_PER_SAMPLE;
        Self {
            model,
            accumulation_bytes,
            state: Mutex::new(EngineState {
                buffer: Vec::new(),
                total_samples: 0,
                session_start: None,
            }),
        }
    }

    fn tokens_from_segments(
        segments: Vec<WhisperSegment>,
        offset_s: f64,
        session_start: DateTime<Utc>,
    ) -> Vec<TranscriptToken> {
        let mut tokens = Vec::with_capacity(segments.len());
        for segment in segments {
            let text = segment.text.trim().to_string();
            if text.is_empty() {
                continue;
            }

            let words: Vec<WordTimestamp> = segment
                .words
                .iter()
                .map(|w| WordTimestamp {
                    word: w.word.trim().to_string(),
                    start_ms: ((offset_s + w.start_s) * 1000.0) as u64,
                    end_ms: ((offset_s + w.end_s) * 1000.0) as u64,
                    confidence: w.probability,
                })
                .collect();
            let confidence = if words.is_empty() {
                0.0
            } else {
                words.iter().map(|w| w.confidence).sum::<f32>() / words.len() as f32
            };

            let start_s = offset_s + segment.start_s;
            let end_s = offset_s + segment.end_s;
            tokens.push(TranscriptToken {
                text,
                is_final: true,
                start_time: session_start
                    + ChronoDuration::milliseconds((start_s * 1000.0) as i64),
                end_time: session_start + ChronoDuration::milliseconds((end_s * 1000.0) as i64),
                start_ms: (start_s * 1000.0) as u64,
                end_ms: (end_s * 1000.0) as u64,
                confidence,
                language: segment.language.clone().unwrap_or_else(|| "en".into()),
                word_timestamps: words,
            });
        }
        tokens
    }
}

#[async_trait]
impl AsrEngine for WhisperEngine {
    fn name(&self) -> &str {
        "whisper_v3_turbo"
    }

    async fn connect(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.session_start = Some(Utc::now());
        state.buffer.clear();
        state.total_samples = 0;
        info!(engine = self.name(), "batch ASR engine ready");
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.session_start = None;
        state.buffer.clear();
        Ok(())
    }

    async fn stream_audio(&self, chunk: &[u8]) -> anyhow::Result<Vec<TranscriptToken>> {
        let (buffer, offset_samples, session_start) = {
            let mut state = self.state.lock();
            let session_start = state
                .session_start
                .ok_or_else(|| anyhow::anyhow!("whisper engine is not connected"))?;
            state.buffer.extend_from_slice(chunk);
            if state.buffer.len() < self.accumulation_bytes {
                return Ok(Vec::new());
            }
            let buffer = std::mem::take(&mut state.buffer);
            let offset_samples = state.total_samples;
            state.total_samples += (buffer.len() / BYTES_PER_SAMPLE) as u64;
            (buffer, offset_samples, session_start)
        };

        let samples: Vec<f32> = buffer
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
            .collect();

        let model = Arc::clone(&self.model);
        let segments =
            tokio::task::spawn_blocking(move || model.transcribe(&samples)).await??;

        let offset_s = offset_samples as f64 / SAMPLE_RATE as f64;
        Ok(Self::tokens_from_segments(segments, offset_s, session_start))
    }

    async fn health_check(&self) -> bool {
        self.state.lock().session_start.is_some()
    }
}

/// whisper-rs backend for the batch engine.
#[cfg(feature = "local-whisper")]
pub struct LocalWhisperModel {
    context: whisper_rs::WhisperContext,
}

#[cfg(feature = "local-whisper")]
impl LocalWhisperModel {
    pub fn load(model_path: &str) -> anyhow::Result<Self> {
        let context = whisper_rs::WhisperContext::new_with_params(
            model_path,
            whisper_rs::WhisperContextParameters::default(),
        )
        .map_err(|e| anyhow::anyhow!("failed to load whisper model '{}': {:?}", model_path, e))?;
        Ok(Self { context })
    }
}

#[cfg(feature = "local-whisper")]
impl WhisperModel for LocalWhisperModel {
    fn transcribe(&self, samples: &[f32]) -> anyhow::Result<Vec<WhisperSegment>> {
        use whisper_rs::{FullParams, SamplingStrategy};

        let mut state = self
            .context
            .create_state()
            .map_err(|e| anyhow::anyhow!("whisper state creation failed: {:?}", e))?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_print_progress(false);
        params.set_print_special(false);
        params.set_print_realtime(false);
        params.set_token_timestamps(true);

        state
            .full(params, samples)
            .map_err(|e| anyhow::anyhow!("whisper inference failed: {:?}", e))?;

        let n_segments = state
            .full_n_segments()
            .map_err(|e| anyhow::anyhow!("whisper segment count failed: {:?}", e))?;

        let mut segments = Vec::with_capacity(n_segments as usize);
        for i in 0..n_segments {
            let text = state
                .full_get_segment_text(i)
                .map_err(|e| anyhow::anyhow!("whisper segment text failed: {:?}", e))?;
            // Segment timestamps are centiseconds.
            let start_s = state.full_get_segment_t0(i).unwrap_or(0) as f64 / 100.0;
            let end_s = state.full_get_segment_t1(i).unwrap_or(0) as f64 / 100.0;

            let mut words = Vec::new();
            if let Ok(n_tokens) = state.full_n_tokens(i) {
                for t in 0..n_tokens {
                    let Ok(token_text) = state.full_get_token_text(i, t) else {
                        continue;
                    };
                    if token_text.starts_with("[_") {
                        continue;
                    }
                    if let Ok(data) = state.full_get_token_data(i, t) {
                        words.push(WhisperWord {
                            word: token_text,
                            start_s: data.t0 as f64 / 100.0,
                            end_s: data.t1 as f64 / 100.0,
                            probability: data.p,
                        });
                    }
                }
            }

            segments.push(WhisperSegment {
                text,
                start_s,
                end_s,
                words,
                language: None,
            });
        }
        Ok(segments)
    }
}
