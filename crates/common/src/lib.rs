pub mod bus;
pub mod config;
pub mod db;
pub mod metrics;
pub mod models;

pub use bus::{BusError, RedisBus, StreamEntry};
pub use config::Settings;

/// Target PCM format shared by every pipeline stage: 16 kHz mono s16le.
pub const SAMPLE_RATE: u32 = 16_000;
pub const BYTES_PER_SAMPLE: usize = 2;

/// Approximate MAXLEN applied to every Redis stream the pipeline writes.
pub const QUEUE_MAXLEN: usize = 10_000;

/// Returns the chunk payload size in bytes for a chunk of `chunk_ms` milliseconds.
pub fn chunk_size_bytes(chunk_ms: u32) -> usize {
    SAMPLE_RATE as usize * chunk_ms as usize / 1000 * BYTES_PER_SAMPLE
}

/// Queue key helpers. Every per-stream queue is keyed `{kind}:{stream_id}`.
pub mod keys {
    use uuid::Uuid;

    pub fn audio_chunks(stream_id: Uuid) -> String {
        format!("audio_chunks:{stream_id}")
    }

    pub fn speech_chunks(stream_id: Uuid) -> String {
        format!("speech_chunks:{stream_id}")
    }

    pub fn transcript_tokens(stream_id: Uuid) -> String {
        format!("transcript_tokens:{stream_id}")
    }

    pub fn diarization_events(stream_id: Uuid) -> String {
        format!("diarization_events:{stream_id}")
    }

    pub fn enriched_tokens(stream_id: Uuid) -> String {
        format!("enriched_tokens:{stream_id}")
    }

    pub fn match_events(stream_id: Uuid) -> String {
        format!("match_events:{stream_id}")
    }

    pub fn sentiment_events(stream_id: Uuid) -> String {
        format!("sentiment_events:{stream_id}")
    }

    pub fn redacted_tokens(stream_id: Uuid) -> String {
        format!("redacted_tokens:{stream_id}")
    }
}
