//! Prometheus metric registry shared by every pipeline component.
//!
//! Registered against the default registry; the operator scrapes it from
//! whatever surface hosts the process.

use once_cell::sync::Lazy;
use prometheus::{
    register_gauge_vec, register_int_counter_vec, GaugeVec, IntCounterVec,
};

/// Chunks published to `audio_chunks:{stream_id}`.
pub static CHUNKS_PUBLISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "vox_chunks_published_total",
        "Audio chunks published per stream.",
        &["stream_id"]
    )
    .expect("register vox_chunks_published_total")
});

/// Reconnection attempts per stream.
pub static STREAM_RECONNECTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "vox_stream_reconnections_total",
        "Source reconnection attempts per stream.",
        &["stream_id"]
    )
    .expect("register vox_stream_reconnections_total")
});

/// Ratio of speech chunks to total chunks per stream (60 s window).
pub static VAD_SPEECH_RATIO: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "vox_vad_speech_ratio",
        "Ratio of speech chunks to total chunks per stream (60 s window).",
        &["stream_id"]
    )
    .expect("register vox_vad_speech_ratio")
});

/// Chunks dropped by the VAD gate.
pub static VAD_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "vox_vad_dropped_total",
        "Chunks below the VAD threshold per stream.",
        &["stream_id"]
    )
    .expect("register vox_vad_dropped_total")
});

/// Failover activations per stream.
pub static ASR_FAILOVERS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "vox_asr_failovers_total",
        "Failover transitions to the fallback ASR engine.",
        &["stream_id"]
    )
    .expect("register vox_asr_failovers_total")
});

/// Chunks abandoned because the breaker was open with no fallback.
pub static ASR_CIRCUIT_OPEN_DROPS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "vox_asr_circuit_open_drops_total",
        "Chunks dropped while the ASR circuit was open with no fallback.",
        &["stream_id"]
    )
    .expect("register vox_asr_circuit_open_drops_total")
});

/// Alerts dispatched to at least one channel.
pub static ALERTS_DISPATCHED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "vox_alerts_dispatched_total",
        "Alerts fanned out per stream.",
        &["stream_id"]
    )
    .expect("register vox_alerts_dispatched_total")
});

/// Alerts suppressed before fan-out, labelled by reason (dedup/throttle).
pub static ALERTS_SUPPRESSED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "vox_alerts_suppressed_total",
        "Alerts suppressed before fan-out.",
        &["stream_id", "reason"]
    )
    .expect("register vox_alerts_suppressed_total")
});

/// Transient queue read errors per component; slow-consumer loss shows here.
pub static QUEUE_READ_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "vox_queue_read_errors_total",
        "Transient queue read errors per component.",
        &["component"]
    )
    .expect("register vox_queue_read_errors_total")
});

/// Transcript segments persisted.
pub static SEGMENTS_WRITTEN: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "vox_segments_written_total",
        "Transcript segments persisted per stream.",
        &["stream_id"]
    )
    .expect("register vox_segments_written_total")
});

/// Audit anchors written.
pub static ANCHORS_WRITTEN: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "vox_anchors_written_total",
        "Audit anchors committed.",
        &["outcome"]
    )
    .expect("register vox_anchors_written_total")
});
