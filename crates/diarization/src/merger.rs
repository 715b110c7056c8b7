//! Joins ASR tokens with the latest speaker turns to produce enriched
//! tokens on `enriched_tokens:{sid}`.

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use voxsentinel_common::models::{EnrichedToken, SpeakerSegment, TranscriptToken};
use voxsentinel_common::{keys, metrics, RedisBus, QUEUE_MAXLEN};

pub const SPEAKER_UNKNOWN: &str = "SPEAKER_UNKNOWN";

/// How far behind the newest segment end older segments are retained.
/// Tokens arrive within seconds of their audio, so this comfortably covers
/// ASR latency while bounding memory.
const SEGMENT_HORIZON_MS: u64 = 30_000;

/// Sorted speaker-segment list with the containment / neighbor /
/// nearest-midpoint assignment rule.
#[derive(Default)]
pub struct SpeakerMerger {
    segments: Vec<SpeakerSegment>,
}

impl SpeakerMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole segment list (sorted by start).
    pub fn replace_segments(&mut self, mut segments: Vec<SpeakerSegment>) {
        segments.sort_by_key(|s| s.start_ms);
        self.segments = segments;
    }

    /// Inserts one segment from the event channel, evicting segments far
    /// behind the newest end time.
    pub fn push_segment(&mut self, segment: SpeakerSegment) {
        let newest_end = self
            .segments
            .iter()
            .map(|s| s.end_ms)
            .chain(std::iter::once(segment.end_ms))
            .max()
            .unwrap_or(0);

        let position = self
            .segments
            .partition_point(|s| s.start_ms <= segment.start_ms);
        self.segments.insert(position, segment);

        let horizon = newest_end.saturating_sub(SEGMENT_HORIZON_MS);
        self.segments.retain(|s| s.end_ms >= horizon);
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Assigns a speaker label to the token span `[start_ms, end_ms]`.
    ///
    /// Containment wins: the latest segment starting at or before the token
    /// start that still covers it. Failing that, the next segment starting
    /// within the token span. Failing both, the segment whose nearest edge
    /// is closest to the token midpoint.
    pub fn assign(&self, start_ms: u64, end_ms: u64) -> String {
        if self.segments.is_empty() {
            return SPEAKER_UNKNOWN.to_string();
        }

        // Index of the last segment with segment.start_ms <= start_ms.
        let upper = self.segments.partition_point(|s| s.start_ms <= start_ms);
        if upper > 0 {
            let candidate = &self.segments[upper - 1];
            if candidate.end_ms >= start_ms {
                return candidate.speaker_id.clone();
            }
        }
        if upper < self.segments.len() {
            let next = &self.segments[upper];
            if next.start_ms <= end_ms {
                return next.speaker_id.clone();
            }
        }

        let midpoint = (start_ms + end_ms) as f64 / 2.0;
        self.segments
            .iter()
            .min_by(|a, b| {
                edge_distance(a, midpoint).total_cmp(&edge_distance(b, midpoint))
            })
            .map(|s| s.speaker_id.clone())
            .unwrap_or_else(|| SPEAKER_UNKNOWN.to_string())
    }
}

fn edge_distance(segment: &SpeakerSegment, midpoint: f64) -> f64 {
    let d_start = (segment.start_ms as f64 - midpoint).abs();
    let d_end = (segment.end_ms as f64 - midpoint).abs();
    d_start.min(d_end)
}

/// Per-stream worker: consumes `transcript_tokens:{sid}` and
/// `diarization_events:{sid}`, appends enriched tokens.
pub struct SpeakerMergeWorker {
    bus: RedisBus,
    stream_id: Uuid,
    session_id: Uuid,
}

impl SpeakerMergeWorker {
    pub fn new(bus: RedisBus, stream_id: Uuid, session_id: Uuid) -> Self {
        Self {
            bus,
            stream_id,
            session_id,
        }
    }

    pub async fn run(&self, stop_rx: watch::Receiver<bool>) {
        let stream_id = self.stream_id;
        let in_key = keys::transcript_tokens(stream_id);
        let out_key = keys::enriched_tokens(stream_id);

        // Segment events arrive on pub/sub; a listener task forwards them
        // so the token loop can drain without blocking on either source.
        let (segment_tx, mut segment_rx) = mpsc::unbounded_channel::<SpeakerSegment>();
        let listener = {
            let bus = self.bus.clone();
            let channel = keys::diarization_events(stream_id);
            tokio::spawn(async move {
                let mut pubsub = match bus.subscribe(&[channel.as_str()]).await {
                    Ok(pubsub) => pubsub,
                    Err(err) => {
                        warn!(stream_id = %stream_id, error = %err, "diarization subscribe failed");
                        return;
                    }
                };
                let mut messages = pubsub.on_message();
                while let Some(message) = messages.next().await {
                    let payload: String = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(_) => continue,
                    };
                    match serde_json::from_str::<SpeakerSegment>(&payload) {
                        Ok(segment) => {
                            if segment_tx.send(segment).is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(stream_id = %stream_id, error = %err, "bad diarization event");
                        }
                    }
                }
            })
        };

        let mut merger = SpeakerMerger::new();
        let mut last_id = "0".to_string();

        info!(stream_id = %stream_id, "speaker merger started");

        while !*stop_rx.borrow() {
            // Fold in any speaker turns that arrived since the last round.
            while let Ok(segment) = segment_rx.try_recv() {
                merger.push_segment(segment);
            }

            let entries = match self.bus.xread(&in_key, &last_id, 10, 1000).await {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(stream_id = %stream_id, error = %err, "token queue read failed");
                    metrics::QUEUE_READ_ERRORS
                        .with_label_values(&["merger"])
                        .inc();
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            for entry in entries {
                last_id = entry.id.clone();
                let Some(raw) = entry.fields.get("token") else {
                    continue;
                };
                let token: TranscriptToken = match serde_json::from_str(raw) {
                    Ok(token) => token,
                    Err(err) => {
                        warn!(stream_id = %stream_id, error = %err, "bad transcript token");
                        continue;
                    }
                };

                let speaker_id = merger.assign(token.start_ms, token.end_ms);
                debug!(
                    stream_id = %stream_id,
                    speaker = %speaker_id,
                    start_ms = token.start_ms,
                    "token enriched"
                );

                let enriched = EnrichedToken {
                    text: token.text,
                    is_final: token.is_final,
                    start_ms: token.start_ms,
                    end_ms: token.end_ms,
                    confidence: token.confidence,
                    language: token.language,
                    speaker_id,
                    stream_id,
                    session_id: self.session_id,
                    start_time: token.start_time,
                    end_time: token.end_time,
                    word_timestamps: token.word_timestamps,
                };
                match serde_json::to_string(&enriched) {
                    Ok(payload) => {
                        let fields = [("token", payload)];
                        if let Err(err) = self.bus.xadd(&out_key, &fields, QUEUE_MAXLEN).await {
                            warn!(stream_id = %stream_id, error = %err, "enriched token publish failed");
                        }
                    }
                    Err(err) => {
                        warn!(stream_id = %stream_id, error = %err, "enriched token serialization failed");
                    }
                }
            }
        }

        listener.abort();
        info!(stream_id = %stream_id, "speaker merger stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(speaker: &str, start_ms: u64, end_ms: u64) -> SpeakerSegment {
        SpeakerSegment {
            speaker_id: speaker.into(),
            start_ms,
            end_ms,
        }
    }

    #[test]
    fn empty_list_is_unknown() {
        let merger = SpeakerMerger::new();
        assert_eq!(merger.assign(0, 1000), SPEAKER_UNKNOWN);
    }

    #[test]
    fn containment_wins() {
        let mut merger = SpeakerMerger::new();
        merger.replace_segments(vec![
            segment("SPEAKER_00", 0, 2000),
            segment("SPEAKER_01", 2000, 4000),
        ]);
        // Token inside the first turn.
        assert_eq!(merger.assign(500, 1500), "SPEAKER_00");
        // Token inside the second turn.
        assert_eq!(merger.assign(2500, 3500), "SPEAKER_01");
    }

    #[test]
    fn containment_at_boundary() {
        let mut merger = SpeakerMerger::new();
        merger.replace_segments(vec![segment("SPEAKER_00", 0, 2000)]);
        // Token starting exactly at the segment end is still contained.
        assert_eq!(merger.assign(2000, 2500), "SPEAKER_00");
    }

    #[test]
    fn next_segment_overlap_wins_when_no_containment() {
        let mut merger = SpeakerMerger::new();
        merger.replace_segments(vec![
            segment("SPEAKER_00", 0, 1000),
            segment("SPEAKER_01", 3000, 4000),
        ]);
        // Token starts in the gap but reaches into the next turn.
        assert_eq!(merger.assign(2500, 3200), "SPEAKER_01");
    }

    #[test]
    fn nearest_midpoint_fallback() {
        let mut merger = SpeakerMerger::new();
        merger.replace_segments(vec![
            segment("SPEAKER_00", 0, 1000),
            segment("SPEAKER_01", 10_000, 11_000),
        ]);
        // Token in the gap, nearer the first turn's end.
        assert_eq!(merger.assign(1500, 2500), "SPEAKER_00");
        // Token in the gap, nearer the second turn's start.
        assert_eq!(merger.assign(8500, 9500), "SPEAKER_01");
    }

    #[test]
    fn push_segment_keeps_order() {
        let mut merger = SpeakerMerger::new();
        merger.push_segment(segment("SPEAKER_01", 2000, 3000));
        merger.push_segment(segment("SPEAKER_00", 0, 1000));
        assert_eq!(merger.assign(100, 500), "SPEAKER_00");
        assert_eq!(merger.assign(2100, 2500), "SPEAKER_01");
    }

    #[test]
    fn push_segment_evicts_stale_turns() {
        let mut merger = SpeakerMerger::new();
        merger.push_segment(segment("SPEAKER_00", 0, 1000));
        // A segment far in the future pushes the first one out of horizon.
        merger.push_segment(segment("SPEAKER_01", 100_000, 101_000));
        assert_eq!(merger.segment_count(), 1);
        assert_eq!(merger.assign(100_200, 100_500), "SPEAKER_01");
    }
}
