use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of audio source a stream ingests from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Rtsp,
    Hls,
    Dash,
    Sip,
    File,
}

/// Lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Active,
    Paused,
    Error,
    Stopped,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamStatus::Active => "active",
            StreamStatus::Paused => "paused",
            StreamStatus::Error => "error",
            StreamStatus::Stopped => "stopped",
        }
    }
}

/// A configured audio source being processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    pub stream_id: Uuid,
    pub name: String,
    pub source_type: SourceType,
    pub source_url: String,
    /// Primary ASR engine identifier.
    pub asr_backend: String,
    /// Optional fallback ASR engine identifier.
    #[serde(default)]
    pub asr_fallback_backend: Option<String>,
    #[serde(default)]
    pub language_override: Option<String>,
    /// Speech-confidence threshold for the VAD gate (0.0-1.0).
    pub vad_threshold: f32,
    /// Chunk duration in milliseconds.
    pub chunk_size_ms: u32,
    pub status: StreamStatus,
    /// Session currently attached to this stream, if any.
    #[serde(default)]
    pub session_id: Option<Uuid>,
}

/// One continuous processing run of a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub stream_id: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub asr_backend_used: String,
    #[serde(default)]
    pub total_segments: i32,
    #[serde(default)]
    pub total_alerts: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_status_roundtrips_lowercase() {
        let json = serde_json::to_string(&StreamStatus::Active).unwrap();
        assert_eq!(json, "\"active\"");
        let back: StreamStatus = serde_json::from_str("\"error\"").unwrap();
        assert_eq!(back, StreamStatus::Error);
    }

    #[test]
    fn stream_deserializes_without_optional_fields() {
        let json = r#"{
            "stream_id": "11111111-1111-1111-1111-111111111111",
            "name": "lobby cam",
            "source_type": "rtsp",
            "source_url": "rtsp://cam.local/stream",
            "asr_backend": "deepgram_nova2",
            "vad_threshold": 0.5,
            "chunk_size_ms": 280,
            "status": "active"
        }"#;
        let stream: Stream = serde_json::from_str(json).unwrap();
        assert!(stream.asr_fallback_backend.is_none());
        assert!(stream.session_id.is_none());
    }
}
