use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single word with its timing and confidence from ASR output.
///
/// Offsets are milliseconds from session start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTimestamp {
    pub word: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub confidence: f32,
}

/// A fixed-duration slice of PCM audio flowing through the chunk queues.
///
/// The payload is exactly `sample_rate * duration_ms / 1000 * 2` bytes of
/// 16 kHz mono s16le PCM. Chunks are transient and never persisted.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub chunk_id: Uuid,
    pub stream_id: Uuid,
    pub session_id: Uuid,
    pub pcm: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u32,
}

impl AudioChunk {
    /// Encodes the chunk as Redis stream entry fields (base64 payload,
    /// RFC3339 timestamp).
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("chunk_id", self.chunk_id.to_string()),
            ("stream_id", self.stream_id.to_string()),
            ("session_id", self.session_id.to_string()),
            ("pcm_b64", BASE64.encode(&self.pcm)),
            ("timestamp", self.timestamp.to_rfc3339()),
            ("duration_ms", self.duration_ms.to_string()),
        ]
    }

    /// Decodes a chunk from Redis stream entry fields.
    pub fn from_fields(
        fields: &std::collections::HashMap<String, String>,
    ) -> Result<Self, ChunkDecodeError> {
        let get = |name: &str| {
            fields
                .get(name)
                .ok_or_else(|| ChunkDecodeError::MissingField(name.to_string()))
        };
        Ok(Self {
            chunk_id: get("chunk_id")?.parse()?,
            stream_id: get("stream_id")?.parse()?,
            session_id: get("session_id")?.parse()?,
            pcm: BASE64.decode(get("pcm_b64")?)?,
            timestamp: DateTime::parse_from_rfc3339(get("timestamp")?)?.with_timezone(&Utc),
            duration_ms: get("duration_ms")?
                .parse()
                .map_err(|_| ChunkDecodeError::MissingField("duration_ms".into()))?,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkDecodeError {
    #[error("missing chunk field '{0}'")]
    MissingField(String),
    #[error("invalid uuid: {0}")]
    Uuid(#[from] uuid::Error),
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),
}

/// A unit of ASR output text; may be partial or final.
///
/// Carries both absolute UTC timestamps and stream-relative millisecond
/// offsets so downstream stages never need the session row for arithmetic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptToken {
    pub text: String,
    #[serde(default)]
    pub is_final: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub start_ms: u64,
    pub end_ms: u64,
    pub confidence: f32,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub word_timestamps: Vec<WordTimestamp>,
}

fn default_language() -> String {
    "en".to_string()
}

/// A diarization result: one speaker turn within a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerSegment {
    pub speaker_id: String,
    pub start_ms: u64,
    pub end_ms: u64,
}

/// A transcript token annotated with its speaker label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedToken {
    pub text: String,
    pub is_final: bool,
    pub start_ms: u64,
    pub end_ms: u64,
    pub confidence: f32,
    pub language: String,
    pub speaker_id: String,
    pub stream_id: Uuid,
    pub session_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub word_timestamps: Vec<WordTimestamp>,
}

/// A persisted final token with all NLP enrichment applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub segment_id: Uuid,
    pub session_id: Uuid,
    pub stream_id: Uuid,
    #[serde(default)]
    pub speaker_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub start_offset_ms: i64,
    #[serde(default)]
    pub end_offset_ms: i64,
    pub text_redacted: String,
    #[serde(default)]
    pub text_original: Option<String>,
    #[serde(default)]
    pub word_timestamps: Vec<WordTimestamp>,
    #[serde(default = "default_language")]
    pub language: String,
    pub asr_backend: String,
    #[serde(default)]
    pub asr_confidence: f32,
    #[serde(default)]
    pub sentiment_label: Option<String>,
    #[serde(default)]
    pub sentiment_score: Option<f32>,
    #[serde(default)]
    pub pii_entities_found: Vec<String>,
    #[serde(default)]
    pub segment_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TranscriptSegment {
    /// SHA-256 audit hash over `segment_id + text + start_time + session_id`.
    ///
    /// The text component is `text_original` when retained, otherwise the
    /// redacted text. Deterministic for fixed inputs.
    pub fn compute_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let text = self
            .text_original
            .as_deref()
            .unwrap_or(&self.text_redacted);
        let payload = format!(
            "{}{}{}{}",
            self.segment_id,
            text,
            self.start_time.to_rfc3339(),
            self.session_id
        );
        hex::encode(Sha256::digest(payload.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample_chunk() -> AudioChunk {
        AudioChunk {
            chunk_id: Uuid::new_v4(),
            stream_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            pcm: vec![0u8; 8960],
            timestamp: Utc::now(),
            duration_ms: 280,
        }
    }

    #[test]
    fn chunk_fields_roundtrip() {
        let chunk = sample_chunk();
        let fields: HashMap<String, String> = chunk
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let decoded = AudioChunk::from_fields(&fields).unwrap();
        assert_eq!(decoded.chunk_id, chunk.chunk_id);
        assert_eq!(decoded.pcm, chunk.pcm);
        assert_eq!(decoded.duration_ms, 280);
    }

    #[test]
    fn chunk_decode_rejects_missing_payload() {
        let chunk = sample_chunk();
        let mut fields: HashMap<String, String> = chunk
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        fields.remove("pcm_b64");
        assert!(matches!(
            AudioChunk::from_fields(&fields),
            Err(ChunkDecodeError::MissingField(f)) if f == "pcm_b64"
        ));
    }

    #[test]
    fn segment_hash_is_deterministic() {
        let segment = TranscriptSegment {
            segment_id: Uuid::nil(),
            session_id: Uuid::nil(),
            stream_id: Uuid::nil(),
            speaker_id: None,
            start_time: DateTime::parse_from_rfc3339("2026-03-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            end_time: Utc::now(),
            start_offset_ms: 0,
            end_offset_ms: 1000,
            text_redacted: "redacted".into(),
            text_original: Some("original".into()),
            word_timestamps: vec![],
            language: "en".into(),
            asr_backend: "deepgram_nova2".into(),
            asr_confidence: 0.9,
            sentiment_label: None,
            sentiment_score: None,
            pii_entities_found: vec![],
            segment_hash: None,
            created_at: Utc::now(),
        };
        let h1 = segment.compute_hash();
        let h2 = segment.compute_hash();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn segment_hash_prefers_original_text() {
        let mut segment = TranscriptSegment {
            segment_id: Uuid::nil(),
            session_id: Uuid::nil(),
            stream_id: Uuid::nil(),
            speaker_id: None,
            start_time: Utc::now(),
            end_time: Utc::now(),
            start_offset_ms: 0,
            end_offset_ms: 0,
            text_redacted: "call [PHONE]".into(),
            text_original: Some("call 555-0100".into()),
            word_timestamps: vec![],
            language: "en".into(),
            asr_backend: "whisper_v3_turbo".into(),
            asr_confidence: 0.5,
            sentiment_label: None,
            sentiment_score: None,
            pii_entities_found: vec![],
            segment_hash: None,
            created_at: Utc::now(),
        };
        let with_original = segment.compute_hash();
        segment.text_original = None;
        let with_redacted = segment.compute_hash();
        assert_ne!(with_original, with_redacted);
    }
}
