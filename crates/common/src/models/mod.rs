//! Shared data models for streams, sessions, transcripts, rules, alerts,
//! and audit anchors. Field sets mirror the persisted schema so the same
//! types flow through queues and into storage.

pub mod alert;
pub mod audit;
pub mod rule;
pub mod stream;
pub mod transcript;

pub use alert::{
    Alert, AlertChannelConfig, AlertType, ChannelType, DeliveryOutcome, KeywordMatchEvent,
    MatchType, SentimentEvent,
};
pub use audit::AuditAnchor;
pub use rule::{KeywordRule, RuleMatchType, Severity};
pub use stream::{Session, SourceType, Stream, StreamStatus};
pub use transcript::{
    AudioChunk, EnrichedToken, SpeakerSegment, TranscriptSegment, TranscriptToken, WordTimestamp,
};
