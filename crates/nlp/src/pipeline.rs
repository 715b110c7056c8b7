//! Per-token NLP pipeline: keyword, sentiment, and PII run concurrently
//! for every final token, then the results are published downstream.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use voxsentinel_common::models::{EnrichedToken, KeywordMatchEvent, SentimentEvent};
use voxsentinel_common::{keys, metrics, RedisBus, QUEUE_MAXLEN};

use crate::keyword::KeywordEngine;
use crate::pii::PiiRedactor;
use crate::sentiment::SentimentEngine;

/// Label the speaker merger assigns when no diarization segments exist.
const SPEAKER_UNKNOWN_LABEL: &str = "SPEAKER_UNKNOWN";

/// Everything one token produces across the three sub-pipelines.
#[derive(Debug)]
pub struct TokenOutputs {
    pub match_events: Vec<KeywordMatchEvent>,
    pub escalation: Option<SentimentEvent>,
    pub redacted_entry: Vec<(&'static str, String)>,
}

/// The three engines plus the concurrency structure, independent of any
/// transport.
pub struct TokenProcessor {
    keywords: Arc<KeywordEngine>,
    sentiment: Arc<SentimentEngine>,
    pii: Arc<PiiRedactor>,
}

impl TokenProcessor {
    pub fn new(
        keywords: Arc<KeywordEngine>,
        sentiment: Arc<SentimentEngine>,
        pii: Arc<PiiRedactor>,
    ) -> Self {
        Self {
            keywords,
            sentiment,
            pii,
        }
    }

    pub fn keywords(&self) -> &Arc<KeywordEngine> {
        &self.keywords
    }

    /// Runs the three sub-pipelines concurrently for one final token.
    /// Returns `None` for partial or empty tokens.
    pub async fn process(&self, token: &EnrichedToken) -> Option<TokenOutputs> {
        if !token.is_final || token.text.trim().is_empty() {
            return None;
        }

        let start_s = token.start_ms as f64 / 1000.0;
        let end_s = token.end_ms as f64 / 1000.0;
        let speaker = if token.speaker_id == SPEAKER_UNKNOWN_LABEL {
            None
        } else {
            Some(token.speaker_id.clone())
        };

        let keyword_task = {
            let engine = Arc::clone(&self.keywords);
            let text = token.text.clone();
            let speaker = speaker.clone();
            let (stream_id, session_id) = (token.stream_id, token.session_id);
            tokio::task::spawn_blocking(move || {
                engine.detect(
                    &text,
                    start_s,
                    end_s,
                    stream_id,
                    session_id,
                    speaker.as_deref(),
                )
            })
        };

        let (keyword_result, sentiment_outcome, redaction) = tokio::join!(
            keyword_task,
            self.sentiment.classify(
                &token.text,
                end_s,
                token.stream_id,
                token.session_id,
                speaker.as_deref(),
            ),
            self.pii.redact(&token.text),
        );

        let match_events = match keyword_result {
            Ok(events) => events,
            Err(err) => {
                warn!(stream_id = %token.stream_id, error = %err, "keyword worker panicked");
                Vec::new()
            }
        };

        let entities_json = serde_json::to_string(&redaction.entities_found)
            .unwrap_or_else(|_| "[]".to_string());
        let words_json =
            serde_json::to_string(&token.word_timestamps).unwrap_or_else(|_| "[]".to_string());

        let redacted_entry = vec![
            ("text_original", token.text.clone()),
            ("text_redacted", redaction.redacted_text),
            ("entities_found", entities_json),
            ("sentiment_label", sentiment_outcome.label.clone()),
            ("sentiment_score", sentiment_outcome.score.to_string()),
            ("start_time", token.start_time.to_rfc3339()),
            ("end_time", token.end_time.to_rfc3339()),
            ("session_id", token.session_id.to_string()),
            ("speaker_id", token.speaker_id.clone()),
            ("language", token.language.clone()),
            ("confidence", token.confidence.to_string()),
            ("start_ms", token.start_ms.to_string()),
            ("end_ms", token.end_ms.to_string()),
            ("word_timestamps", words_json),
        ];

        Some(TokenOutputs {
            match_events,
            escalation: sentiment_outcome.escalation,
            redacted_entry,
        })
    }

    /// Drops per-stream state for a stopped stream.
    pub fn remove_stream(&self, stream_id: &Uuid) {
        self.keywords.remove_stream(stream_id);
        self.sentiment.remove_stream(stream_id);
    }
}

/// Transport wrapper: consumes enriched tokens and publishes outputs.
pub struct NlpPipeline {
    bus: RedisBus,
    processor: Arc<TokenProcessor>,
}

impl NlpPipeline {
    pub fn new(bus: RedisBus, processor: Arc<TokenProcessor>) -> Self {
        Self { bus, processor }
    }

    /// Publishes one token's outputs: match events and escalations to
    /// pub/sub, the redacted token onto its stream.
    pub async fn publish(&self, stream_id: Uuid, outputs: &TokenOutputs) {
        let match_channel = keys::match_events(stream_id);
        for event in &outputs.match_events {
            match serde_json::to_string(event) {
                Ok(payload) => {
                    if let Err(err) = self.bus.publish(&match_channel, &payload).await {
                        warn!(stream_id = %stream_id, error = %err, "match event publish failed");
                    }
                }
                Err(err) => {
                    warn!(stream_id = %stream_id, error = %err, "match event serialization failed");
                }
            }
        }

        if let Some(event) = &outputs.escalation {
            match serde_json::to_string(event) {
                Ok(payload) => {
                    let channel = keys::sentiment_events(stream_id);
                    if let Err(err) = self.bus.publish(&channel, &payload).await {
                        warn!(stream_id = %stream_id, error = %err, "sentiment event publish failed");
                    }
                }
                Err(err) => {
                    warn!(stream_id = %stream_id, error = %err, "sentiment event serialization failed");
                }
            }
        }

        let entry: Vec<(&str, String)> = outputs
            .redacted_entry
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        if let Err(err) = self
            .bus
            .xadd(&keys::redacted_tokens(stream_id), &entry, QUEUE_MAXLEN)
            .await
        {
            warn!(stream_id = %stream_id, error = %err, "redacted token publish failed");
        }
    }

    /// Consumes `enriched_tokens:{sid}` until the stop event fires.
    pub async fn run(&self, stream_id: Uuid, stop_rx: watch::Receiver<bool>) {
        let in_key = keys::enriched_tokens(stream_id);
        let mut last_id = "0".to_string();

        info!(stream_id = %stream_id, "nlp pipeline started");

        while !*stop_rx.borrow() {
            let entries = match self.bus.xread(&in_key, &last_id, 10, 1000).await {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(stream_id = %stream_id, error = %err, "nlp queue read failed");
                    metrics::QUEUE_READ_ERRORS.with_label_values(&["nlp"]).inc();
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            for entry in entries {
                last_id = entry.id.clone();
                let Some(raw) = entry.fields.get("token") else {
                    continue;
                };
                let token: EnrichedToken = match serde_json::from_str(raw) {
                    Ok(token) => token,
                    Err(err) => {
                        warn!(stream_id = %stream_id, error = %err, "bad enriched token");
                        continue;
                    }
                };

                if let Some(outputs) = self.processor.process(&token).await {
                    self.publish(stream_id, &outputs).await;
                }
            }
        }

        // Drop per-stream state so a restarted stream begins fresh.
        self.processor.remove_stream(&stream_id);
        info!(stream_id = %stream_id, "nlp pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pii::PatternPiiDetector;
    use crate::sentiment::LexiconSentiment;
    use chrono::Utc;
    use voxsentinel_common::models::{MatchType, RuleMatchType, Severity};

    fn token(text: &str, is_final: bool) -> EnrichedToken {
        EnrichedToken {
            text: text.into(),
            is_final,
            start_ms: 0,
            end_ms: 1000,
            confidence: 0.9,
            language: "en".into(),
            speaker_id: "SPEAKER_00".into(),
            stream_id: Uuid::from_u128(1),
            session_id: Uuid::from_u128(2),
            start_time: Utc::now(),
            end_time: Utc::now(),
            word_timestamps: vec![],
        }
    }

    fn rule(keyword: &str) -> voxsentinel_common::models::KeywordRule {
        voxsentinel_common::models::KeywordRule {
            rule_id: Uuid::new_v4(),
            rule_set_name: "safety".into(),
            keyword: keyword.into(),
            match_type: RuleMatchType::Exact,
            fuzzy_threshold: 0.8,
            severity: Severity::Critical,
            category: "general".into(),
            language: None,
            enabled: true,
        }
    }

    fn processor() -> TokenProcessor {
        TokenProcessor::new(
            Arc::new(KeywordEngine::new(10.0)),
            Arc::new(SentimentEngine::new(
                Some(Arc::new(LexiconSentiment::new())),
                3,
                0.8,
                30.0,
            )),
            Arc::new(PiiRedactor::new(Some(Arc::new(PatternPiiDetector)))),
        )
    }

    fn entry_value<'a>(outputs: &'a TokenOutputs, key: &str) -> &'a str {
        outputs
            .redacted_entry
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn exact_keyword_match_event_shape() {
        let processor = processor();
        processor.keywords().load_rules(&[rule("gun")]);

        let outputs = processor
            .process(&token("he has a gun", true))
            .await
            .unwrap();
        assert_eq!(outputs.match_events.len(), 1);
        let event = &outputs.match_events[0];
        assert_eq!(event.keyword, "gun");
        assert_eq!(event.match_type, MatchType::Exact);
        assert_eq!(event.similarity_score, Some(1.0));
        assert_eq!(event.matched_text, "gun");
        assert_eq!(event.surrounding_context, "he has a gun");
        assert_eq!(event.speaker_id.as_deref(), Some("SPEAKER_00"));
    }

    #[tokio::test]
    async fn partial_tokens_are_skipped() {
        let processor = processor();
        processor.keywords().load_rules(&[rule("gun")]);
        assert!(processor
            .process(&token("he has a gun", false))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn empty_tokens_are_skipped() {
        let processor = processor();
        assert!(processor.process(&token("   ", true)).await.is_none());
    }

    #[tokio::test]
    async fn redaction_and_sentiment_flow_into_entry() {
        let processor = processor();
        let outputs = processor
            .process(&token("reach me at jane@corp.io", true))
            .await
            .unwrap();
        assert_eq!(entry_value(&outputs, "text_redacted"), "reach me at [EMAIL]");
        assert_eq!(
            entry_value(&outputs, "text_original"),
            "reach me at jane@corp.io"
        );
        let entities: Vec<String> =
            serde_json::from_str(entry_value(&outputs, "entities_found")).unwrap();
        assert_eq!(entities, vec!["EMAIL_ADDRESS"]);
        assert!(!entry_value(&outputs, "sentiment_label").is_empty());
        assert_eq!(entry_value(&outputs, "speaker_id"), "SPEAKER_00");
    }

    #[tokio::test]
    async fn hostile_streak_escalates() {
        let processor = processor();
        let hostile = "this is terrible awful horrible unacceptable";
        let mut escalated = false;
        for i in 0..3u64 {
            let mut t = token(hostile, true);
            t.start_ms = i * 1000;
            t.end_ms = (i + 1) * 1000;
            let outputs = processor.process(&t).await.unwrap();
            escalated = outputs.escalation.is_some();
        }
        assert!(escalated);
    }

    #[tokio::test]
    async fn unknown_speaker_becomes_none_in_events() {
        let processor = processor();
        processor.keywords().load_rules(&[rule("gun")]);
        let mut t = token("a gun", true);
        t.speaker_id = "SPEAKER_UNKNOWN".into();
        let outputs = processor.process(&t).await.unwrap();
        assert_eq!(outputs.match_events[0].speaker_id, None);
    }
}
