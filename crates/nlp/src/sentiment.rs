//! Sentiment classification with per-stream rolling history and the
//! consecutive-negative escalation rule.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use voxsentinel_common::models::SentimentEvent;

/// Binary sentiment model. Synchronous and CPU-bound; the engine runs it
/// through `spawn_blocking`.
pub trait SentimentModel: Send + Sync {
    /// Returns `(label, score)` where label is `POSITIVE` or `NEGATIVE`.
    fn classify(&self, text: &str) -> anyhow::Result<(String, f64)>;
}

/// Word-list classifier standing in for a transformer model.
///
/// Score grows with the number of lexicon hits so sustained hostile
/// language clears the escalation threshold.
pub struct LexiconSentiment {
    positive: HashSet<&'static str>,
    negative: HashSet<&'static str>,
}

impl LexiconSentiment {
    pub fn new() -> Self {
        let positive = [
            "good", "great", "excellent", "wonderful", "amazing", "perfect", "happy", "love",
            "thanks", "thank", "pleased", "helpful", "fantastic", "appreciate", "resolved",
        ]
        .into_iter()
        .collect();
        let negative = [
            "bad", "terrible", "awful", "horrible", "angry", "furious", "hate", "worst",
            "useless", "broken", "unacceptable", "disgusting", "stupid", "threat", "threatening",
            "kill", "scam", "liar", "lawsuit", "outraged", "disgrace", "incompetent",
        ]
        .into_iter()
        .collect();
        Self { positive, negative }
    }
}

impl Default for LexiconSentiment {
    fn default() -> Self {
        Self::new()
    }
}

impl SentimentModel for LexiconSentiment {
    fn classify(&self, text: &str) -> anyhow::Result<(String, f64)> {
        let mut positive = 0usize;
        let mut negative = 0usize;
        for raw in text.split_whitespace() {
            let word: String = raw
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase();
            if self.positive.contains(word.as_str()) {
                positive += 1;
            } else if self.negative.contains(word.as_str()) {
                negative += 1;
            }
        }

        let (label, hits) = if negative > positive {
            ("NEGATIVE", negative)
        } else {
            ("POSITIVE", positive)
        };
        let score = if hits == 0 {
            0.5
        } else {
            (0.6 + 0.1 * hits as f64).min(0.99)
        };
        Ok((label.to_string(), score))
    }
}

/// Maps model output labels to the normalized lowercase form.
fn normalize_label(label: &str) -> &'static str {
    match label.to_ascii_uppercase().as_str() {
        "POSITIVE" => "positive",
        "NEGATIVE" => "negative",
        _ => "neutral",
    }
}

#[derive(Debug, Clone)]
struct SpanRecord {
    label: String,
    score: f64,
    end_s: f64,
}

/// Classification result plus any escalation event it triggered.
#[derive(Debug)]
pub struct SentimentOutcome {
    pub label: String,
    pub score: f64,
    pub escalation: Option<SentimentEvent>,
}

/// Rolling sentiment tracker.
///
/// Escalates when the last `consecutive` spans are all negative with a
/// score strictly above the threshold. The rule stays true for further
/// qualifying tokens in the same streak; downstream dedup collapses the
/// repeats.
pub struct SentimentEngine {
    model: Option<Arc<dyn SentimentModel>>,
    consecutive: usize,
    score_threshold: f64,
    window_s: f64,
    history: Mutex<HashMap<Uuid, VecDeque<SpanRecord>>>,
}

impl SentimentEngine {
    pub fn new(
        model: Option<Arc<dyn SentimentModel>>,
        consecutive: usize,
        score_threshold: f64,
        window_s: f64,
    ) -> Self {
        if model.is_none() {
            warn!("no sentiment model configured, running degraded (neutral only)");
        }
        Self {
            model,
            consecutive,
            score_threshold,
            window_s,
            history: Mutex::new(HashMap::new()),
        }
    }

    pub async fn classify(
        &self,
        text: &str,
        end_s: f64,
        stream_id: Uuid,
        session_id: Uuid,
        speaker_id: Option<&str>,
    ) -> SentimentOutcome {
        let Some(model) = &self.model else {
            return SentimentOutcome {
                label: "neutral".into(),
                score: 0.0,
                escalation: None,
            };
        };
        if text.trim().is_empty() {
            return SentimentOutcome {
                label: "neutral".into(),
                score: 0.0,
                escalation: None,
            };
        }

        let model = Arc::clone(model);
        let owned = text.to_string();
        let raw = tokio::task::spawn_blocking(move || model.classify(&owned)).await;
        let (raw_label, score) = match raw {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                warn!(stream_id = %stream_id, error = %err, "sentiment inference failed");
                return SentimentOutcome {
                    label: "neutral".into(),
                    score: 0.0,
                    escalation: None,
                };
            }
            Err(err) => {
                warn!(stream_id = %stream_id, error = %err, "sentiment worker panicked");
                return SentimentOutcome {
                    label: "neutral".into(),
                    score: 0.0,
                    escalation: None,
                };
            }
        };

        let label = normalize_label(&raw_label).to_string();
        let escalate = {
            let mut history = self.history.lock();
            let records = history.entry(stream_id).or_default();
            records.push_back(SpanRecord {
                label: label.clone(),
                score,
                end_s,
            });

            let latest = records
                .iter()
                .map(|r| r.end_s)
                .fold(f64::NEG_INFINITY, f64::max);
            let cutoff = latest - self.window_s;
            while records.front().is_some_and(|r| r.end_s < cutoff) {
                records.pop_front();
            }

            records.len() >= self.consecutive
                && records
                    .iter()
                    .rev()
                    .take(self.consecutive)
                    .all(|r| r.label == "negative" && r.score > self.score_threshold)
        };

        let escalation = if escalate {
            info!(
                stream_id = %stream_id,
                consecutive = self.consecutive,
                score,
                "sentiment escalation triggered"
            );
            Some(SentimentEvent {
                stream_id,
                session_id,
                speaker_id: speaker_id.map(str::to_string),
                sentiment_label: label.clone(),
                sentiment_score: score as f32,
            })
        } else {
            None
        };

        SentimentOutcome {
            label,
            score,
            escalation,
        }
    }

    /// Drops rolling history for a stopped stream.
    pub fn remove_stream(&self, stream_id: &Uuid) {
        self.history.lock().remove(stream_id);
    }
}
