//! NLP enrichment: keyword detection over sliding transcript windows,
//! rolling sentiment with escalation, PII redaction, and the per-token
//! pipeline tying them together.

pub mod keyword;
pub mod pii;
pub mod pipeline;
pub mod rules;
pub mod sentiment;
pub mod window;

pub use keyword::{KeywordEngine, MatcherIndex};
pub use pii::{PatternPiiDetector, PiiDetector, PiiEntity, PiiRedactor, RedactionResult};
pub use pipeline::{NlpPipeline, TokenOutputs, TokenProcessor};
pub use rules::RuleHotReloader;
pub use sentiment::{LexiconSentiment, SentimentEngine, SentimentModel, SentimentOutcome};
pub use window::SlidingWindow;
