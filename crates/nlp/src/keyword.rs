//! Keyword detection: Aho-Corasick exact matching, token-set fuzzy
//! matching, and compiled regex patterns over the per-stream sliding
//! window, with atomic index swap on rule reload.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use aho_corasick::AhoCorasick;
use parking_lot::{Mutex, RwLock};
use regex::RegexBuilder;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use voxsentinel_common::models::{
    KeywordMatchEvent, KeywordRule, MatchType, RuleMatchType, Severity,
};

use crate::window::SlidingWindow;

/// Normalized token-set similarity in [0, 1].
///
/// Tokenizes both inputs, splits into intersection and remainders, and
/// scores the best pairwise edit similarity of the recombined strings. A
/// keyword whose tokens all occur in the haystack scores 1.0.
pub fn token_set_ratio(a: &str, b: &str) -> f64 {
    let tokens_a: BTreeSet<String> = a.split_whitespace().map(str::to_lowercase).collect();
    let tokens_b: BTreeSet<String> = b.split_whitespace().map(str::to_lowercase).collect();
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }

    let intersection: Vec<&String> = tokens_a.intersection(&tokens_b).collect();
    let only_a: Vec<&String> = tokens_a.difference(&tokens_b).collect();
    let only_b: Vec<&String> = tokens_b.difference(&tokens_a).collect();

    let joined = |words: &[&String]| {
        words
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    };

    let base = joined(&intersection);
    let combined_a = if only_a.is_empty() {
        base.clone()
    } else if base.is_empty() {
        joined(&only_a)
    } else {
        format!("{} {}", base, joined(&only_a))
    };
    let combined_b = if only_b.is_empty() {
        base.clone()
    } else if base.is_empty() {
        joined(&only_b)
    } else {
        format!("{} {}", base, joined(&only_b))
    };

    if !base.is_empty() && (base == combined_a || base == combined_b) {
        return 1.0;
    }

    let pairs = [
        (&base, &combined_a),
        (&base, &combined_b),
        (&combined_a, &combined_b),
    ];
    pairs
        .iter()
        .filter(|(x, _)| !x.is_empty())
        .map(|(x, y)| strsim::normalized_levenshtein(x, y))
        .fold(0.0, f64::max)
}

struct ExactRule {
    keyword: String,
    rule_id: Uuid,
    severity: Severity,
}

struct FuzzyRule {
    keyword: String,
    rule_id: Uuid,
    threshold: f32,
    severity: Severity,
}

struct RegexRule {
    pattern: regex::Regex,
    source: String,
    rule_id: Uuid,
    severity: Severity,
}

/// Immutable matcher state built from one rule-set snapshot. Swapped
/// wholesale on reload; in-flight detect calls finish on the old index.
pub struct MatcherIndex {
    automaton: Option<AhoCorasick>,
    exact_rules: Vec<ExactRule>,
    fuzzy_rules: Vec<FuzzyRule>,
    regex_rules: Vec<RegexRule>,
    content_hash: String,
}

impl MatcherIndex {
    pub fn empty() -> Self {
        Self {
            automaton: None,
            exact_rules: Vec::new(),
            fuzzy_rules: Vec::new(),
            regex_rules: Vec::new(),
            content_hash: String::new(),
        }
    }

    /// Builds matcher state from the enabled rules. Invalid regex patterns
    /// are reported back and excluded; the other matchers are unaffected.
    pub fn build(rules: &[KeywordRule]) -> (Self, Vec<String>) {
        let mut exact_rules = Vec::new();
        let mut fuzzy_rules = Vec::new();
        let mut regex_rules = Vec::new();
        let mut errors = Vec::new();

        for rule in rules.iter().filter(|r| r.enabled) {
            match rule.match_type {
                RuleMatchType::Exact => exact_rules.push(ExactRule {
                    keyword: rule.keyword.clone(),
                    rule_id: rule.rule_id,
                    severity: rule.severity,
                }),
                RuleMatchType::Fuzzy => fuzzy_rules.push(FuzzyRule {
                    keyword: rule.keyword.clone(),
                    rule_id: rule.rule_id,
                    threshold: rule.fuzzy_threshold,
                    severity: rule.severity,
                }),
                RuleMatchType::Regex => {
                    match RegexBuilder::new(&rule.keyword).case_insensitive(true).build() {
                        Ok(pattern) => regex_rules.push(RegexRule {
                            pattern,
                            source: rule.keyword.clone(),
                            rule_id: rule.rule_id,
                            severity: rule.severity,
                        }),
                        Err(err) => {
                            let message = format!(
                                "invalid regex '{}' (rule {}): {}",
                                rule.keyword, rule.rule_id, err
                            );
                            warn!(rule_id = %rule.rule_id, error = %err, "regex compile failed");
                            errors.push(message);
                        }
                    }
                }
            }
        }

        let automaton = if exact_rules.is_empty() {
            None
        } else {
            let patterns: Vec<&str> = exact_rules.iter().map(|r| r.keyword.as_str()).collect();
            match AhoCorasick::builder()
                .ascii_case_insensitive(true)
                .build(&patterns)
            {
                Ok(automaton) => Some(automaton),
                Err(err) => {
                    errors.push(format!("failed to build exact-match automaton: {err}"));
                    None
                }
            }
        };

        let index = Self {
            automaton,
            exact_rules,
            fuzzy_rules,
            regex_rules,
            content_hash: rules_content_hash(rules),
        };
        (index, errors)
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn rule_count(&self) -> usize {
        self.exact_rules.len() + self.fuzzy_rules.len() + self.regex_rules.len()
    }

    fn matches(
        &self,
        haystack: &str,
        stream_id: Uuid,
        session_id: Uuid,
        speaker_id: Option<&str>,
    ) -> Vec<KeywordMatchEvent> {
        let mut events = Vec::new();
        if haystack.is_empty() {
            return events;
        }

        if let Some(automaton) = &self.automaton {
            // Overlapping occurrences are all reported.
            for mat in automaton.find_overlapping_iter(haystack) {
                let rule = &self.exact_rules[mat.pattern().as_usize()];
                events.push(KeywordMatchEvent {
                    keyword: rule.keyword.clone(),
                    rule_id: rule.rule_id,
                    match_type: MatchType::Exact,
                    similarity_score: Some(1.0),
                    matched_text: haystack[mat.start()..mat.end()].to_string(),
                    surrounding_context: haystack.to_string(),
                    severity: rule.severity,
                    stream_id,
                    session_id,
                    speaker_id: speaker_id.map(str::to_string),
                });
            }
        }

        for rule in &self.fuzzy_rules {
            let score = token_set_ratio(&rule.keyword, haystack) as f32;
            // Threshold boundary is inclusive.
            if score >= rule.threshold {
                events.push(KeywordMatchEvent {
                    keyword: rule.keyword.clone(),
                    rule_id: rule.rule_id,
                    match_type: MatchType::Fuzzy,
                    similarity_score: Some(score),
                    matched_text: rule.keyword.clone(),
                    surrounding_context: haystack.to_string(),
                    severity: rule.severity,
                    stream_id,
                    session_id,
                    speaker_id: speaker_id.map(str::to_string),
                });
            }
        }

        for rule in &self.regex_rules {
            for mat in rule.pattern.find_iter(haystack) {
                events.push(KeywordMatchEvent {
                    keyword: rule.source.clone(),
                    rule_id: rule.rule_id,
                    match_type: MatchType::Regex,
                    similarity_score: None,
                    matched_text: mat.as_str().to_string(),
                    surrounding_context: haystack.to_string(),
                    severity: rule.severity,
                    stream_id,
                    session_id,
                    speaker_id: speaker_id.map(str::to_string),
                });
            }
        }

        events
    }
}

/// Content hash of a rule set, independent of rule order.
pub fn rules_content_hash(rules: &[KeywordRule]) -> String {
    let mut sorted: Vec<&KeywordRule> = rules.iter().collect();
    sorted.sort_by_key(|r| r.rule_id);
    let mut hasher = Sha256::new();
    for rule in sorted {
        hasher.update(rule.rule_id.as_bytes());
        hasher.update(rule.keyword.as_bytes());
        hasher.update([rule.match_type as u8, rule.severity as u8, rule.enabled as u8]);
        hasher.update(rule.fuzzy_threshold.to_le_bytes());
        hasher.update(rule.category.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Orchestrates the three matchers over per-stream sliding windows.
pub struct KeywordEngine {
    window_s: f64,
    index: RwLock<Arc<MatcherIndex>>,
    windows: Mutex<HashMap<Uuid, SlidingWindow>>,
}

impl KeywordEngine {
    pub fn new(window_s: f64) -> Self {
        Self {
            window_s,
            index: RwLock::new(Arc::new(MatcherIndex::empty())),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuilds the matcher index from a rule snapshot and swaps it in.
    /// Returns load errors for invalid patterns.
    pub fn load_rules(&self, rules: &[KeywordRule]) -> Vec<String> {
        let (index, errors) = MatcherIndex::build(rules);
        let count = index.rule_count();
        *self.index.write() = Arc::new(index);
        info!(rules = count, invalid = errors.len(), "keyword rules loaded");
        errors
    }

    /// Hash of the rule set the current index was built from.
    pub fn current_hash(&self) -> String {
        self.index.read().content_hash().to_string()
    }

    /// Appends the fragment to the stream's window and runs all matchers
    /// over the full window text.
    pub fn detect(
        &self,
        text: &str,
        start_s: f64,
        end_s: f64,
        stream_id: Uuid,
        session_id: Uuid,
        speaker_id: Option<&str>,
    ) -> Vec<KeywordMatchEvent> {
        let haystack = {
            let mut windows = self.windows.lock();
            windows
                .entry(stream_id)
                .or_insert_with(|| SlidingWindow::new(self.window_s))
                .append(text, start_s, end_s)
        };

        // Detection runs on the index active at call time; a concurrent
        // reload swaps the pointer without touching this snapshot.
        let index = Arc::clone(&self.index.read());
        index.matches(&haystack, stream_id, session_id, speaker_id)
    }

    /// Drops the sliding window of a stopped stream.
    pub fn remove_stream(&self, stream_id: &Uuid) {
        self.windows.lock().remove(stream_id);
    }
}
