use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Matching mode of a keyword rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleMatchType {
    Exact,
    Fuzzy,
    Regex,
}

/// Alert severity. Ordered so channel filters can compare against a
/// minimum severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// A configurable keyword detection rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordRule {
    pub rule_id: Uuid,
    pub rule_set_name: String,
    pub keyword: String,
    pub match_type: RuleMatchType,
    /// Minimum normalized similarity for fuzzy rules (0.0-1.0, inclusive).
    #[serde(default = "default_fuzzy_threshold")]
    pub fuzzy_threshold: f32,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_fuzzy_threshold() -> f32 {
    0.8
}

fn default_severity() -> Severity {
    Severity::Medium
}

fn default_category() -> String {
    "general".to_string()
}

fn default_enabled() -> bool {
    true
}
