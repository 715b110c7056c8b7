//! PII detection and redaction with typed placeholders.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

/// A detected entity span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PiiEntity {
    pub entity_type: String,
    pub start: usize,
    pub end: usize,
}

/// Detection backend. Synchronous; the redactor offloads it.
pub trait PiiDetector: Send + Sync {
    fn detect(&self, text: &str) -> anyhow::Result<Vec<PiiEntity>>;
}

/// Output of redacting one text span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedactionResult {
    pub redacted_text: String,
    pub entities_found: Vec<String>,
}

/// Placeholder inserted for a detected entity type.
pub fn placeholder_for(entity_type: &str) -> String {
    match entity_type {
        "PERSON" => "[PERSON]".into(),
        "PHONE_NUMBER" => "[PHONE]".into(),
        "EMAIL_ADDRESS" => "[EMAIL]".into(),
        "LOCATION" | "ADDRESS" => "[ADDRESS]".into(),
        "CREDIT_CARD" => "[CREDIT_CARD]".into(),
        "US_SSN" => "[SSN]".into(),
        "US_BANK_NUMBER" | "IBAN_CODE" => "[ACCOUNT_ID]".into(),
        "IP_ADDRESS" => "[IP_ADDRESS]".into(),
        other => format!("[{other}]"),
    }
}

struct TypedPattern {
    entity_type: &'static str,
    pattern: &'static Lazy<Regex>,
}

macro_rules! pii_regex {
    ($name:ident, $pattern:expr) => {
        static $name: Lazy<Regex> = Lazy::new(|| {
            Regex::new($pattern).expect(concat!("compile ", stringify!($name)))
        });
    };
}

pii_regex!(
    EMAIL_RE,
    r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}"
);
pii_regex!(IBAN_RE, r"\b[A-Z]{2}\d{2}[A-Z0-9]{11,30}\b");
pii_regex!(
    CREDIT_CARD_RE,
    r"\b\d{4}[ -]?\d{4}[ -]?\d{4}[ -]?\d{4}\b"
);
pii_regex!(SSN_RE, r"\b\d{3}-\d{2}-\d{4}\b");
pii_regex!(
    PHONE_RE,
    r"(?:\+?\d{1,2}[\s.-]?)?(?:\(\d{3}\)|\b\d{3})[\s.-]?\d{3}[\s.-]?\d{4}\b"
);
pii_regex!(IP_RE, r"\b(?:\d{1,3}\.){3}\d{1,3}\b");
pii_regex!(
    LOCATION_RE,
    r"\b\d+\s+[A-Z][a-z]+(?:\s+[A-Z][a-z]+)*\s+(?:Street|St|Avenue|Ave|Road|Rd|Boulevard|Blvd|Lane|Ln|Drive|Dr)\b"
);
pii_regex!(
    PERSON_RE,
    r"\b(?:Mr|Mrs|Ms|Dr|Prof)\.?\s+[A-Z][a-z]+(?:\s+[A-Z][a-z]+)?|(?:my name is|this is|I am|I'm)\s+([A-Z][a-z]+(?:\s+[A-Z][a-z]+)?)"
);

/// Ordered by specificity: earlier types claim overlapping spans first.
static PATTERNS: &[TypedPattern] = &[
    TypedPattern {
        entity_type: "EMAIL_ADDRESS",
        pattern: &EMAIL_RE,
    },
    TypedPattern {
        entity_type: "IBAN_CODE",
        pattern: &IBAN_RE,
    },
    TypedPattern {
        entity_type: "CREDIT_CARD",
        pattern: &CREDIT_CARD_RE,
    },
    TypedPattern {
        entity_type: "US_SSN",
        pattern: &SSN_RE,
    },
    TypedPattern {
        entity_type: "PHONE_NUMBER",
        pattern: &PHONE_RE,
    },
    TypedPattern {
        entity_type: "IP_ADDRESS",
        pattern: &IP_RE,
    },
    TypedPattern {
        entity_type: "LOCATION",
        pattern: &LOCATION_RE,
    },
    TypedPattern {
        entity_type: "PERSON",
        pattern: &PERSON_RE,
    },
];

/// Pattern- and heuristic-based detector covering the required entity set.
pub struct PatternPiiDetector;

impl PiiDetector for PatternPiiDetector {
    fn detect(&self, text: &str) -> anyhow::Result<Vec<PiiEntity>> {
        let mut entities: Vec<PiiEntity> = Vec::new();

        for typed in PATTERNS {
            for mat in typed.pattern.find_iter(text) {
                let (start, end) = if typed.entity_type == "PERSON" {
                    // For the introduction form, redact only the captured name.
                    match typed
                        .pattern
                        .captures(&text[mat.start()..mat.end()])
                        .and_then(|c| c.get(1))
                    {
                        Some(name) => (mat.start() + name.start(), mat.start() + name.end()),
                        None => (mat.start(), mat.end()),
                    }
                } else {
                    (mat.start(), mat.end())
                };

                let overlaps = entities.iter().any(|e| start < e.end && e.start < end);
                if !overlaps {
                    entities.push(PiiEntity {
                        entity_type: typed.entity_type.to_string(),
                        start,
                        end,
                    });
                }
            }
        }

        entities.sort_by_key(|e| e.start);
        Ok(entities)
    }
}

/// Replaces detected spans with typed placeholders.
pub struct PiiRedactor {
    detector: Option<Arc<dyn PiiDetector>>,
}

impl PiiRedactor {
    pub fn new(detector: Option<Arc<dyn PiiDetector>>) -> Self {
        if detector.is_none() {
            warn!("no PII detector configured, running degraded (no redaction)");
        }
        Self { detector }
    }

    pub async fn redact(&self, text: &str) -> RedactionResult {
        let Some(detector) = &self.detector else {
            return RedactionResult {
                redacted_text: text.to_string(),
                entities_found: Vec::new(),
            };
        };
        if text.trim().is_empty() {
            return RedactionResult {
                redacted_text: text.to_string(),
                entities_found: Vec::new(),
            };
        }

        let detector = Arc::clone(detector);
        let owned = text.to_string();
        let entities = match tokio::task::spawn_blocking(move || detector.detect(&owned)).await {
            Ok(Ok(entities)) => entities,
            Ok(Err(err)) => {
                warn!(error = %err, "pii detection failed");
                return RedactionResult {
                    redacted_text: text.to_string(),
                    entities_found: Vec::new(),
                };
            }
            Err(err) => {
                warn!(error = %err, "pii worker panicked");
                return RedactionResult {
                    redacted_text: text.to_string(),
                    entities_found: Vec::new(),
                };
            }
        };

        if entities.is_empty() {
            return RedactionResult {
                redacted_text: text.to_string(),
                entities_found: Vec::new(),
            };
        }

        // Replace back-to-front so earlier spans keep their offsets.
        let mut redacted = text.to_string();
        for entity in entities.iter().rev() {
            redacted.replace_range(
                entity.start..entity.end,
                &placeholder_for(&entity.entity_type),
            );
        }

        let mut entities_found = Vec::new();
        for entity in &entities {
            if !entities_found.contains(&entity.entity_type) {
                entities_found.push(entity.entity_type.clone());
            }
        }

        RedactionResult {
            redacted_text: redacted,
            entities_found,
        }
    }
}
