//! Rule hot-reload: polls the rule registry and rebuilds the matcher
//! index when the rule-set content hash changes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use voxsentinel_common::models::KeywordRule;

use crate::keyword::{rules_content_hash, KeywordEngine};

/// Whether a freshly fetched rule set should replace the active index.
pub fn should_reload(current_hash: &str, fetched: &[KeywordRule]) -> bool {
    rules_content_hash(fetched) != current_hash
}

/// Polls `GET {api_base}/api/v1/rules` on a fixed interval.
///
/// The management API also publishes `rules_updated` on pub/sub;
/// subscribing is an optional latency optimization, polling is the
/// contract.
pub struct RuleHotReloader {
    http: reqwest::Client,
    api_base: String,
    engine: Arc<KeywordEngine>,
    interval: Duration,
}

impl RuleHotReloader {
    pub fn new(api_base: &str, engine: Arc<KeywordEngine>, interval: Duration) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            api_base: api_base.trim_end_matches('/').to_string(),
            engine,
            interval,
        }
    }

    async fn fetch_rules(&self) -> anyhow::Result<Vec<KeywordRule>> {
        let url = format!("{}/api/v1/rules", self.api_base);
        let rules = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<KeywordRule>>()
            .await?;
        Ok(rules)
    }

    /// Performs one poll cycle. Returns `true` when the index was swapped.
    pub async fn poll_once(&self) -> bool {
        let rules = match self.fetch_rules().await {
            Ok(rules) => rules,
            Err(err) => {
                warn!(error = %err, "rule fetch failed");
                return false;
            }
        };

        if !should_reload(&self.engine.current_hash(), &rules) {
            debug!("rule set unchanged");
            return false;
        }

        let errors = self.engine.load_rules(&rules);
        for error in &errors {
            warn!(error = %error, "rule excluded at load");
        }
        info!(total = rules.len(), invalid = errors.len(), "rule set reloaded");
        true
    }

    /// Polls until the stop event fires. The first cycle runs immediately
    /// so matchers are populated at startup.
    pub async fn run(&self, mut stop_rx: watch::Receiver<bool>) {
        info!(interval_s = self.interval.as_secs(), "rule hot-reloader started");
        loop {
            self.poll_once().await;

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
            if *stop_rx.borrow() {
                break;
            }
        }
        info!("rule hot-reloader stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use voxsentinel_common::models::{RuleMatchType, Severity};

    fn rule(keyword: &str) -> KeywordRule {
        KeywordRule {
            rule_id: Uuid::new_v4(),
            rule_set_name: "set".into(),
            keyword: keyword.into(),
            match_type: RuleMatchType::Exact,
            fuzzy_threshold: 0.8,
            severity: Severity::High,
            category: "general".into(),
            language: None,
            enabled: true,
        }
    }

    #[test]
    fn fresh_engine_reloads_on_any_rules() {
        let engine = KeywordEngine::new(10.0);
        assert!(should_reload(&engine.current_hash(), &[rule("gun")]));
    }

    #[test]
    fn unchanged_rules_do_not_reload() {
        let engine = KeywordEngine::new(10.0);
        let rules = vec![rule("gun")];
        engine.load_rules(&rules);
        assert!(!should_reload(&engine.current_hash(), &rules));
    }

    #[test]
    fn changed_rules_trigger_reload() {
        let engine = KeywordEngine::new(10.0);
        let rules = vec![rule("gun")];
        engine.load_rules(&rules);

        let mut changed = rules.clone();
        changed[0].enabled = false;
        assert!(should_reload(&engine.current_hash(), &changed));

        let mut extended = rules.clone();
        extended.push(rule("bomb"));
        assert!(should_reload(&engine.current_hash(), &extended));
    }
}
