//! Preference-ordered model selection
//!
//! The strategy is an immutable snapshot behind an `ArcSwap`: readers never
//! block and an update swaps in a whole new value. The strategy threshold is
//! pushed into the quota table so availability has one source of truth.

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::table::{DEFAULT_THRESHOLD, QuotaStateTable, clamp_fraction};

/// Ordered model preferences plus the availability threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationStrategy {
    #[serde(default)]
    pub preferred_models: Vec<String>,
    #[serde(default)]
    pub fallback_models: Vec<String>,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

impl Default for RotationStrategy {
    fn default() -> Self {
        Self {
            preferred_models: Vec::new(),
            fallback_models: Vec::new(),
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

/// Field-wise replacement. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_models: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_models: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

impl RotationStrategy {
    pub fn merged(&self, update: &StrategyUpdate) -> Self {
        Self {
            preferred_models: update
                .preferred_models
                .clone()
                .unwrap_or_else(|| self.preferred_models.clone()),
            fallback_models: update
                .fallback_models
                .clone()
                .unwrap_or_else(|| self.fallback_models.clone()),
            threshold: clamp_fraction(update.threshold.unwrap_or(self.threshold)),
        }
    }
}

pub struct ModelSelector {
    table: Arc<QuotaStateTable>,
    strategy: ArcSwap<RotationStrategy>,
}

impl ModelSelector {
    pub fn new(table: Arc<QuotaStateTable>, strategy: RotationStrategy) -> Self {
        table.set_threshold(strategy.threshold);
        Self {
            table,
            strategy: ArcSwap::from_pointee(strategy),
        }
    }

    pub fn strategy(&self) -> Arc<RotationStrategy> {
        self.strategy.load_full()
    }

    /// First available preferred model, else first available fallback.
    pub fn select(&self) -> Option<String> {
        self.select_excluding(&[])
    }

    /// Like `select`, but never returns any of `excluded`.
    pub fn select_excluding(&self, excluded: &[&str]) -> Option<String> {
        let strategy = self.strategy.load();
        self.table
            .best_available_excluding(strategy.preferred_models.as_slice(), excluded)
            .or_else(|| {
                self.table
                    .best_available_excluding(strategy.fallback_models.as_slice(), excluded)
            })
    }

    /// Install a whole new strategy.
    pub fn set_strategy(&self, strategy: RotationStrategy) {
        let threshold = clamp_fraction(strategy.threshold);
        self.strategy.store(Arc::new(RotationStrategy {
            threshold,
            ..strategy
        }));
        self.table.set_threshold(threshold);
        info!(threshold, "rotation strategy replaced");
    }

    /// Merge `update` into the current strategy and return the result.
    pub fn update_strategy(&self, update: &StrategyUpdate) -> Arc<RotationStrategy> {
        self.strategy.rcu(|current| current.merged(update));
        let strategy = self.strategy.load_full();
        self.table.set_threshold(strategy.threshold);
        info!(
            preferred = strategy.preferred_models.len(),
            fallback = strategy.fallback_models.len(),
            threshold = strategy.threshold,
            "rotation strategy updated"
        );
        strategy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::QuotaRecord;

    fn strategy(preferred: &[&str], fallback: &[&str], threshold: f64) -> RotationStrategy {
        RotationStrategy {
            preferred_models: preferred.iter().map(|s| s.to_string()).collect(),
            fallback_models: fallback.iter().map(|s| s.to_string()).collect(),
            threshold,
        }
    }

    fn selector(preferred: &[&str], fallback: &[&str]) -> (Arc<QuotaStateTable>, ModelSelector) {
        let table = Arc::new(QuotaStateTable::default());
        let selector = ModelSelector::new(table.clone(), strategy(preferred, fallback, 0.1));
        (table, selector)
    }

    #[test]
    fn picks_first_preferred_when_unknown() {
        let (_, selector) = selector(&["a", "b"], &["c"]);
        assert_eq!(selector.select(), Some("a".into()));
    }

    #[test]
    fn falls_back_when_preferred_exhausted() {
        let (table, selector) = selector(&["a", "b"], &["c"]);
        table.update("a", QuotaRecord::new("a", 0.0));
        table.update("b", QuotaRecord::new("b", 0.05));
        assert_eq!(selector.select(), Some("c".into()));

        table.update("c", QuotaRecord::new("c", 0.0));
        assert_eq!(selector.select(), None);
    }

    #[test]
    fn select_excluding_skips_current_model() {
        let (_, selector) = selector(&["a", "b"], &[]);
        assert_eq!(selector.select_excluding(&["a"]), Some("b".into()));
        assert_eq!(selector.select_excluding(&["a", "b"]), None);
    }

    #[test]
    fn constructor_applies_threshold_to_table() {
        let (table, _) = selector(&[], &[]);
        assert_eq!(table.threshold(), 0.1);
    }

    #[test]
    fn update_strategy_merges_fields() {
        let (table, selector) = selector(&["a"], &["z"]);
        let merged = selector.update_strategy(&StrategyUpdate {
            preferred_models: Some(vec!["b".into()]),
            threshold: Some(0.3),
            ..StrategyUpdate::default()
        });
        assert_eq!(merged.preferred_models, vec!["b"]);
        assert_eq!(merged.fallback_models, vec!["z"]);
        assert_eq!(merged.threshold, 0.3);
        assert_eq!(table.threshold(), 0.3);
        assert_eq!(selector.select(), Some("b".into()));
    }

    #[test]
    fn set_strategy_replaces_and_clamps() {
        let (table, selector) = selector(&["a"], &[]);
        selector.set_strategy(strategy(&["x"], &["y"], 4.0));
        let current = selector.strategy();
        assert_eq!(current.preferred_models, vec!["x"]);
        assert_eq!(current.threshold, 1.0);
        assert_eq!(table.threshold(), 1.0);
    }

    #[test]
    fn strategy_snapshot_is_immutable() {
        let (_, selector) = selector(&["a"], &[]);
        let before = selector.strategy();
        selector.update_strategy(&StrategyUpdate {
            preferred_models: Some(vec!["b".into()]),
            ..StrategyUpdate::default()
        });
        assert_eq!(before.preferred_models, vec!["a"]);
    }

    #[test]
    fn update_deserializes_from_partial_json() {
        let update: StrategyUpdate = serde_json::from_str(r#"{"threshold":0.05}"#).unwrap();
        assert_eq!(update.threshold, Some(0.05));
        assert!(update.preferred_models.is_none());
    }
}
