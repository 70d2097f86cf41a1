//! Rotation decisions
//!
//! `RotationController` answers one question for the host: is the model in
//! use still fine, and if not, what should replace it. It also exposes the
//! host-facing quota operations (fetch, select, rotate, strategy updates),
//! each wrapped in the account retry policy where a credential can be
//! rejected.
//!
//! `check_limit` outcomes:
//! - no account → `no_account`
//! - backend has no data for the model → `quota_unknown`
//! - exhausted, other model usable → switch model, keep account
//! - exhausted, nothing else usable → rotate account
//! - below threshold, other model usable → switch model
//! - below threshold, nothing else usable → `degraded`, keep going
//! - otherwise → `healthy`

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::QuotaCacheWriter;
use crate::error::{Error, Result};
use crate::probe::{ModelQuota, QuotaSnapshot, QuotaSource};
use crate::retry::{DEFAULT_RETRY_BUDGET, rotate_account, with_account_retry};
use crate::rotator::{AccountRotator, SelectedAccount};
use crate::selector::{ModelSelector, RotationStrategy, StrategyUpdate};
use crate::table::{QuotaRecord, QuotaStateTable};

/// Terminal state of a limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitStatus {
    NoAccount,
    QuotaUnknown,
    Exhausted,
    BelowThreshold,
    Degraded,
    Healthy,
}

impl LimitStatus {
    pub fn label(&self) -> &'static str {
        match self {
            LimitStatus::NoAccount => "no_account",
            LimitStatus::QuotaUnknown => "quota_unknown",
            LimitStatus::Exhausted => "exhausted",
            LimitStatus::BelowThreshold => "below_threshold",
            LimitStatus::Degraded => "degraded",
            LimitStatus::Healthy => "healthy",
        }
    }
}

/// Outcome of `check_limit`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitCheck {
    pub status: LimitStatus,
    pub is_exhausted: bool,
    pub should_rotate: bool,
    /// Replacement model; absent when the account was rotated instead
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_fraction: Option<f64>,
    pub message: String,
}

impl LimitCheck {
    fn steady(status: LimitStatus, remaining_fraction: Option<f64>, message: String) -> Self {
        Self {
            status,
            is_exhausted: false,
            should_rotate: false,
            next_model: None,
            remaining_fraction,
            message,
        }
    }

    fn switch(
        status: LimitStatus,
        next_model: Option<String>,
        remaining_fraction: f64,
        message: String,
    ) -> Self {
        Self {
            status,
            is_exhausted: status == LimitStatus::Exhausted,
            should_rotate: true,
            next_model,
            remaining_fraction: Some(remaining_fraction),
            message,
        }
    }
}

pub struct RotationController {
    rotator: Arc<AccountRotator>,
    table: Arc<QuotaStateTable>,
    selector: Arc<ModelSelector>,
    source: Arc<dyn QuotaSource>,
    cache: Option<QuotaCacheWriter>,
    retry_budget: u32,
    last_selected: ArcSwapOption<String>,
}

impl RotationController {
    pub fn new(
        rotator: Arc<AccountRotator>,
        table: Arc<QuotaStateTable>,
        selector: Arc<ModelSelector>,
        source: Arc<dyn QuotaSource>,
    ) -> Self {
        Self {
            rotator,
            table,
            selector,
            source,
            cache: None,
            retry_budget: DEFAULT_RETRY_BUDGET,
            last_selected: ArcSwapOption::empty(),
        }
    }

    /// Write every fetched quota to the result cache file.
    pub fn with_cache(mut self, cache: QuotaCacheWriter) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_retry_budget(mut self, retries: u32) -> Self {
        self.retry_budget = retries;
        self
    }

    pub fn rotator(&self) -> &Arc<AccountRotator> {
        &self.rotator
    }

    pub fn table(&self) -> &Arc<QuotaStateTable> {
        &self.table
    }

    pub fn selector(&self) -> &Arc<ModelSelector> {
        &self.selector
    }

    /// Decide whether `model` is still usable and what to do if not.
    ///
    /// Authentication and transient failures propagate; nothing is rotated
    /// on error.
    pub async fn check_limit(&self, model: &str) -> Result<LimitCheck> {
        let check = self.evaluate_limit(model).await?;
        metrics::counter!("quota_limit_checks_total", "status" => check.status.label())
            .increment(1);
        info!(
            model,
            status = check.status.label(),
            remaining_fraction = ?check.remaining_fraction,
            next_model = ?check.next_model,
            "limit checked"
        );
        Ok(check)
    }

    async fn evaluate_limit(&self, model: &str) -> Result<LimitCheck> {
        let Some(selected) = self.rotator.current().await else {
            return Ok(LimitCheck::steady(
                LimitStatus::NoAccount,
                None,
                "no account available".into(),
            ));
        };

        let snapshot = self.probe(&selected).await?;
        let Some(quota) = snapshot.find(model) else {
            return Ok(LimitCheck::steady(
                LimitStatus::QuotaUnknown,
                None,
                format!("no quota data for {model}"),
            ));
        };
        self.ingest(quota, Some(model));

        let record = &quota.record;
        let fraction = record.remaining_fraction;
        let excluded = [model, quota.id.as_str(), quota.label.as_str()];

        if record.is_exhausted() {
            if let Some(next) = self.selector.select_excluding(&excluded) {
                return Ok(LimitCheck::switch(
                    LimitStatus::Exhausted,
                    Some(next.clone()),
                    fraction,
                    format!("{model} quota exhausted, switch to {next}"),
                ));
            }

            let next_index =
                rotate_account(&self.rotator, &self.table, record.reset_time.as_deref()).await;
            warn!(
                model,
                account_index = selected.index,
                next_index = ?next_index,
                reset_time = ?record.reset_time,
                "no usable model left on account, rotated"
            );
            return Ok(LimitCheck::switch(
                LimitStatus::Exhausted,
                None,
                fraction,
                format!("{model} quota exhausted and no alternative model, rotated account"),
            ));
        }

        if fraction < self.table.threshold() {
            let percent = record.percentage();
            return Ok(match self.selector.select_excluding(&excluded) {
                Some(next) => LimitCheck::switch(
                    LimitStatus::BelowThreshold,
                    Some(next.clone()),
                    fraction,
                    format!("{model} at {percent}%, below threshold, switch to {next}"),
                ),
                None => LimitCheck::steady(
                    LimitStatus::Degraded,
                    Some(fraction),
                    format!("{model} at {percent}%, below threshold with no alternative"),
                ),
            });
        }

        Ok(LimitCheck::steady(
            LimitStatus::Healthy,
            Some(fraction),
            format!("{model} at {}%", record.percentage()),
        ))
    }

    /// Fresh quota for `model`, or for the last selected model when `None`.
    ///
    /// Without any target, the first model the backend reports is returned.
    /// `NoQuotaData` when the backend answered but listed nothing matching.
    pub async fn get_quota(&self, model: Option<&str>) -> Result<ModelQuota> {
        let target = model
            .map(str::to_string)
            .or_else(|| self.last_selected_model());
        let snapshot = self.probe_with_retry().await?;

        let found = match target.as_deref() {
            Some(name) => snapshot.find(name).cloned(),
            None => snapshot.first().cloned(),
        };
        let Some(quota) = found else {
            debug!(target = ?target, "no quota data for requested model");
            return Err(Error::NoQuotaData(
                target.unwrap_or_else(|| "any model".to_string()),
            ));
        };
        self.ingest(&quota, target.as_deref());
        self.write_cache(&quota.record).await;
        Ok(quota)
    }

    /// Fresh quota for every model, ingested under both id and label.
    pub async fn get_all_quotas(&self) -> Result<QuotaSnapshot> {
        let snapshot = self.probe_with_retry().await?;
        for quota in snapshot.models() {
            self.ingest(quota, None);
        }
        if let Some(first) = snapshot.first() {
            self.write_cache(&first.record).await;
        }
        Ok(snapshot)
    }

    /// Refresh the whole table. Returns the number of keys written.
    pub async fn update_all_quotas(&self) -> Result<usize> {
        let snapshot = self.get_all_quotas().await?;
        Ok(snapshot.all_quotas().len())
    }

    /// Cool down the current account and move on. `None` when there are no accounts.
    pub async fn rotate_account(&self, reset_time: Option<&str>) -> Option<usize> {
        rotate_account(&self.rotator, &self.table, reset_time).await
    }

    /// Best model under the current strategy. Remembered as the default
    /// target of `get_quota`.
    pub async fn select_best_model(&self) -> Option<String> {
        let selected = self.selector.select();
        if let Some(model) = &selected {
            self.last_selected.store(Some(Arc::new(model.clone())));
        }
        debug!(selected = ?selected, "best model selected");
        selected
    }

    pub fn last_selected_model(&self) -> Option<String> {
        self.last_selected.load_full().map(|m| m.as_ref().clone())
    }

    /// Record a quota figure learned outside the probe.
    pub fn update_quota_for_model(
        &self,
        model: &str,
        remaining_fraction: f64,
        reset_time: Option<String>,
    ) {
        self.table.update(
            model,
            QuotaRecord::new(model, remaining_fraction).with_reset_time(reset_time),
        );
    }

    pub fn set_rotation_strategy(&self, strategy: RotationStrategy) {
        self.selector.set_strategy(strategy);
    }

    pub fn update_strategy(&self, update: &StrategyUpdate) -> Arc<RotationStrategy> {
        self.selector.update_strategy(update)
    }

    /// Account pool, quota table and strategy for the health endpoint.
    pub async fn health(&self) -> serde_json::Value {
        let quota: BTreeMap<String, Arc<QuotaRecord>> = self.table.snapshot().into_iter().collect();
        serde_json::json!({
            "accounts": self.rotator.health().await,
            "quota": quota,
            "strategy": *self.selector.strategy(),
            "last_selected_model": self.last_selected_model(),
        })
    }

    async fn probe_with_retry(&self) -> Result<QuotaSnapshot> {
        with_account_retry(
            &self.rotator,
            &self.table,
            self.retry_budget,
            |selected| async move { self.probe(&selected).await },
        )
        .await
    }

    async fn probe(&self, selected: &SelectedAccount) -> Result<QuotaSnapshot> {
        match self.source.fetch_all(&selected.account).await {
            Ok(snapshot) => {
                if selected.account.project().is_none()
                    && let Some(project) = snapshot.project_id()
                {
                    self.rotator
                        .cache_project_id(selected.index, project.to_string())
                        .await;
                }
                Ok(snapshot)
            }
            Err(e) => {
                metrics::counter!("quota_probe_failures_total", "kind" => e.kind()).increment(1);
                warn!(account_index = selected.index, error = %e, "quota probe failed");
                Err(e)
            }
        }
    }

    /// Store `quota` under its id, its label and the name the caller used.
    fn ingest(&self, quota: &ModelQuota, alias: Option<&str>) {
        self.table.update(&quota.id, quota.record.as_ref().clone());
        if let Some(stored) = self.table.get(&quota.id) {
            for key in [Some(quota.label.as_str()), alias].into_iter().flatten() {
                if key != quota.id {
                    self.table.insert_shared(key, stored.clone());
                }
            }
        }
        metrics::gauge!("quota_remaining_fraction", "model" => quota.id.clone())
            .set(quota.record.remaining_fraction);
    }

    async fn write_cache(&self, record: &QuotaRecord) {
        if let Some(cache) = &self.cache {
            cache.write(record).await;
        }
    }
}
