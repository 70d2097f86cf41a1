//! Rotation-engine plugin
//!
//! Implements `QuotaPlugin` over a `RotationController`, translating engine
//! types into boundary reports and engine errors into `FailureKind`.

use plugin::{
    AgentAssignment, AgentConfig, AgentConfigUpdate, AgentEntry, FailureKind, LimitReport,
    PluginError, PluginHealth, QuotaPlugin, QuotaReport, QuotaUpdate, RotationReport,
    StrategyPatch, StrategyView,
};
use quota_rotation::{
    AgentModels, ModelQuota, RotationController, StrategyUpdate, default_agent_models,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{info, warn};

use crate::locator;

pub struct RotationPlugin {
    controller: Arc<RotationController>,
    agents: AgentModels,
    /// Scan for the companion language server in health reports
    locate_companion: bool,
}

impl RotationPlugin {
    pub fn new(controller: Arc<RotationController>) -> Self {
        Self {
            agents: AgentModels::new(controller.clone()),
            controller,
            locate_companion: true,
        }
    }

    /// Model for agents that request none.
    pub fn with_default_agent_model(mut self, model: Option<String>) -> Self {
        self.agents = self.agents.with_default_model(model);
        self
    }

    pub fn without_companion_scan(mut self) -> Self {
        self.locate_companion = false;
        self
    }
}

/// Map an engine error onto the plugin failure classes.
fn classify(error: quota_rotation::Error) -> PluginError {
    use quota_rotation::Error;

    let kind = match &error {
        Error::Authentication(_) => FailureKind::Authentication,
        Error::Transient(_) => FailureKind::Transient,
        Error::NoAccountAvailable => FailureKind::NoAccount,
        Error::NoQuotaData(_) => FailureKind::NoQuotaData,
        Error::Storage(_) => FailureKind::Storage,
    };
    PluginError::new(kind, error.to_string())
}

fn strategy_update(patch: StrategyPatch) -> StrategyUpdate {
    StrategyUpdate {
        preferred_models: patch.preferred_models,
        fallback_models: patch.fallback_models,
        threshold: patch.threshold,
    }
}

fn quota_report(quota: ModelQuota) -> QuotaReport {
    QuotaReport {
        percentage: quota.record.percentage(),
        remaining_fraction: quota.record.remaining_fraction,
        reset_time: quota.record.reset_time.clone(),
        observed_at: quota.record.observed_at,
        model: quota.id,
        label: quota.label,
    }
}

impl QuotaPlugin for RotationPlugin {
    fn id(&self) -> &str {
        "quota-rotation"
    }

    fn get_quota<'a>(
        &'a self,
        model: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = plugin::Result<Option<QuotaReport>>> + Send + 'a>> {
        Box::pin(async move {
            match self.controller.get_quota(model).await {
                Ok(quota) => Ok(Some(quota_report(quota))),
                // Treated as unknown, not as a failure
                Err(quota_rotation::Error::NoQuotaData(_)) => Ok(None),
                Err(e) => Err(classify(e)),
            }
        })
    }

    fn rotate_account<'a>(
        &'a self,
        reset_time: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = plugin::Result<RotationReport>> + Send + 'a>> {
        Box::pin(async move {
            match self.controller.rotate_account(reset_time).await {
                Some(index) => {
                    info!(active_index = index, "account rotated on request");
                    Ok(RotationReport {
                        rotated: true,
                        active_index: Some(index),
                    })
                }
                None => Err(PluginError::new(
                    FailureKind::NoAccount,
                    "no accounts configured",
                )),
            }
        })
    }

    fn select_best_model(&self) -> Pin<Box<dyn Future<Output = Option<String>> + Send + '_>> {
        Box::pin(self.controller.select_best_model())
    }

    fn update_quota_for_model(&self, model: &str, update: QuotaUpdate) -> plugin::Result<()> {
        if model.trim().is_empty() {
            return Err(PluginError::invalid_input("model must not be empty"));
        }
        update.validate()?;
        self.controller
            .update_quota_for_model(model, update.remaining_fraction, update.reset_time);
        Ok(())
    }

    fn set_rotation_strategy(&self, patch: StrategyPatch) -> plugin::Result<StrategyView> {
        patch.validate()?;
        let strategy = self.controller.update_strategy(&strategy_update(patch));
        info!(
            preferred = ?strategy.preferred_models,
            fallback = ?strategy.fallback_models,
            threshold = strategy.threshold,
            "rotation strategy updated"
        );
        Ok(StrategyView {
            preferred_models: strategy.preferred_models.clone(),
            fallback_models: strategy.fallback_models.clone(),
            threshold: strategy.threshold,
        })
    }

    fn check_model<'a>(
        &'a self,
        model: &'a str,
    ) -> Pin<Box<dyn Future<Output = plugin::Result<LimitReport>> + Send + 'a>> {
        Box::pin(async move {
            let check = self.controller.check_limit(model).await.map_err(|e| {
                warn!(model, error = %e, "limit check failed");
                classify(e)
            })?;
            Ok(LimitReport {
                status: check.status.label().to_string(),
                is_exhausted: check.is_exhausted,
                should_rotate: check.should_rotate,
                next_model: check.next_model,
                remaining_fraction: check.remaining_fraction,
                message: check.message,
            })
        })
    }

    fn health(&self) -> Pin<Box<dyn Future<Output = PluginHealth> + Send + '_>> {
        Box::pin(async move {
            let mut health = self.controller.health().await;
            let accounts = health["accounts"].take();
            let status = accounts
                .get("status")
                .and_then(|s| s.as_str())
                .unwrap_or("unhealthy")
                .to_string();

            let companion = if self.locate_companion {
                Some(serde_json::json!(locator::find_companion_process().await))
            } else {
                None
            };

            PluginHealth {
                status,
                accounts,
                quota: health["quota"].take(),
                strategy: health["strategy"].take(),
                companion,
            }
        })
    }

    fn model_for_agent<'a>(
        &'a self,
        agent: &'a str,
        preferred: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = plugin::Result<AgentAssignment>> + Send + 'a>> {
        Box::pin(async move {
            if agent.trim().is_empty() {
                return Err(PluginError::invalid_input("agent must not be empty"));
            }
            let model = self.agents.model_for_agent(agent, preferred).await;
            Ok(AgentAssignment {
                agent: agent.to_string(),
                model,
            })
        })
    }

    fn update_agent_config(
        &self,
        update: AgentConfigUpdate,
    ) -> Pin<Box<dyn Future<Output = plugin::Result<AgentConfig>> + Send + '_>> {
        Box::pin(async move {
            update.strategy.validate()?;
            let AgentConfigUpdate {
                mut config,
                strategy,
            } = update;

            let current: BTreeMap<String, String> = config
                .agents
                .iter()
                .map(|(agent, entry)| (agent.clone(), entry.model.clone()))
                .collect();
            let assigned = self
                .agents
                .reassign(&current, &strategy_update(strategy))
                .await;

            for (agent, entry) in config.agents.iter_mut() {
                if let Some(model) = assigned.get(agent) {
                    entry.model = model.clone();
                }
            }
            Ok(config)
        })
    }

    fn default_agent_config(&self) -> AgentConfig {
        let strategy = self.controller.selector().strategy();
        AgentConfig {
            agents: default_agent_models(&strategy.preferred_models)
                .into_iter()
                .map(|(agent, model)| (agent, AgentEntry::new(model)))
                .collect(),
            extra: serde_json::Map::new(),
        }
    }
}
