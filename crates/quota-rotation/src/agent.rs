//! Model assignment for named agents
//!
//! Multi-agent hosts run several named agents (planner, explorer, writer and
//! so on), each pinned to a model. `AgentModels` answers "which model should
//! this agent use right now" from the same quota table and strategy that
//! drive `select_best_model`, rotating the account when no configured model
//! is usable.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::controller::RotationController;
use crate::selector::StrategyUpdate;

/// Handed out when no model is configured and none can be selected.
pub const FALLBACK_AGENT_MODEL: &str = "google/antigravity-gemini-3-flash";

/// Agents present in a freshly generated configuration, in assignment order.
pub const DEFAULT_AGENTS: [&str; 7] = [
    "Sisyphus",
    "librarian",
    "explore",
    "oracle",
    "frontend-ui-ux-engineer",
    "document-writer",
    "multimodal-looker",
];

pub struct AgentModels {
    controller: Arc<RotationController>,
    default_model: Option<String>,
}

impl AgentModels {
    pub fn new(controller: Arc<RotationController>) -> Self {
        Self {
            controller,
            default_model: None,
        }
    }

    /// Model used for agents that name no preference of their own.
    pub fn with_default_model(mut self, model: Option<String>) -> Self {
        self.default_model = model.filter(|m| !m.trim().is_empty());
        self
    }

    /// Model `agent` should run on.
    ///
    /// The requested model (or the default) is kept while the table considers
    /// it available. Below threshold, the best selectable model replaces it;
    /// when nothing is selectable the account is rotated and the requested
    /// model kept, since the next account starts with a clean table.
    pub async fn model_for_agent(&self, agent: &str, preferred: Option<&str>) -> String {
        let target = preferred
            .filter(|m| !m.trim().is_empty())
            .map(str::to_string)
            .or_else(|| self.default_model.clone());

        let Some(target) = target else {
            let selected = match self.controller.select_best_model().await {
                Some(model) => Some(model),
                None => {
                    let rotated = self.controller.rotate_account(None).await;
                    debug!(agent, rotated = ?rotated, "nothing selectable, rotated account");
                    self.controller.select_best_model().await
                }
            };
            let model = selected.unwrap_or_else(|| FALLBACK_AGENT_MODEL.to_string());
            debug!(agent, model = %model, "agent model selected");
            return model;
        };

        if self.controller.table().is_available(&target) {
            return target;
        }

        match self.controller.select_best_model().await {
            Some(replacement) => {
                info!(agent, from = %target, to = %replacement, "agent moved off low-quota model");
                replacement
            }
            None => {
                let rotated = self.controller.rotate_account(None).await;
                info!(
                    agent,
                    model = %target,
                    rotated = ?rotated,
                    "no usable model for agent, rotated account"
                );
                target
            }
        }
    }

    /// Apply `update` to the strategy, then move every agent onto the best
    /// model. Agents keep their current model when nothing is selectable.
    pub async fn reassign(
        &self,
        agents: &BTreeMap<String, String>,
        update: &StrategyUpdate,
    ) -> BTreeMap<String, String> {
        self.controller.update_strategy(update);
        let best = self.controller.select_best_model().await;

        let assigned: BTreeMap<String, String> = agents
            .iter()
            .map(|(agent, current)| {
                let model = best.clone().unwrap_or_else(|| current.clone());
                (agent.clone(), model)
            })
            .collect();
        info!(agents = assigned.len(), best = ?best, "agent models reassigned");
        assigned
    }
}

/// Starting assignment: preferred models dealt round-robin over
/// `DEFAULT_AGENTS`.
pub fn default_agent_models(preferred: &[String]) -> BTreeMap<String, String> {
    DEFAULT_AGENTS
        .iter()
        .enumerate()
        .map(|(i, agent)| {
            let model = if preferred.is_empty() {
                FALLBACK_AGENT_MODEL.to_string()
            } else {
                preferred[i % preferred.len()].clone()
            };
            (agent.to_string(), model)
        })
        .collect()
}
