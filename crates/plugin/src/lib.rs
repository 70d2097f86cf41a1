//! Host plugin surface
//!
//! Defines the `QuotaPlugin` trait the host (CLI, admin API) talks to, and
//! the plain data types that cross that boundary. The rotation engine stays
//! behind the trait; hosts only see reports and a failure classification.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Failure classes a host can react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Credential rejected even after rotating through the retry budget
    Authentication,
    /// Timeout, connection error or 5xx; try again later
    Transient,
    NoAccount,
    NoQuotaData,
    Storage,
    /// Caller passed something unusable
    InvalidInput,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Authentication => "authentication",
            FailureKind::Transient => "transient",
            FailureKind::NoAccount => "no_account",
            FailureKind::NoQuotaData => "no_quota_data",
            FailureKind::Storage => "storage",
            FailureKind::InvalidInput => "invalid_input",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct PluginError {
    pub kind: FailureKind,
    pub message: String,
}

impl PluginError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidInput, message)
    }
}

pub type Result<T> = std::result::Result<T, PluginError>;

/// Quota of one model as seen by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaReport {
    pub model: String,
    pub label: String,
    pub remaining_fraction: f64,
    /// Rounded remaining percentage, 0..=100
    pub percentage: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<String>,
    /// Unix milliseconds
    pub observed_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationReport {
    pub rotated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_index: Option<usize>,
}

/// Externally learned quota for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaUpdate {
    pub remaining_fraction: f64,
    #[serde(default)]
    pub reset_time: Option<String>,
}

impl QuotaUpdate {
    /// Out-of-range fractions are clamped downstream; only non-numbers are rejected.
    pub fn validate(&self) -> Result<()> {
        if !self.remaining_fraction.is_finite() {
            return Err(PluginError::invalid_input(
                "remainingFraction must be a finite number",
            ));
        }
        Ok(())
    }
}

/// Partial strategy update. Absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StrategyPatch {
    pub preferred_models: Option<Vec<String>>,
    pub fallback_models: Option<Vec<String>>,
    pub threshold: Option<f64>,
}

impl StrategyPatch {
    pub fn validate(&self) -> Result<()> {
        if let Some(threshold) = self.threshold
            && !(0.0..=1.0).contains(&threshold)
        {
            return Err(PluginError::invalid_input(format!(
                "threshold must be within [0, 1], got {threshold}"
            )));
        }
        Ok(())
    }
}

/// Strategy in effect after an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyView {
    pub preferred_models: Vec<String>,
    pub fallback_models: Vec<String>,
    pub threshold: f64,
}

/// Answer to "is this model still usable".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitReport {
    pub status: String,
    pub is_exhausted: bool,
    pub should_rotate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_fraction: Option<f64>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PluginHealth {
    /// "healthy", "degraded" or "unhealthy"
    pub status: String,
    pub accounts: serde_json::Value,
    pub quota: serde_json::Value,
    pub strategy: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub companion: Option<serde_json::Value>,
}

impl PluginHealth {
    /// At least one account can serve requests.
    pub fn is_usable(&self) -> bool {
        self.status != "unhealthy"
    }
}

/// Model an agent should run on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAssignment {
    pub agent: String,
    pub model: String,
}

/// One agent entry of a multi-agent host configuration.
///
/// Only `model` is interpreted; other keys pass through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEntry {
    pub model: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AgentEntry {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            extra: serde_json::Map::new(),
        }
    }
}

/// Multi-agent host configuration: `{"agents": {"<name>": {"model": ...}}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub agents: BTreeMap<String, AgentEntry>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Strategy to install before every agent is reassigned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfigUpdate {
    pub config: AgentConfig,
    pub strategy: StrategyPatch,
}

/// Operations a host drives the rotation engine through.
///
/// Uses `Pin<Box<dyn Future>>` return types so hosts can hold `Arc<dyn QuotaPlugin>`.
pub trait QuotaPlugin: Send + Sync {
    /// Identifier for logging and health reporting
    fn id(&self) -> &str;

    /// Fresh quota for `model`, or the last selected model when `None`.
    /// `Ok(None)` when the backend reports nothing for it.
    fn get_quota<'a>(
        &'a self,
        model: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<QuotaReport>>> + Send + 'a>>;

    /// Cool down the active account and advance to the next one.
    fn rotate_account<'a>(
        &'a self,
        reset_time: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = Result<RotationReport>> + Send + 'a>>;

    fn select_best_model(&self) -> Pin<Box<dyn Future<Output = Option<String>> + Send + '_>>;

    fn update_quota_for_model(&self, model: &str, update: QuotaUpdate) -> Result<()>;

    fn set_rotation_strategy(&self, patch: StrategyPatch) -> Result<StrategyView>;

    fn check_model<'a>(
        &'a self,
        model: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<LimitReport>> + Send + 'a>>;

    fn health(&self) -> Pin<Box<dyn Future<Output = PluginHealth> + Send + '_>>;

    /// Model for a named agent, preferring `preferred` while it has quota.
    fn model_for_agent<'a>(
        &'a self,
        agent: &'a str,
        preferred: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = Result<AgentAssignment>> + Send + 'a>>;

    /// Install the update's strategy and move every agent onto the best model.
    fn update_agent_config(
        &self,
        update: AgentConfigUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<AgentConfig>> + Send + '_>>;

    /// Fresh configuration for the default agent set under the current strategy.
    fn default_agent_config(&self) -> AgentConfig;
}
