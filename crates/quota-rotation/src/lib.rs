//! Quota-aware account and model rotation
//!
//! Keeps a client on a usable (account, model) pair while individual
//! accounts run out of per-model quota. The engine is built from small
//! pieces that each own their own lock:
//!
//! - `QuotaStateTable` remembers the last observed remaining fraction per model
//! - `ModelSelector` picks the first usable model from a preference list
//! - `AccountRotator` tracks the active account and cooldowns
//! - `QuotaProbe` asks the Cloud Code API for fresh numbers
//! - `RotationController` ties them together and decides what to switch
//! - `AgentModels` maps named agents onto models for multi-agent hosts
//!
//! Decision flow for `RotationController::check_limit`:
//! 1. Probe the current account for the model in use
//! 2. Record the result in the table
//! 3. Exhausted or below threshold → ask the selector for another model
//! 4. No other model → rotate the account (exhausted) or keep going (degraded)

pub mod agent;
pub mod cache;
pub mod controller;
pub mod error;
pub mod probe;
pub mod refresh;
pub mod retry;
pub mod rotator;
pub mod selector;
pub mod table;

#[cfg(test)]
pub(crate) mod test_support;

pub use agent::{AgentModels, DEFAULT_AGENTS, FALLBACK_AGENT_MODEL, default_agent_models};
pub use cache::{CachedQuota, QuotaCacheWriter};
pub use controller::{LimitCheck, LimitStatus, RotationController};
pub use error::{Error, Result};
pub use probe::{ModelQuota, QuotaProbe, QuotaSnapshot, QuotaSource, normalize_model_name};
pub use refresh::{MIN_REFRESH_INTERVAL, spawn_quota_refresh};
pub use retry::{DEFAULT_RETRY_BUDGET, rotate_account, with_account_retry};
pub use rotator::{AccountRotator, DEFAULT_COOLDOWN, SelectedAccount};
pub use selector::{ModelSelector, RotationStrategy, StrategyUpdate};
pub use table::{DEFAULT_THRESHOLD, QuotaRecord, QuotaStateTable};

/// Current unix time in milliseconds.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
