//! Active account tracking and cooldowns
//!
//! The rotator owns the account set. Rotation never reorders accounts; it
//! only advances the active index and stamps cooldowns. Every exhaustion is
//! persisted before `mark_exhausted` returns, with the set's Mutex held so
//! concurrent rotations write in order.
//!
//! Selection rules:
//! - scan forward from the active index for an account not cooling down
//! - if every account is cooling down, take the one that recovers first
//!   (ties go to the lowest index)

use std::sync::Arc;
use std::time::Duration;

use cloudcode_auth::{Account, AccountStorage, COOLDOWN_NEVER, CredentialStore};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::now_millis;

/// Cooldown applied when no reset time is known.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30 * 60);

/// The account chosen for the next call.
#[derive(Debug, Clone)]
pub struct SelectedAccount {
    pub index: usize,
    pub account: Account,
}

pub struct AccountRotator {
    state: Mutex<AccountStorage>,
    store: Option<Arc<CredentialStore>>,
    default_cooldown: Duration,
}

impl AccountRotator {
    /// In-memory rotator. Pass a store to persist cooldowns.
    pub fn new(
        storage: AccountStorage,
        store: Option<Arc<CredentialStore>>,
        default_cooldown: Duration,
    ) -> Self {
        info!(
            accounts = storage.accounts.len(),
            active_index = storage.active(),
            "account rotator initialized"
        );
        Self {
            state: Mutex::new(storage),
            store,
            default_cooldown,
        }
    }

    /// Load the account set from `store`. An unusable file yields an empty set.
    pub async fn load(store: Arc<CredentialStore>, default_cooldown: Duration) -> Self {
        let storage = store
            .load()
            .await
            .unwrap_or_else(|| AccountStorage::new(Vec::new(), 0));
        Self::new(storage, Some(store), default_cooldown)
    }

    pub fn default_cooldown(&self) -> Duration {
        self.default_cooldown
    }

    /// Current usable account. Updates the active index as a side effect.
    ///
    /// Returns `None` only when there are no accounts at all.
    pub async fn current(&self) -> Option<SelectedAccount> {
        let mut state = self.state.lock().await;
        let index = select_index(&state, now_millis())?;
        if index != state.active() {
            debug!(from = state.active(), to = index, "active account moved");
        }
        state.active_index = index as i64;
        Some(SelectedAccount {
            index,
            account: state.accounts[index].clone(),
        })
    }

    /// Put the active account into cooldown and advance to the next one.
    ///
    /// The cooldown ends at `reset_time` when it is a valid RFC 3339
    /// timestamp, otherwise after `cooldown` (or the default cooldown).
    /// Returns the new active index, or `None` for an empty set.
    pub async fn mark_exhausted(
        &self,
        cooldown: Option<Duration>,
        reset_time: Option<&str>,
    ) -> Option<usize> {
        let mut state = self.state.lock().await;
        let count = state.accounts.len();
        if count == 0 {
            return None;
        }

        let now = now_millis();
        let current = state.active();
        let until = reset_time.and_then(parse_reset_time).unwrap_or_else(|| {
            let cooldown = cooldown.unwrap_or(self.default_cooldown);
            let millis = u64::try_from(cooldown.as_millis()).unwrap_or(COOLDOWN_NEVER);
            now.saturating_add(millis)
        });
        state.accounts[current].cooldown_until = Some(until);

        let next = (current + 1) % count;
        state.active_index = next as i64;

        info!(
            account_index = current,
            account = %state.accounts[current].identity(current),
            next_index = next,
            cooldown_secs = until.saturating_sub(now) / 1000,
            "account exhausted, rotating"
        );
        self.persist(&state).await;
        Some(next)
    }

    /// Remember a project id resolved for the account at `index`.
    pub async fn cache_project_id(&self, index: usize, project_id: String) {
        let mut state = self.state.lock().await;
        if let Some(account) = state.accounts.get_mut(index)
            && account.project().is_none()
        {
            debug!(account_index = index, project_id = %project_id, "caching resolved project id");
            account.project_id = Some(project_id);
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.accounts.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Per-account status for the health endpoint. Never includes tokens.
    ///
    /// All accounts usable → healthy, some → degraded, none → unhealthy.
    pub async fn health(&self) -> serde_json::Value {
        let state = self.state.lock().await;
        let now = now_millis();

        let mut accounts = Vec::with_capacity(state.accounts.len());
        let mut available = 0usize;
        for (index, account) in state.accounts.iter().enumerate() {
            let entry = match account.cooldown_until {
                Some(until) if until > now => {
                    let remaining = if until == COOLDOWN_NEVER {
                        serde_json::Value::Null
                    } else {
                        serde_json::json!((until - now) / 1000)
                    };
                    serde_json::json!({
                        "index": index,
                        "account": account.identity(index),
                        "status": "cooling_down",
                        "cooldown_remaining_secs": remaining,
                    })
                }
                _ => {
                    available += 1;
                    serde_json::json!({
                        "index": index,
                        "account": account.identity(index),
                        "status": "available",
                    })
                }
            };
            accounts.push(entry);
        }

        let total = state.accounts.len();
        let status = if available == total && total > 0 {
            "healthy"
        } else if available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "active_index": state.active(),
            "accounts_total": total,
            "accounts_available": available,
            "accounts_cooling_down": total - available,
            "accounts": accounts,
        })
    }

    async fn persist(&self, state: &AccountStorage) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save(state).await {
            warn!(
                path = %store.path().display(),
                error = %e,
                "failed to persist account cooldown, keeping in-memory state"
            );
            metrics::counter!("quota_storage_failures_total").increment(1);
        }
    }
}

/// Index `current()` would return at `now`, without mutating anything.
fn select_index(storage: &AccountStorage, now: u64) -> Option<usize> {
    let count = storage.accounts.len();
    if count == 0 {
        return None;
    }

    let start = storage.active();
    let usable = (0..count)
        .map(|offset| (start + offset) % count)
        .find(|&index| !storage.accounts[index].is_cooling_down(now));
    if usable.is_some() {
        return usable;
    }

    storage
        .accounts
        .iter()
        .enumerate()
        .min_by_key(|(index, account)| (account.cooldown_until.unwrap_or(0), *index))
        .map(|(index, _)| index)
}

/// RFC 3339 → unix milliseconds. Pre-epoch or garbage input is rejected.
fn parse_reset_time(reset_time: &str) -> Option<u64> {
    let parsed = chrono::DateTime::parse_from_rfc3339(reset_time.trim()).ok()?;
    u64::try_from(parsed.timestamp_millis()).ok()
}
