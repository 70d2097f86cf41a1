//! Account retry policy
//!
//! An authentication failure means the current account's credential is no
//! good, so the account is rotated out and the operation re-issued against
//! the next one. Any other error kind, or an exhausted budget, propagates
//! unchanged.

use std::future::Future;

use tracing::warn;

use crate::error::{Error, Result};
use crate::rotator::{AccountRotator, SelectedAccount};
use crate::table::QuotaStateTable;

/// Rotated retries after the first attempt.
pub const DEFAULT_RETRY_BUDGET: u32 = 3;

/// Put the current account into cooldown and forget its quota numbers.
///
/// Returns the new active index, or `None` when there are no accounts.
pub async fn rotate_account(
    rotator: &AccountRotator,
    table: &QuotaStateTable,
    reset_time: Option<&str>,
) -> Option<usize> {
    rotate(rotator, table, reset_time, "quota").await
}

async fn rotate(
    rotator: &AccountRotator,
    table: &QuotaStateTable,
    reset_time: Option<&str>,
    reason: &'static str,
) -> Option<usize> {
    let next = rotator.mark_exhausted(None, reset_time).await;
    if next.is_some() {
        metrics::counter!("quota_account_rotations_total", "reason" => reason).increment(1);
    }
    table.clear_all();
    next
}

/// Run `op` against the current account, rotating on authentication failure.
///
/// At most `retries + 1` attempts are made.
pub async fn with_account_retry<T, F, Fut>(
    rotator: &AccountRotator,
    table: &QuotaStateTable,
    retries: u32,
    mut op: F,
) -> Result<T>
where
    F: FnMut(SelectedAccount) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut remaining = retries;
    loop {
        let selected = rotator.current().await.ok_or(Error::NoAccountAvailable)?;
        let index = selected.index;
        match op(selected).await {
            Err(Error::Authentication(msg)) if remaining > 0 => {
                remaining -= 1;
                warn!(
                    account_index = index,
                    retries_left = remaining,
                    error = %msg,
                    "credential rejected, rotating account"
                );
                rotate(rotator, table, None, "authentication").await;
            }
            other => return other,
        }
    }
}
