//! Last-observed quota per model
//!
//! A model the table has never heard of is treated as available. Records are
//! replaced whole on every observation and dropped all at once when the
//! active account changes, since they describe the previous account.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::now_millis;

/// Default availability threshold (2% remaining).
pub const DEFAULT_THRESHOLD: f64 = 0.02;

/// One quota observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaRecord {
    /// Canonical model id reported by the backend
    pub model: String,
    /// Always within [0, 1]
    pub remaining_fraction: f64,
    /// Unix milliseconds
    pub observed_at: u64,
    /// RFC 3339 time at which the quota window resets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<String>,
}

impl QuotaRecord {
    pub fn new(model: impl Into<String>, remaining_fraction: f64) -> Self {
        Self {
            model: model.into(),
            remaining_fraction: clamp_fraction(remaining_fraction),
            observed_at: now_millis(),
            reset_time: None,
        }
    }

    pub fn with_reset_time(mut self, reset_time: Option<String>) -> Self {
        self.reset_time = reset_time.filter(|r| !r.is_empty());
        self
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining_fraction <= 0.0
    }

    /// Rounded percentage for display.
    pub fn percentage(&self) -> u32 {
        (self.remaining_fraction * 100.0).round() as u32
    }
}

/// Clamp into [0, 1]; NaN counts as nothing left.
pub fn clamp_fraction(fraction: f64) -> f64 {
    if fraction.is_nan() {
        0.0
    } else {
        fraction.clamp(0.0, 1.0)
    }
}

struct TableState {
    records: HashMap<String, Arc<QuotaRecord>>,
    threshold: f64,
}

/// Model → last quota record, plus the availability threshold.
///
/// Guarded by a std `RwLock`; no method holds it across an await point.
pub struct QuotaStateTable {
    state: RwLock<TableState>,
}

impl Default for QuotaStateTable {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl QuotaStateTable {
    pub fn new(threshold: f64) -> Self {
        Self {
            state: RwLock::new(TableState {
                records: HashMap::new(),
                threshold: clamp_fraction(threshold),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, TableState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, TableState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn threshold(&self) -> f64 {
        self.read().threshold
    }

    pub fn set_threshold(&self, threshold: f64) {
        self.write().threshold = clamp_fraction(threshold);
    }

    /// Overwrite the record for `model`, stamping it with the current time.
    pub fn update(&self, model: &str, record: QuotaRecord) {
        let record = QuotaRecord {
            remaining_fraction: clamp_fraction(record.remaining_fraction),
            observed_at: now_millis(),
            ..record
        };
        debug!(model, remaining_fraction = record.remaining_fraction, "quota updated");
        self.write().records.insert(model.to_string(), Arc::new(record));
    }

    /// Store an already-shared record under `model` without re-stamping.
    pub fn insert_shared(&self, model: &str, record: Arc<QuotaRecord>) {
        self.write().records.insert(model.to_string(), record);
    }

    pub fn get(&self, model: &str) -> Option<Arc<QuotaRecord>> {
        self.read().records.get(model).cloned()
    }

    /// Unknown models are available; known ones need at least `threshold`.
    pub fn is_available(&self, model: &str) -> bool {
        let state = self.read();
        match state.records.get(model) {
            Some(record) => record.remaining_fraction >= state.threshold,
            None => true,
        }
    }

    /// First available candidate in list order.
    pub fn best_available<S: AsRef<str>>(&self, candidates: &[S]) -> Option<String> {
        self.best_available_excluding(candidates, &[])
    }

    pub(crate) fn best_available_excluding<S: AsRef<str>>(
        &self,
        candidates: &[S],
        excluded: &[&str],
    ) -> Option<String> {
        let state = self.read();
        candidates
            .iter()
            .map(AsRef::as_ref)
            .filter(|model| !excluded.contains(model))
            .find(|model| match state.records.get(*model) {
                Some(record) => record.remaining_fraction >= state.threshold,
                None => true,
            })
            .map(str::to_string)
    }

    pub fn clear_all(&self) {
        let mut state = self.write();
        if !state.records.is_empty() {
            debug!(records = state.records.len(), "quota table cleared");
        }
        state.records.clear();
    }

    /// Drop records observed more than `max_age` ago. Returns how many went.
    pub fn evict_stale(&self, max_age: Duration) -> usize {
        let now = now_millis();
        let max_age = max_age.as_millis() as u64;
        let mut state = self.write();
        let before = state.records.len();
        state
            .records
            .retain(|_, record| now.saturating_sub(record.observed_at) <= max_age);
        let evicted = before - state.records.len();
        if evicted > 0 {
            debug!(evicted, "evicted stale quota records");
        }
        evicted
    }

    /// All records, sorted by key.
    pub fn snapshot(&self) -> Vec<(String, Arc<QuotaRecord>)> {
        let mut entries: Vec<_> = self
            .read()
            .records
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
