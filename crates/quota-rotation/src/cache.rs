//! Quota result cache file
//!
//! Status-line tools read the most recent quota figure from a small JSON file
//! instead of probing themselves. Writing it is best effort: failures are
//! logged and never reach the caller.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::now_millis;
use crate::table::QuotaRecord;

/// File name under the opencode config directory.
pub const CACHE_FILE_NAME: &str = "quota-cache.json";

/// On-disk cache shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedQuota {
    /// Remaining quota, rounded to a whole percent
    pub percentage: u32,
    pub model: String,
    /// Unix milliseconds at write time
    pub timestamp: u64,
}

impl CachedQuota {
    pub fn from_record(record: &QuotaRecord) -> Self {
        let model = if record.model.is_empty() {
            "unknown".to_string()
        } else {
            record.model.clone()
        };
        Self {
            percentage: record.percentage(),
            model,
            timestamp: now_millis(),
        }
    }
}

pub struct QuotaCacheWriter {
    path: PathBuf,
}

impl QuotaCacheWriter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// `$XDG_CONFIG_HOME/opencode/quota-cache.json`, else under `~/.config`.
    pub fn default_path() -> Option<PathBuf> {
        cloudcode_auth::opencode_config_dir().map(|dir| dir.join(CACHE_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `record` to the cache file. Never fails.
    pub async fn write(&self, record: &QuotaRecord) {
        let entry = CachedQuota::from_record(record);
        let json = match serde_json::to_string_pretty(&entry) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to serialize quota cache entry");
                return;
            }
        };
        match cloudcode_auth::write_atomic(&self.path, json.as_bytes()).await {
            Ok(()) => debug!(
                path = %self.path.display(),
                model = %entry.model,
                percentage = entry.percentage,
                "quota cache written"
            ),
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to write quota cache"),
        }
    }
}
