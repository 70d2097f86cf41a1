//! Versioned account file
//!
//! The account file is shared with the desktop plugin that creates it, so
//! this module only understands the fields rotation needs and carries every
//! other key through untouched. Writes go through a temp file + rename and a
//! tokio Mutex serializes them within the process.
//!
//! Reading is forgiving: a missing, unreadable, unparsable or wrong-version
//! file is logged and treated as "no accounts" rather than an error.

use std::path::{Path, PathBuf};

use common::Secret;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::constants::{ACCOUNTS_FILE_NAME, STORAGE_VERSION};
use crate::error::{Error, Result};

/// Cooldown value for an account that never recovers on its own.
pub const COOLDOWN_NEVER: u64 = u64::MAX;

/// One stored account.
///
/// `cooldown_until` is a unix timestamp in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub refresh_token: Secret<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(
        rename = "coolingDownUntil",
        default,
        deserialize_with = "deserialize_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub cooldown_until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_project_id: Option<String>,
    /// Keys owned by other tools (addedAt, lastUsed, rateLimitResetTimes, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Account {
    pub fn new(refresh_token: impl Into<String>) -> Self {
        Self {
            refresh_token: Secret::new(refresh_token.into()),
            email: None,
            cooldown_until: None,
            project_id: None,
            managed_project_id: None,
            extra: Map::new(),
        }
    }

    /// Project id to scope quota calls to, if one is known.
    pub fn project(&self) -> Option<&str> {
        self.project_id
            .as_deref()
            .or(self.managed_project_id.as_deref())
            .filter(|p| !p.is_empty())
    }

    /// Whether the account is still cooling down at `now_millis`.
    pub fn is_cooling_down(&self, now_millis: u64) -> bool {
        self.cooldown_until.is_some_and(|until| until > now_millis)
    }

    /// Label for logs and status output. Never the token.
    pub fn identity(&self, index: usize) -> String {
        match &self.email {
            Some(email) if !email.is_empty() => email.clone(),
            _ => format!("account-{index}"),
        }
    }
}

/// Per-family active pointers kept by the desktop plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FamilyIndex {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gemini: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Whole account file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountStorage {
    pub version: u32,
    #[serde(default)]
    pub accounts: Vec<Account>,
    /// May be -1 in files written before any account was selected
    #[serde(default)]
    pub active_index: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_index_by_family: Option<FamilyIndex>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AccountStorage {
    pub fn new(accounts: Vec<Account>, active_index: usize) -> Self {
        Self {
            version: STORAGE_VERSION,
            accounts,
            active_index: active_index as i64,
            active_index_by_family: None,
            extra: Map::new(),
        }
    }

    /// Active index clamped into range. Out-of-range values fall back to 0.
    pub fn active(&self) -> usize {
        usize::try_from(self.active_index)
            .ok()
            .filter(|i| *i < self.accounts.len())
            .unwrap_or(0)
    }
}

/// Account file location, bound to one path.
pub struct CredentialStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// `$XDG_CONFIG_HOME/opencode/antigravity-accounts.json`, else under `~/.config`.
    pub fn default_path() -> Option<PathBuf> {
        opencode_config_dir().map(|dir| dir.join(ACCOUNTS_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the account file. Returns `None` whenever it cannot be used.
    pub async fn load(&self) -> Option<AccountStorage> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "account file not found, starting with no accounts");
                return None;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read account file");
                return None;
            }
        };

        match parse_storage(&contents) {
            Ok(storage) => {
                info!(
                    path = %self.path.display(),
                    accounts = storage.accounts.len(),
                    active_index = storage.active_index,
                    "loaded accounts"
                );
                Some(storage)
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring account file");
                None
            }
        }
    }

    /// Persist the account set. Creates parent directories as needed.
    pub async fn save(&self, storage: &AccountStorage) -> Result<()> {
        let json = serde_json::to_string_pretty(storage)
            .map_err(|e| Error::CredentialParse(format!("serializing accounts: {e}")))?;
        let _guard = self.write_lock.lock().await;
        write_atomic(&self.path, json.as_bytes()).await?;
        debug!(path = %self.path.display(), accounts = storage.accounts.len(), "persisted accounts");
        Ok(())
    }
}

fn parse_storage(contents: &str) -> Result<AccountStorage> {
    let raw: Value = serde_json::from_str(contents)
        .map_err(|e| Error::CredentialParse(format!("parsing account file: {e}")))?;
    let version = raw.get("version").and_then(Value::as_u64);
    if version != Some(u64::from(STORAGE_VERSION)) {
        return Err(Error::CredentialParse(format!(
            "unsupported account file version {version:?}, expected {STORAGE_VERSION}"
        )));
    }
    serde_json::from_value(raw)
        .map_err(|e| Error::CredentialParse(format!("parsing account file: {e}")))
}

/// `$XDG_CONFIG_HOME/opencode` or `$HOME/.config/opencode`.
pub fn opencode_config_dir() -> Option<PathBuf> {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(xdg).join("opencode"));
    }
    std::env::var_os("HOME")
        .filter(|v| !v.is_empty())
        .map(|home| PathBuf::from(home).join(".config").join("opencode"))
}

/// Write bytes to `path` atomically with 0600 permissions.
///
/// The temp file lives next to the target so the rename stays on one
/// filesystem.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::Io(format!("creating {}: {e}", dir.display())))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "data".into());
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, bytes)
        .await
        .map_err(|e| Error::Io(format!("writing temp file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp file: {e}")))?;
    Ok(())
}

/// Accept integer or float millisecond timestamps. Null means unset.
fn deserialize_millis<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<u64>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0)
                .map(|f| f as u64)
        }),
        _ => None,
    }))
}
