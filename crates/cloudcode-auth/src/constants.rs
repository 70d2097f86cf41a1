//! Cloud Code endpoint constants
//!
//! The client id identifies the public desktop OAuth application and is not a
//! secret. The matching client secret is supplied at runtime through
//! configuration and never compiled in.

use std::time::Duration;

/// Public OAuth client id of the desktop application.
pub const DEFAULT_CLIENT_ID: &str =
    "1071006060591-tmhssin2h21lcre235vtolojh4g403ep.apps.googleusercontent.com";

/// Google token endpoint used for refresh-token grants.
pub const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

/// Cloud Code private API host.
pub const CLOUDCODE_BASE_URL: &str = "https://cloudcode-pa.googleapis.com";

pub const LOAD_CODE_ASSIST_PATH: &str = "/v1internal:loadCodeAssist";

pub const FETCH_AVAILABLE_MODELS_PATH: &str = "/v1internal:fetchAvailableModels";

/// User-Agent the Cloud Code API expects from the desktop client.
pub const USER_AGENT: &str = "antigravity";

/// Client metadata sent with loadCodeAssist.
pub const CLIENT_NAME: &str = "code-oss";
pub const CLIENT_VERSION: &str = "1.95.2";
pub const EXTENSION_VERSION: &str = "1.11.13";
pub const IDE_NAME: &str = "vscode";

/// Only this account file version is understood.
pub const STORAGE_VERSION: u32 = 3;

/// Account file name under the opencode config directory.
pub const ACCOUNTS_FILE_NAME: &str = "antigravity-accounts.json";

/// Default per-request timeout for token and quota calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
