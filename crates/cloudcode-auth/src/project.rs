//! Companion project discovery
//!
//! Quota numbers are scoped to a Cloud Code companion project. Accounts that
//! already carry a project id skip this call; the rest ask loadCodeAssist.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::constants::{
    CLIENT_NAME, CLIENT_VERSION, EXTENSION_VERSION, IDE_NAME, LOAD_CODE_ASSIST_PATH, USER_AGENT,
};
use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadCodeAssistResponse {
    #[serde(default)]
    cloudaicompanion_project: Option<Value>,
}

/// Ask loadCodeAssist which companion project the access token belongs to.
///
/// Returns `Ok(None)` when the response carries no recognizable project.
pub async fn load_code_assist(
    http: &reqwest::Client,
    base_url: &str,
    access_token: &str,
    timeout: Duration,
) -> Result<Option<String>> {
    let url = format!("{}{LOAD_CODE_ASSIST_PATH}", base_url.trim_end_matches('/'));
    let body = json!({
        "metadata": {
            "clientName": CLIENT_NAME,
            "versionString": CLIENT_VERSION,
            "extensionVersion": EXTENSION_VERSION,
            "ideName": IDE_NAME,
        }
    });

    let response = http
        .post(&url)
        .bearer_auth(access_token)
        .header(reqwest::header::USER_AGENT, USER_AGENT)
        .json(&body)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| Error::from_reqwest("loadCodeAssist request failed", e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::Upstream(format!("loadCodeAssist returned {status}")));
    }

    let parsed = response
        .json::<LoadCodeAssistResponse>()
        .await
        .map_err(|e| Error::Upstream(format!("invalid loadCodeAssist response: {e}")))?;

    let project = parsed
        .cloudaicompanion_project
        .as_ref()
        .and_then(extract_project_id);
    debug!(project_id = ?project, "resolved companion project");
    Ok(project)
}

/// Pull a project id out of a loadCodeAssist project value.
///
/// Accepts `"projects/<id>/..."` paths, bare ids, and `{"id": ...}` objects.
pub fn extract_project_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Some(idx) = s.find("projects/") {
                let rest = &s[idx + "projects/".len()..];
                let id = rest.split('/').next().unwrap_or_default();
                (!id.is_empty()).then(|| id.to_string())
            } else if !s.is_empty() && !s.contains('/') {
                Some(s.to_string())
            } else {
                None
            }
        }
        Value::Object(map) => map.get("id").and_then(extract_project_id),
        _ => None,
    }
}
