//! Remote quota probe
//!
//! One probe is three calls: refresh the access token, resolve the companion
//! project when the account has none, then fetch the model list with quota
//! info. Token rejection surfaces as `Error::Authentication`; every other
//! failure along the way is `Error::Transient`, except project resolution,
//! which is best effort.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use cloudcode_auth::{
    Account, FETCH_AVAILABLE_MODELS_PATH, OAuthClient, USER_AGENT, load_code_assist, refresh_token,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::table::QuotaRecord;

/// Model labels hidden from quota results (matched case-insensitively).
const FILTERED_PREFIXES: &[&str] = &["chat_", "rev19"];
const FILTERED_SUBSTRINGS: &[&str] = &["gemini 2.5", "gemini 3 pro image"];

/// Prefixes stripped before fuzzy model-name matching.
const PROVIDER_PREFIXES: &[&str] = &["google/", "anthropic/", "openai/", "antigravity-"];

/// Source of fresh quota numbers for an account.
///
/// Uses `Pin<Box<dyn Future>>` so the controller can hold `Arc<dyn QuotaSource>`.
pub trait QuotaSource: Send + Sync {
    /// Every visible model with its quota, in backend order.
    fn fetch_all<'a>(
        &'a self,
        account: &'a Account,
    ) -> Pin<Box<dyn Future<Output = Result<QuotaSnapshot>> + Send + 'a>>;
}

/// One model entry of a probe result.
#[derive(Debug, Clone, Serialize)]
pub struct ModelQuota {
    /// Canonical id, e.g. `gemini-3-pro-high`
    pub id: String,
    /// Display label, e.g. `Gemini 3 Pro (High)`
    pub label: String,
    pub record: Arc<QuotaRecord>,
}

/// Result of one probe.
///
/// Each model is reachable by its id and by its label; both keys resolve to
/// the same shared record.
#[derive(Debug, Clone, Default)]
pub struct QuotaSnapshot {
    models: Vec<ModelQuota>,
    aliases: HashMap<String, usize>,
    project_id: Option<String>,
}

impl QuotaSnapshot {
    pub fn new(models: Vec<ModelQuota>, project_id: Option<String>) -> Self {
        let mut aliases = HashMap::with_capacity(models.len() * 2);
        for (index, model) in models.iter().enumerate() {
            aliases.entry(model.id.clone()).or_insert(index);
            aliases.entry(model.label.clone()).or_insert(index);
        }
        Self {
            models,
            aliases,
            project_id,
        }
    }

    pub fn models(&self) -> &[ModelQuota] {
        &self.models
    }

    /// Project the quota was fetched for, if any.
    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    pub fn first(&self) -> Option<&ModelQuota> {
        self.models.first()
    }

    /// Exact lookup by id or label.
    pub fn get(&self, key: &str) -> Option<&ModelQuota> {
        self.aliases.get(key).map(|&index| &self.models[index])
    }

    /// Exact id/label match first, then a normalized substring match.
    /// The first hit in backend order wins.
    pub fn find(&self, name: &str) -> Option<&ModelQuota> {
        if let Some(model) = self.get(name) {
            return Some(model);
        }
        let needle = normalize_model_name(name);
        if needle.is_empty() {
            return None;
        }
        self.models.iter().find(|model| {
            normalize_model_name(&model.id).contains(&needle)
                || normalize_model_name(&model.label).contains(&needle)
        })
    }

    /// Every model keyed by both id and label.
    pub fn all_quotas(&self) -> BTreeMap<String, Arc<QuotaRecord>> {
        self.aliases
            .iter()
            .map(|(key, &index)| (key.clone(), self.models[index].record.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// Lowercase, drop a provider prefix, and collapse `-`, `_` and whitespace
/// runs into single spaces.
pub fn normalize_model_name(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    let mut rest = lower.as_str();
    for prefix in PROVIDER_PREFIXES {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
        }
    }
    rest.split(|c: char| c == '-' || c == '_' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_filtered(label: &str) -> bool {
    let lower = label.to_lowercase();
    FILTERED_PREFIXES.iter().any(|p| lower.starts_with(p))
        || FILTERED_SUBSTRINGS.iter().any(|s| lower.contains(s))
}

#[derive(Debug, Deserialize)]
struct FetchModelsResponse {
    #[serde(default)]
    models: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelEntry {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    quota_info: Option<QuotaInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuotaInfo {
    #[serde(default)]
    remaining_fraction: Option<f64>,
    #[serde(default)]
    reset_time: Option<String>,
}

/// Turn the backend `models` object into filtered entries, preserving order.
fn parse_models(models: Map<String, Value>) -> Vec<ModelQuota> {
    let mut parsed = Vec::with_capacity(models.len());
    for (key, value) in models {
        let entry: ModelEntry = match serde_json::from_value(value) {
            Ok(entry) => entry,
            Err(e) => {
                debug!(model = %key, error = %e, "skipping malformed model entry");
                continue;
            }
        };
        let Some(quota) = entry.quota_info else {
            continue;
        };

        let label = entry
            .display_name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| key.clone());
        if is_filtered(&label) {
            continue;
        }
        let id = entry.model.filter(|m| !m.is_empty()).unwrap_or(key);

        let record = QuotaRecord::new(id.clone(), quota.remaining_fraction.unwrap_or(0.0))
            .with_reset_time(quota.reset_time);
        parsed.push(ModelQuota {
            id,
            label,
            record: Arc::new(record),
        });
    }
    parsed
}

/// Cloud Code quota probe.
pub struct QuotaProbe {
    http: reqwest::Client,
    oauth: OAuthClient,
    base_url: String,
    timeout: Duration,
}

impl QuotaProbe {
    pub fn new(
        http: reqwest::Client,
        oauth: OAuthClient,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            oauth,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    /// Run the full refresh → project → fetch chain for `account`.
    pub async fn check_quota(&self, account: &Account) -> Result<QuotaSnapshot> {
        let token = refresh_token(
            &self.http,
            &self.oauth,
            account.refresh_token.expose(),
            self.timeout,
        )
        .await?;
        let access_token = token.access_token.expose();

        let project_id = match account.project() {
            Some(project) => Some(project.to_string()),
            None => {
                match load_code_assist(&self.http, &self.base_url, access_token, self.timeout).await
                {
                    Ok(project) => project,
                    Err(e) => {
                        warn!(error = %e, "project lookup failed, fetching quota without project");
                        None
                    }
                }
            }
        };

        let models = self
            .fetch_available_models(access_token, project_id.as_deref())
            .await?;
        let snapshot = QuotaSnapshot::new(parse_models(models), project_id);
        debug!(
            models = snapshot.len(),
            project_id = ?snapshot.project_id(),
            "quota probe complete"
        );
        Ok(snapshot)
    }

    async fn fetch_available_models(
        &self,
        access_token: &str,
        project_id: Option<&str>,
    ) -> Result<Map<String, Value>> {
        let url = format!("{}{FETCH_AVAILABLE_MODELS_PATH}", self.base_url);
        let body = match project_id {
            Some(project) => json!({ "project": project }),
            None => json!({}),
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Transient(format!("fetchAvailableModels request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transient(format!(
                "fetchAvailableModels returned {status}"
            )));
        }

        let parsed = response
            .json::<FetchModelsResponse>()
            .await
            .map_err(|e| Error::Transient(format!("invalid fetchAvailableModels response: {e}")))?;
        Ok(parsed.models.unwrap_or_default())
    }
}

impl QuotaSource for QuotaProbe {
    fn fetch_all<'a>(
        &'a self,
        account: &'a Account,
    ) -> Pin<Box<dyn Future<Output = Result<QuotaSnapshot>> + Send + 'a>> {
        Box::pin(self.check_quota(account))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    fn models_json() -> Value {
        json!({
            "gemini-3-pro-high": {
                "displayName": "Gemini 3 Pro (High)",
                "model": "gemini-3-pro-high",
                "quotaInfo": {"remainingFraction": 0.8, "resetTime": "2030-01-01T00:00:00Z"}
            },
            "chat_20706": {"quotaInfo": {"remainingFraction": 1.0}},
            "gemini-2.5-flash": {
                "displayName": "Gemini 2.5 Flash",
                "quotaInfo": {"remainingFraction": 1.0}
            },
            "rev19-uic3-1p": {"quotaInfo": {"remainingFraction": 1.0}},
            "gemini-3-pro-image": {
                "displayName": "Gemini 3 Pro Image",
                "quotaInfo": {"remainingFraction": 1.0}
            },
            "claude-sonnet-4-5": {
                "displayName": "Claude Sonnet 4.5",
                "quotaInfo": {"remainingFraction": 1.6}
            },
            "claude-opus-4-5-thinking": {
                "displayName": "Claude Opus 4.5 (Thinking)",
                "quotaInfo": {"resetTime": "2030-01-01T05:00:00Z"}
            },
            "tab_flash_lite": {"displayName": "Tab Flash Lite"}
        })
    }

    fn models_map() -> Map<String, Value> {
        match models_json() {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn parse_filters_and_preserves_order() {
        let parsed = parse_models(models_map());
        let ids: Vec<_> = parsed.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "gemini-3-pro-high",
                "claude-sonnet-4-5",
                "claude-opus-4-5-thinking"
            ]
        );
    }

    #[test]
    fn parse_clamps_and_defaults_fraction() {
        let parsed = parse_models(models_map());
        assert_eq!(parsed[1].record.remaining_fraction, 1.0);
        assert_eq!(parsed[2].record.remaining_fraction, 0.0);
        assert_eq!(
            parsed[2].record.reset_time.as_deref(),
            Some("2030-01-01T05:00:00Z")
        );
    }

    #[test]
    fn parse_uses_key_when_fields_missing() {
        let mut map = Map::new();
        map.insert(
            "bare-model".into(),
            json!({"quotaInfo": {"remainingFraction": 0.3}}),
        );
        let parsed = parse_models(map);
        assert_eq!(parsed[0].id, "bare-model");
        assert_eq!(parsed[0].label, "bare-model");
    }

    #[test]
    fn filter_is_case_insensitive() {
        assert!(is_filtered("CHAT_123"));
        assert!(is_filtered("Rev19 something"));
        assert!(is_filtered("Gemini 2.5 Pro"));
        assert!(!is_filtered("Gemini 3 Pro (High)"));
    }

    #[test]
    fn normalize_strips_prefix_and_separators() {
        assert_eq!(normalize_model_name("google/gemini-3-pro"), "gemini 3 pro");
        assert_eq!(
            normalize_model_name("antigravity-claude_sonnet--4.5"),
            "claude sonnet 4.5"
        );
        assert_eq!(normalize_model_name("  Claude   Opus "), "claude opus");
        assert_eq!(normalize_model_name("---"), "");
    }

    #[test]
    fn snapshot_dual_keys_share_one_record() {
        let snapshot = QuotaSnapshot::new(parse_models(models_map()), None);
        let by_id = &snapshot.get("claude-sonnet-4-5").unwrap().record;
        let by_label = &snapshot.get("Claude Sonnet 4.5").unwrap().record;
        assert!(Arc::ptr_eq(by_id, by_label));

        let all = snapshot.all_quotas();
        assert_eq!(all.len(), 6);
        assert!(Arc::ptr_eq(&all["gemini-3-pro-high"], &all["Gemini 3 Pro (High)"]));
    }

    #[test]
    fn find_prefers_exact_then_fuzzy() {
        let snapshot = QuotaSnapshot::new(parse_models(models_map()), None);
        assert_eq!(
            snapshot.find("Claude Sonnet 4.5").unwrap().id,
            "claude-sonnet-4-5"
        );
        assert_eq!(
            snapshot.find("google/gemini-3-pro").unwrap().id,
            "gemini-3-pro-high"
        );
        assert_eq!(
            snapshot.find("anthropic/claude-opus-4-5").unwrap().id,
            "claude-opus-4-5-thinking"
        );
        assert!(snapshot.find("gpt-5").is_none());
        assert!(snapshot.find("").is_none());
    }

    #[test]
    fn find_returns_first_fuzzy_match_in_backend_order() {
        let mut map = Map::new();
        map.insert("claude-x-fast".into(), json!({"quotaInfo": {"remainingFraction": 0.1}}));
        map.insert("claude-x".into(), json!({"quotaInfo": {"remainingFraction": 0.9}}));
        let snapshot = QuotaSnapshot::new(parse_models(map), None);
        assert_eq!(snapshot.find("Claude X").unwrap().id, "claude-x-fast");
    }

    /// Shared state of the fake Cloud Code server.
    #[derive(Clone, Default)]
    struct Backend {
        token_status: Arc<Mutex<Option<StatusCode>>>,
        models_status: Arc<Mutex<Option<StatusCode>>>,
        load_calls: Arc<AtomicUsize>,
        fetch_bodies: Arc<Mutex<Vec<Value>>>,
    }

    async fn start_backend(backend: Backend) -> String {
        let token = backend.clone();
        let load = backend.clone();
        let fetch = backend.clone();
        let app = axum::Router::new()
            .route(
                "/token",
                axum::routing::post(move || {
                    let token = token.clone();
                    async move {
                        match *token.token_status.lock().unwrap() {
                            Some(status) => (status, "{\"error\":\"denied\"}".to_string()),
                            None => (
                                StatusCode::OK,
                                r#"{"access_token":"at_probe","expires_in":3600}"#.to_string(),
                            ),
                        }
                    }
                }),
            )
            .route(
                "/v1internal:loadCodeAssist",
                axum::routing::post(move || {
                    let load = load.clone();
                    async move {
                        load.load_calls.fetch_add(1, Ordering::SeqCst);
                        axum::Json(json!({"cloudaicompanionProject": "projects/discovered-1"}))
                    }
                }),
            )
            .route(
                "/v1internal:fetchAvailableModels",
                axum::routing::post(move |axum::Json(body): axum::Json<Value>| {
                    let fetch = fetch.clone();
                    async move {
                        fetch.fetch_bodies.lock().unwrap().push(body);
                        match *fetch.models_status.lock().unwrap() {
                            Some(status) => (status, axum::Json(json!({}))),
                            None => (StatusCode::OK, axum::Json(json!({"models": models_json()}))),
                        }
                    }
                }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn probe_for(base: &str) -> QuotaProbe {
        QuotaProbe::new(
            reqwest::Client::new(),
            OAuthClient {
                token_url: format!("{base}/token"),
                ..OAuthClient::default()
            },
            base,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn probe_resolves_project_when_missing() {
        let backend = Backend::default();
        let base = start_backend(backend.clone()).await;

        let snapshot = probe_for(&base)
            .check_quota(&Account::new("rt"))
            .await
            .unwrap();
        assert_eq!(snapshot.project_id(), Some("discovered-1"));
        assert_eq!(snapshot.len(), 3);
        assert_eq!(backend.load_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            backend.fetch_bodies.lock().unwrap()[0],
            json!({"project": "discovered-1"})
        );
    }

    #[tokio::test]
    async fn probe_skips_lookup_for_known_project() {
        let backend = Backend::default();
        let base = start_backend(backend.clone()).await;
        let mut account = Account::new("rt");
        account.project_id = Some("cached-9".into());

        let snapshot = probe_for(&base).fetch_all(&account).await.unwrap();
        assert_eq!(snapshot.project_id(), Some("cached-9"));
        assert_eq!(backend.load_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejected_token_is_authentication_error() {
        let backend = Backend::default();
        *backend.token_status.lock().unwrap() = Some(StatusCode::UNAUTHORIZED);
        let base = start_backend(backend.clone()).await;

        let err = probe_for(&base)
            .check_quota(&Account::new("rt"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authentication(_)), "got: {err}");
        assert!(backend.fetch_bodies.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn token_server_error_is_transient() {
        let backend = Backend::default();
        *backend.token_status.lock().unwrap() = Some(StatusCode::BAD_GATEWAY);
        let base = start_backend(backend).await;

        let err = probe_for(&base)
            .check_quota(&Account::new("rt"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transient(_)), "got: {err}");
    }

    #[tokio::test]
    async fn fetch_failure_is_transient() {
        let backend = Backend::default();
        *backend.models_status.lock().unwrap() = Some(StatusCode::SERVICE_UNAVAILABLE);
        let base = start_backend(backend).await;

        let err = probe_for(&base)
            .check_quota(&Account::new("rt"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transient(_)), "got: {err}");
    }
}
