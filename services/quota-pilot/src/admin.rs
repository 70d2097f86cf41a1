//! HTTP admin surface
//!
//! Exposes the plugin operations to local tooling while `serve` runs.
//!
//! Endpoints:
//! - GET  /health         : account pool, quota table, companion process
//! - GET  /metrics        : Prometheus text exposition
//! - GET  /quota?model=   : fresh quota for one model
//! - POST /quota/{model}  : record an externally learned quota
//! - GET  /check/{model}  : limit check with switch/rotate advice
//! - POST /rotate         : cool down the active account
//! - GET  /select         : best model under the current strategy
//! - PUT  /strategy       : partial strategy update
//! - GET  /agent/{name}    : model for a named agent (`?preferred=` optional)
//! - GET  /agents          : default agent configuration
//! - PUT  /agents          : install a strategy and reassign agent models

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use metrics_exporter_prometheus::PrometheusHandle;
use plugin::{
    AgentConfigUpdate, FailureKind, PluginError, QuotaPlugin, QuotaUpdate, StrategyPatch,
};
use serde::Deserialize;
use tracing::warn;

/// Shared state for admin handlers.
#[derive(Clone)]
pub struct AdminState {
    plugin: Arc<dyn QuotaPlugin>,
    prometheus: PrometheusHandle,
}

impl AdminState {
    pub fn new(plugin: Arc<dyn QuotaPlugin>, prometheus: PrometheusHandle) -> Self {
        Self { plugin, prometheus }
    }
}

/// Build the admin router with a concurrency limit of `max_connections`.
pub fn build_admin_router(state: AdminState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/quota", get(get_quota))
        .route("/quota/{model}", post(update_quota))
        .route("/check/{model}", get(check_model))
        .route("/rotate", post(rotate))
        .route("/select", get(select))
        .route("/strategy", put(set_strategy))
        .route("/agent/{name}", get(agent_model))
        .route("/agents", get(default_agents).put(update_agents))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

fn json_response(status: StatusCode, body: String) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

fn json_ok<T: serde::Serialize>(value: &T) -> Response {
    match serde_json::to_string(value) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => error_response(PluginError::new(
            FailureKind::Storage,
            format!("failed to serialize response: {e}"),
        )),
    }
}

fn status_for(kind: FailureKind) -> StatusCode {
    match kind {
        FailureKind::Authentication => StatusCode::UNAUTHORIZED,
        FailureKind::Transient => StatusCode::BAD_GATEWAY,
        FailureKind::NoAccount => StatusCode::SERVICE_UNAVAILABLE,
        FailureKind::NoQuotaData => StatusCode::NOT_FOUND,
        FailureKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
        FailureKind::InvalidInput => StatusCode::BAD_REQUEST,
    }
}

fn error_response(err: PluginError) -> Response {
    let status = status_for(err.kind);
    if status.is_server_error() {
        warn!(kind = %err.kind, error = %err.message, "admin request failed");
    }
    json_response(
        status,
        serde_json::json!({
            "error": {
                "type": err.kind.as_str(),
                "message": err.message,
            }
        })
        .to_string(),
    )
}

/// GET /health: 200 while any account is usable, else 503.
async fn health(State(state): State<AdminState>) -> Response {
    let health = state.plugin.health().await;
    let status = if health.is_usable() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    match serde_json::to_string(&health) {
        Ok(body) => json_response(status, body),
        Err(e) => error_response(PluginError::new(FailureKind::Storage, e.to_string())),
    }
}

async fn metrics_text(State(state): State<AdminState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

#[derive(Deserialize)]
struct QuotaQuery {
    model: Option<String>,
}

/// GET /quota: 404 with body `null` when the backend has no data.
async fn get_quota(State(state): State<AdminState>, Query(query): Query<QuotaQuery>) -> Response {
    match state.plugin.get_quota(query.model.as_deref()).await {
        Ok(Some(report)) => json_ok(&report),
        Ok(None) => json_response(StatusCode::NOT_FOUND, "null".into()),
        Err(e) => error_response(e),
    }
}

async fn update_quota(
    State(state): State<AdminState>,
    Path(model): Path<String>,
    axum::Json(update): axum::Json<QuotaUpdate>,
) -> Response {
    match state.plugin.update_quota_for_model(&model, update) {
        Ok(()) => json_ok(&serde_json::json!({ "updated": model })),
        Err(e) => error_response(e),
    }
}

async fn check_model(State(state): State<AdminState>, Path(model): Path<String>) -> Response {
    match state.plugin.check_model(&model).await {
        Ok(report) => json_ok(&report),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RotateRequest {
    #[serde(default)]
    reset_time: Option<String>,
}

/// POST /rotate: body is optional; `{"resetTime": "..."}` pins the cooldown end.
async fn rotate(State(state): State<AdminState>, body: Bytes) -> Response {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        RotateRequest { reset_time: None }
    } else {
        match serde_json::from_slice::<RotateRequest>(&body) {
            Ok(r) => r,
            Err(e) => {
                return error_response(PluginError::invalid_input(format!(
                    "invalid rotate request: {e}"
                )));
            }
        }
    };

    match state.plugin.rotate_account(request.reset_time.as_deref()).await {
        Ok(report) => json_ok(&report),
        Err(e) => error_response(e),
    }
}

async fn select(State(state): State<AdminState>) -> Response {
    let model = state.plugin.select_best_model().await;
    json_ok(&serde_json::json!({ "model": model }))
}

async fn set_strategy(
    State(state): State<AdminState>,
    axum::Json(patch): axum::Json<StrategyPatch>,
) -> Response {
    match state.plugin.set_rotation_strategy(patch) {
        Ok(view) => json_ok(&view),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct AgentQuery {
    preferred: Option<String>,
}

async fn agent_model(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    Query(query): Query<AgentQuery>,
) -> Response {
    match state
        .plugin
        .model_for_agent(&name, query.preferred.as_deref())
        .await
    {
        Ok(assignment) => json_ok(&assignment),
        Err(e) => error_response(e),
    }
}

async fn default_agents(State(state): State<AdminState>) -> Response {
    json_ok(&state.plugin.default_agent_config())
}

async fn update_agents(
    State(state): State<AdminState>,
    axum::Json(update): axum::Json<AgentConfigUpdate>,
) -> Response {
    match state.plugin.update_agent_config(update).await {
        Ok(config) => json_ok(&config),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin_impl::tests::test_plugin;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    /// PrometheusHandle for tests without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle()
    }

    fn router(tokens: &[&str], models: Vec<(&'static str, f64)>, preferred: &[&str]) -> Router {
        let plugin: Arc<dyn QuotaPlugin> = Arc::new(test_plugin(tokens, models, preferred));
        build_admin_router(AdminState::new(plugin, test_prometheus_handle()), 8)
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = router.oneshot(request).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn with_json(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_ok_with_usable_account() {
        let (status, body) = send(router(&["t1"], vec![], &[]), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["accounts"]["accounts_available"], 1);
    }

    #[tokio::test]
    async fn health_unavailable_without_accounts() {
        let (status, body) = send(router(&[], vec![], &[]), get("/health")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unhealthy");
    }

    #[tokio::test]
    async fn metrics_endpoint_is_text() {
        let resp = router(&["t1"], vec![], &[])
            .oneshot(get("/metrics"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(
            resp.headers()["content-type"]
                .to_str()
                .unwrap()
                .starts_with("text/plain")
        );
    }

    #[tokio::test]
    async fn quota_for_known_model() {
        let app = router(&["t1"], vec![("gemini-3-flash", 0.25)], &[]);
        let (status, body) = send(app, get("/quota?model=gemini-3-flash")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["model"], "gemini-3-flash");
        assert_eq!(body["percentage"], 25);
    }

    #[tokio::test]
    async fn quota_for_unknown_model_is_null_404() {
        let app = router(&["t1"], vec![("gemini-3-flash", 0.25)], &[]);
        let (status, body) = send(app, get("/quota?model=gpt-9")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.is_null());
    }

    #[tokio::test]
    async fn rejected_credentials_map_to_401() {
        let app = router(&["revoked-1"], vec![], &[]);
        let (status, body) = send(app, get("/quota")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["type"], "authentication");
    }

    #[tokio::test]
    async fn manual_update_steers_select() {
        let app = router(&["t1"], vec![], &["a", "b"]);

        let (status, body) = send(
            app.clone(),
            with_json("POST", "/quota/a", serde_json::json!({"remainingFraction": 0.0})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["updated"], "a");

        let (status, body) = send(app, get("/select")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["model"], "b");
    }

    #[tokio::test]
    async fn rotate_without_body() {
        let app = router(&["t1", "t2"], vec![], &[]);
        let request = Request::builder()
            .method("POST")
            .uri("/rotate")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["rotated"], true);
        assert_eq!(body["activeIndex"], 1);
    }

    #[tokio::test]
    async fn rotate_with_reset_time() {
        let app = router(&["t1", "t2"], vec![], &[]);
        let (status, _) = send(
            app.clone(),
            with_json(
                "POST",
                "/rotate",
                serde_json::json!({"resetTime": "2999-01-01T00:00:00Z"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, health) = send(app, get("/health")).await;
        assert_eq!(health["accounts"]["accounts"][0]["status"], "cooling_down");
    }

    #[tokio::test]
    async fn rotate_with_malformed_body_is_400() {
        let app = router(&["t1"], vec![], &[]);
        let request = Request::builder()
            .method("POST")
            .uri("/rotate")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = send(app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["type"], "invalid_input");
    }

    #[tokio::test]
    async fn rotate_without_accounts_is_503() {
        let app = router(&[], vec![], &[]);
        let request = Request::builder()
            .method("POST")
            .uri("/rotate")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app, request).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["type"], "no_account");
    }

    #[tokio::test]
    async fn check_suggests_replacement() {
        let app = router(&["t1"], vec![("x", 0.0), ("y", 0.9)], &["x", "y"]);
        let (status, body) = send(app, get("/check/x")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "exhausted");
        assert_eq!(body["nextModel"], "y");
    }

    #[tokio::test]
    async fn strategy_partial_update() {
        let app = router(&["t1"], vec![], &["a"]);
        let (status, body) = send(
            app,
            with_json("PUT", "/strategy", serde_json::json!({"threshold": 0.3})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["threshold"], 0.3);
        assert_eq!(body["preferredModels"][0], "a");
    }

    #[tokio::test]
    async fn strategy_rejects_bad_threshold() {
        let app = router(&["t1"], vec![], &["a"]);
        let (status, body) = send(
            app,
            with_json("PUT", "/strategy", serde_json::json!({"threshold": 3.0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["type"], "invalid_input");
    }

    #[test]
    fn failure_kinds_map_to_status_codes() {
        assert_eq!(status_for(FailureKind::Transient), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(FailureKind::NoQuotaData), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(FailureKind::Storage),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn agent_route_prefers_requested_model() {
        let app = router(&["t1"], vec![], &["a"]);
        let (status, body) = send(app, get("/agent/oracle?preferred=gemini-3-pro")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["agent"], "oracle");
        assert_eq!(body["model"], "gemini-3-pro");
    }

    #[tokio::test]
    async fn agent_route_without_preference_selects_best() {
        let app = router(&["t1"], vec![], &["a", "b"]);
        let (status, body) = send(app, get("/agent/explore")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["model"], "a");
    }

    #[tokio::test]
    async fn agents_template_and_update() {
        let app = router(&["t1"], vec![], &["a", "b"]);
        let (status, body) = send(app.clone(), get("/agents")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["agents"]["Sisyphus"]["model"], "a");
        assert_eq!(body["agents"]["librarian"]["model"], "b");

        let (status, body) = send(
            app,
            with_json(
                "PUT",
                "/agents",
                serde_json::json!({
                    "config": {"agents": {"oracle": {"model": "x", "variant": "high"}}},
                    "strategy": {"preferredModels": ["b"]}
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["agents"]["oracle"]["model"], "b");
        assert_eq!(body["agents"]["oracle"]["variant"], "high");
    }

    #[tokio::test]
    async fn agents_update_rejects_bad_threshold() {
        let app = router(&["t1"], vec![], &[]);
        let (status, body) = send(
            app,
            with_json("PUT", "/agents", serde_json::json!({"strategy": {"threshold": 3.0}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["type"], "invalid_input");
    }
}
