use crate::dashboard::{DashboardError, DashboardHandle};
use crate::metrics::Metrics;
use crate::state::State as DashboardState;
use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{header::CONTENT_TYPE, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub state: Arc<RwLock<DashboardState>>,
    pub dashboard: DashboardHandle,
    pub history_limit: usize,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallRequest {
    #[serde(default)]
    pub updates: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RollbackRequest {
    pub update_id: Option<String>,
}

pub fn build_router(app: HttpAppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/state", get(state_handler))
        .route("/api/history/health", get(health_history_handler))
        .route("/api/history/updates", get(update_history_handler))
        .route("/api/updates/check", post(check_updates_handler))
        .route("/api/updates/install", post(install_updates_handler))
        .route("/api/updates/rollback", post(rollback_updates_handler))
        .route("/api/health/refresh", post(refresh_health_handler))
        .route("/api/refresh", post(refresh_handler))
        .with_state(app)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(app): State<HttpAppState>) -> Response {
    app.metrics.inc_scrape_count();
    {
        let guard = app.state.read().await;
        app.metrics.update_from_state(&guard);
    }
    match app.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка кодирования метрик: {err}"),
        )
            .into_response(),
    }
}

async fn state_handler(State(app): State<HttpAppState>) -> impl IntoResponse {
    let guard = app.state.read().await;
    Json(guard.clone())
}

async fn health_history_handler(
    State(app): State<HttpAppState>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(app.history_limit);
    worker_response(app.dashboard.health_history(limit).await)
}

async fn update_history_handler(
    State(app): State<HttpAppState>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(app.history_limit);
    worker_response(app.dashboard.update_history(limit).await)
}

async fn check_updates_handler(State(app): State<HttpAppState>) -> Response {
    worker_response(app.dashboard.check_updates().await)
}

async fn install_updates_handler(
    State(app): State<HttpAppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let req: InstallRequest = match action_request(&headers, &body) {
        Ok(req) => req,
        Err(rejection) => return rejection,
    };
    worker_response(app.dashboard.install_updates(req.updates).await)
}

async fn rollback_updates_handler(
    State(app): State<HttpAppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let req: RollbackRequest = match action_request(&headers, &body) {
        Ok(req) => req,
        Err(rejection) => return rejection,
    };
    worker_response(app.dashboard.rollback_updates(req.update_id).await)
}

/// An empty body means the default request. Anything else must be JSON
/// that matches `T` exactly, otherwise the action is not started.
fn action_request<T: DeserializeOwned + Default>(
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<T, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }

    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"));
    if !is_json {
        return Err((
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "ожидается Content-Type: application/json",
        )
            .into_response());
    }

    Json::<T>::from_bytes(body)
        .map(|Json(req)| req)
        .map_err(IntoResponse::into_response)
}

async fn refresh_handler(State(app): State<HttpAppState>) -> Response {
    if let Err(err) = app.dashboard.refresh().await {
        return unavailable(err);
    }
    let guard = app.state.read().await;
    Json(guard.clone()).into_response()
}

async fn refresh_health_handler(State(app): State<HttpAppState>) -> Response {
    match app.dashboard.refresh_health().await {
        Ok(Ok(snapshot)) => Json(snapshot).into_response(),
        Ok(Err(err)) => (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({ "status": "error", "message": err.to_string() })),
        )
            .into_response(),
        Err(err) => unavailable(err),
    }
}

fn worker_response<T: serde::Serialize>(result: Result<T, DashboardError>) -> Response {
    match result {
        Ok(value) => Json(value).into_response(),
        Err(err) => unavailable(err),
    }
}

fn unavailable(err: DashboardError) -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::command::testing::ScriptedRunner;
    use crate::collectors::health::HealthClient;
    use crate::collectors::updates::UpdateClient;
    use crate::config::UtilityConfig;
    use crate::dashboard::{channel, Dashboard};
    use crate::store::HistoryStore;
    use axum::body::to_bytes;
    use axum::http::Request;
    use std::time::Duration;
    use tokio::sync::watch;
    use tower::ServiceExt;

    fn spawn_app(runner: Arc<ScriptedRunner>) -> (Router, watch::Sender<bool>) {
        let utility = UtilityConfig {
            program: "utility".to_string(),
            args: vec![],
        };
        let metrics = Metrics::new().expect("инициализация метрик");
        let state = Arc::new(RwLock::new(DashboardState::new(0)));
        let dashboard = Dashboard::new(
            UpdateClient::new(runner.clone(), utility.clone()),
            HealthClient::new(runner, utility, 80.0),
            HistoryStore::open_in_memory().expect("in-memory store"),
            state.clone(),
            metrics.clone(),
            10,
        );
        let (handle, rx) = channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(dashboard.run(rx, Duration::from_secs(3600), shutdown_rx));

        let app = build_router(HttpAppState {
            metrics,
            state,
            dashboard: handle,
            history_limit: 10,
        });
        (app, shutdown_tx)
    }

    fn runner() -> ScriptedRunner {
        ScriptedRunner::new()
            .respond("CheckUpdates", 0, "KB123\nKB456\n", "")
            .respond("GetSystemHealth", 0, "85|60|Healthy", "")
            .respond("GetDeviceConfig", 0, "16 GB|512 GB", "")
            .respond("InstallUpdates", 1, "", "install failed")
    }

    fn post_json(uri: &str, content_type: Option<&str>, body: &'static str) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri(uri);
        if let Some(content_type) = content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        builder.body(Body::from(body)).unwrap()
    }

    fn action_calls(runner: &ScriptedRunner, action: &str) -> usize {
        runner
            .calls()
            .iter()
            .filter(|args| args.iter().any(|a| a == action))
            .count()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let (app, _shutdown) = spawn_app(Arc::new(runner()));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ok");
    }

    #[tokio::test]
    async fn check_updates_returns_pending_list() {
        let (app, _shutdown) = spawn_app(Arc::new(runner()));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/updates/check")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["pending_updates"], serde_json::json!(["KB123", "KB456"]));
    }

    #[tokio::test]
    async fn failed_install_is_reported_and_logged() {
        let (app, _shutdown) = spawn_app(Arc::new(runner()));

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/updates/install")
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"updates":["KB1","KB2"]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["error"], "install failed");

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/history/updates?limit=5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(value[0]["update_name"], "KB1,KB2");
        assert_eq!(value[0]["status"], "error");
    }

    #[tokio::test]
    async fn state_reflects_periodic_refresh() {
        let (app, _shutdown) = spawn_app(Arc::new(runner()));

        // The worker refreshes once before it serves any request.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/history/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(value[0]["status"], "WARNING");

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/state")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let text = body_text(response).await;
        assert!(text.contains("\"pending_updates\":[\"KB123\",\"KB456\"]"));
        assert!(text.contains("\"status\":\"WARNING\""));
    }

    #[tokio::test]
    async fn metrics_contains_pending_updates() {
        let (app, _shutdown) = spawn_app(Arc::new(runner()));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("patchguard_pending_updates"));
    }

    #[tokio::test]
    async fn malformed_action_body_is_rejected_without_running_utility() {
        let runner = Arc::new(runner().respond("RollbackUpdates", 0, "rolled back", ""));
        let (app, _shutdown) = spawn_app(runner.clone());

        let cases = [
            (
                "/api/updates/install",
                Some("application/json"),
                r#"{"updates":"KB9"}"#,
            ),
            (
                "/api/updates/install",
                Some("application/json"),
                r#"{"update":["KB9"]}"#,
            ),
            ("/api/updates/install", Some("application/json"), r#"{"updates":["#),
            ("/api/updates/install", None, r#"{"updates":["KB9"]}"#),
            (
                "/api/updates/rollback",
                Some("application/json"),
                r#"{"updateId":"KB9"}"#,
            ),
            ("/api/updates/rollback", Some("text/plain"), r#"{"update_id":"KB9"}"#),
        ];
        for (uri, content_type, body) in cases {
            let response = app
                .clone()
                .oneshot(post_json(uri, content_type, body))
                .await
                .unwrap();
            assert!(
                response.status().is_client_error(),
                "{uri} {body}: {}",
                response.status()
            );
        }

        assert_eq!(action_calls(&runner, "InstallUpdates"), 0);
        assert_eq!(action_calls(&runner, "RollbackUpdates"), 0);
    }

    #[tokio::test]
    async fn bodyless_rollback_targets_last_update() {
        let runner = Arc::new(runner().respond("RollbackUpdates", 0, "rolled back", ""));
        let (app, _shutdown) = spawn_app(runner.clone());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/updates/rollback")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(value["status"], "success");

        let rollbacks: Vec<Vec<String>> = runner
            .calls()
            .into_iter()
            .filter(|args| args.iter().any(|a| a == "RollbackUpdates"))
            .collect();
        assert_eq!(rollbacks, vec![vec!["-Action".to_string(), "RollbackUpdates".to_string()]]);
    }
}
