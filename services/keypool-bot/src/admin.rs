//! Operator API
//!
//! Runs on its own listener (default 127.0.0.1:9090) and is the only way to
//! touch the pool by hand. Not meant to be exposed beyond the host.
//!
//! Endpoints:
//! - POST   /admin/keys                  add one member `{token, age_secs?}`
//! - DELETE /admin/keys/{token}          remove one member
//! - GET    /admin/keys/sample           one random member
//! - GET    /admin/keys?start=&end=      members scored inside a window
//! - GET    /admin/schedule              every job's schedule
//! - PUT    /admin/schedule/{job}        replace a job's cron expression
//! - POST   /admin/schedule/{job}/run    fire a job now
//! - GET    /health                      pool summary
//! - GET    /metrics                     Prometheus exposition

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use key_pool::{ACQUIRE_JOB, EvictionReason, PoolManager, Reconciler, Scheduler};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tracing::{info, warn};

use crate::metrics::record_admin_request;

/// Shared state for admin handlers.
#[derive(Clone)]
pub struct AdminState {
    manager: Arc<PoolManager>,
    scheduler: Arc<Scheduler>,
    prometheus: PrometheusHandle,
    /// Retimed when the acquire job is rescheduled
    push_window: Option<Arc<Reconciler>>,
}

impl AdminState {
    pub fn new(
        manager: Arc<PoolManager>,
        scheduler: Arc<Scheduler>,
        prometheus: PrometheusHandle,
    ) -> Self {
        Self {
            manager,
            scheduler,
            prometheus,
            push_window: None,
        }
    }

    /// Keep `reconciler`'s push window in step with the acquire schedule.
    pub fn with_push_window(mut self, reconciler: Arc<Reconciler>) -> Self {
        self.push_window = Some(reconciler);
        self
    }
}

/// Build the admin router. `max_connections` caps concurrent requests.
pub fn build_admin_router(state: AdminState, max_connections: usize) -> Router {
    Router::new()
        .route("/admin/keys", post(add_key).get(list_keys))
        .route("/admin/keys/sample", get(sample_key))
        .route("/admin/keys/{token}", axum::routing::delete(remove_key))
        .route("/admin/schedule", get(list_schedule))
        .route("/admin/schedule/{job}", put(update_schedule))
        .route("/admin/schedule/{job}/run", post(run_job))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

type JsonReply = (
    StatusCode,
    [(axum::http::header::HeaderName, &'static str); 1],
    String,
);

fn reply(route: &'static str, status: StatusCode, body: serde_json::Value) -> JsonReply {
    record_admin_request(route, status.as_u16());
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

#[derive(Deserialize)]
struct AddKeyRequest {
    token: String,
    /// How long ago the key was obtained; 0 when omitted
    #[serde(default)]
    age_secs: u64,
}

/// POST /admin/keys
async fn add_key(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<AddKeyRequest>,
) -> impl IntoResponse {
    let fingerprint = common::fingerprint(body.token.trim());
    match state
        .manager
        .admit(&body.token, Duration::from_secs(body.age_secs))
        .await
    {
        Ok(admission) => {
            info!(token = %fingerprint, outcome = admission.label(), "operator added key");
            reply(
                "keys_add",
                StatusCode::OK,
                serde_json::json!({ "status": admission }),
            )
        }
        Err(e @ key_pool::Error::InvalidToken(_)) => reply(
            "keys_add",
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": e.to_string() }),
        ),
        Err(e) => {
            warn!(token = %fingerprint, error = %e, "operator add failed");
            reply(
                "keys_add",
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": e.to_string() }),
            )
        }
    }
}

/// DELETE /admin/keys/{token}
async fn remove_key(
    State(state): State<AdminState>,
    Path(token): Path<String>,
) -> impl IntoResponse {
    match state
        .manager
        .evict(std::slice::from_ref(&token), EvictionReason::Operator)
        .await
    {
        Ok(removed) => {
            info!(token = %common::fingerprint(&token), removed, "operator removed key");
            reply(
                "keys_remove",
                StatusCode::OK,
                serde_json::json!({ "removed": removed }),
            )
        }
        Err(e) => {
            warn!(token = %common::fingerprint(&token), error = %e, "operator remove failed");
            reply(
                "keys_remove",
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": e.to_string() }),
            )
        }
    }
}

/// GET /admin/keys/sample
async fn sample_key(State(state): State<AdminState>) -> impl IntoResponse {
    match state.manager.sample().await {
        Some(token) => reply(
            "keys_sample",
            StatusCode::OK,
            serde_json::json!({ "token": token }),
        ),
        None => reply(
            "keys_sample",
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": "pool is empty" }),
        ),
    }
}

#[derive(Deserialize)]
struct WindowQuery {
    start: Option<u64>,
    end: Option<u64>,
}

/// GET /admin/keys?start=&end=
///
/// Bounds are unix seconds, inclusive. `start` defaults to one TTL ago and
/// `end` is open when omitted.
async fn list_keys(
    State(state): State<AdminState>,
    Query(window): Query<WindowQuery>,
) -> impl IntoResponse {
    let keys = state.manager.list_in_window(window.start, window.end).await;
    reply("keys_list", StatusCode::OK, serde_json::json!({ "keys": keys }))
}

/// GET /admin/schedule
async fn list_schedule(State(state): State<AdminState>) -> impl IntoResponse {
    let jobs = state.scheduler.info().await;
    reply(
        "schedule_list",
        StatusCode::OK,
        serde_json::json!({ "jobs": jobs }),
    )
}

#[derive(Deserialize)]
struct RescheduleRequest {
    expression: String,
}

fn schedule_error_status(e: &key_pool::Error) -> StatusCode {
    match e {
        key_pool::Error::InvalidExpression { .. } => StatusCode::BAD_REQUEST,
        key_pool::Error::UnknownJob(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// PUT /admin/schedule/{job}
async fn update_schedule(
    State(state): State<AdminState>,
    Path(job): Path<String>,
    axum::Json(body): axum::Json<RescheduleRequest>,
) -> impl IntoResponse {
    match state.scheduler.reschedule(&job, &body.expression).await {
        Ok(info) => {
            if let Some(reconciler) = state.push_window.as_ref().filter(|_| job == ACQUIRE_JOB) {
                match key_pool::fire_spacing(&body.expression) {
                    Ok(Some(spacing)) => reconciler.set_acquire_interval(spacing),
                    _ => warn!(job, "acquire schedule has no spacing, push window unchanged"),
                }
            }
            reply(
                "schedule_update",
                StatusCode::OK,
                serde_json::to_value(&info).unwrap_or_default(),
            )
        }
        Err(e) => {
            warn!(job, error = %e, "reschedule rejected");
            reply(
                "schedule_update",
                schedule_error_status(&e),
                serde_json::json!({ "error": e.to_string() }),
            )
        }
    }
}

/// POST /admin/schedule/{job}/run
async fn run_job(State(state): State<AdminState>, Path(job): Path<String>) -> impl IntoResponse {
    match state.scheduler.trigger(&job).await {
        Ok(dispatched) => reply(
            "schedule_run",
            StatusCode::OK,
            serde_json::json!({ "dispatched": dispatched }),
        ),
        Err(e) => reply(
            "schedule_run",
            schedule_error_status(&e),
            serde_json::json!({ "error": e.to_string() }),
        ),
    }
}

/// GET /health: 200 while the pool has a current member, 503 when empty.
async fn health_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let health = state.manager.health().await;
    let status = if health["status"] == "healthy" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        health.to_string(),
    )
}

async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use key_pool::{AcquireJob, ManualClock, MirrorLayout, PoolStore, ValidateJob};
    use tower::ServiceExt;
    use upstream::{LogNotifier, MemoryMirror, NoopSource, StaticValidator, Verdict};

    const START: u64 = 1_700_000_000;
    const TTL: u64 = 241_920;

    struct Harness {
        state: AdminState,
        manager: Arc<PoolManager>,
        clock: Arc<ManualClock>,
        _dir: tempfile::TempDir,
    }

    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(START));
        let store = PoolStore::load(
            dir.path().join("pool.json"),
            Duration::from_secs(TTL),
            clock.clone(),
        )
        .await
        .unwrap();
        let validator = Arc::new(StaticValidator::new(Verdict::Live));
        let manager = Arc::new(PoolManager::new(store, validator));
        let scheduler = Arc::new(Scheduler::new(Arc::new(LogNotifier)));
        scheduler
            .add_job(
                key_pool::VALIDATE_JOB,
                "*/10 * * * *",
                Arc::new(ValidateJob::new(manager.clone())),
            )
            .await
            .unwrap();

        Harness {
            state: AdminState::new(manager.clone(), scheduler, test_prometheus_handle()),
            manager,
            clock,
            _dir: dir,
        }
    }

    async fn send(state: &AdminState, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let app = build_admin_router(state.clone(), 16);
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn add_key_inserts_then_refreshes() {
        let h = harness().await;

        let (status, json) = send(
            &h.state,
            json_request("POST", "/admin/keys", serde_json::json!({ "token": "sk-one" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "inserted");

        let (status, json) = send(
            &h.state,
            json_request(
                "POST",
                "/admin/keys",
                serde_json::json!({ "token": "sk-one", "age_secs": 3600 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "refreshed");
        assert!(h.manager.exists("sk-one").await);
    }

    #[tokio::test]
    async fn add_key_too_stale_is_not_stored() {
        let h = harness().await;
        let (status, json) = send(
            &h.state,
            json_request(
                "POST",
                "/admin/keys",
                serde_json::json!({ "token": "sk-old", "age_secs": TTL }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "too_stale");
        assert!(!h.manager.exists("sk-old").await);
    }

    #[tokio::test]
    async fn add_key_rejects_malformed_token() {
        let h = harness().await;
        let (status, json) = send(
            &h.state,
            json_request("POST", "/admin/keys", serde_json::json!({ "token": "sk a b" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("invalid token"));
    }

    #[tokio::test]
    async fn remove_key_reports_count() {
        let h = harness().await;
        h.manager.admit("sk-gone", Duration::ZERO).await.unwrap();

        let request = Request::builder()
            .method("DELETE")
            .uri("/admin/keys/sk-gone")
            .body(Body::empty())
            .unwrap();
        let (status, json) = send(&h.state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["removed"], 1);

        let request = Request::builder()
            .method("DELETE")
            .uri("/admin/keys/sk-gone")
            .body(Body::empty())
            .unwrap();
        let (_, json) = send(&h.state, request).await;
        assert_eq!(json["removed"], 0);
    }

    #[tokio::test]
    async fn sample_on_empty_pool_is_not_found() {
        let h = harness().await;
        let (status, _) = send(&h.state, get_request("/admin/keys/sample")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        h.manager.admit("sk-only", Duration::ZERO).await.unwrap();
        let (status, json) = send(&h.state, get_request("/admin/keys/sample")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["token"], "sk-only");
    }

    #[tokio::test]
    async fn list_keys_honors_window() {
        let h = harness().await;
        h.manager
            .admit("sk-older", Duration::from_secs(7200))
            .await
            .unwrap();
        h.manager.admit("sk-newer", Duration::ZERO).await.unwrap();

        let (status, json) = send(&h.state, get_request("/admin/keys")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["keys"], serde_json::json!(["sk-older", "sk-newer"]));

        let uri = format!("/admin/keys?start={}&end={}", START - 7200, START - 3600);
        let (_, json) = send(&h.state, get_request(&uri)).await;
        assert_eq!(json["keys"], serde_json::json!(["sk-older"]));
    }

    #[tokio::test]
    async fn schedule_listing_and_update() {
        let h = harness().await;

        let (status, json) = send(&h.state, get_request("/admin/schedule")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["jobs"][0]["name"], "validate");
        assert_eq!(json["jobs"][0]["expression"], "*/10 * * * *");

        let (status, json) = send(
            &h.state,
            json_request(
                "PUT",
                "/admin/schedule/validate",
                serde_json::json!({ "expression": "*/5 * * * *" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["expression"], "*/5 * * * *");
        assert!(json["next_run"].is_string());
    }

    #[tokio::test]
    async fn acquire_reschedule_moves_push_window() {
        let h = harness().await;
        h.state
            .scheduler
            .add_job(
                ACQUIRE_JOB,
                "0 * * * *",
                Arc::new(AcquireJob::new(h.manager.clone(), Arc::new(NoopSource), 1)),
            )
            .await
            .unwrap();
        let reconciler = Arc::new(Reconciler::new(
            h.manager.clone(),
            Arc::new(MemoryMirror::new()),
            MirrorLayout::default(),
            Duration::from_secs(3_600),
        ));
        let state = h.state.clone().with_push_window(reconciler.clone());

        let (status, _) = send(
            &state,
            json_request(
                "PUT",
                "/admin/schedule/validate",
                serde_json::json!({ "expression": "*/5 * * * *" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reconciler.acquire_interval(), Duration::from_secs(3_600));

        let (status, _) = send(
            &state,
            json_request(
                "PUT",
                "/admin/schedule/acquire",
                serde_json::json!({ "expression": "*/20 * * * *" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reconciler.acquire_interval(), Duration::from_secs(1_200));

        // A rejected expression leaves the window alone
        let (status, _) = send(
            &state,
            json_request(
                "PUT",
                "/admin/schedule/acquire",
                serde_json::json!({ "expression": "never" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(reconciler.acquire_interval(), Duration::from_secs(1_200));
    }

    #[tokio::test]
    async fn schedule_update_errors_map_to_status() {
        let h = harness().await;

        let (status, _) = send(
            &h.state,
            json_request(
                "PUT",
                "/admin/schedule/validate",
                serde_json::json!({ "expression": "every tuesday" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &h.state,
            json_request(
                "PUT",
                "/admin/schedule/nope",
                serde_json::json!({ "expression": "*/5 * * * *" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // Rejected update leaves the old expression in place
        let (_, json) = send(&h.state, get_request("/admin/schedule")).await;
        assert_eq!(json["jobs"][0]["expression"], "*/10 * * * *");
    }

    #[tokio::test]
    async fn run_job_dispatches() {
        let h = harness().await;
        let request = Request::builder()
            .method("POST")
            .uri("/admin/schedule/validate/run")
            .body(Body::empty())
            .unwrap();
        let (status, json) = send(&h.state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["dispatched"], true);

        let request = Request::builder()
            .method("POST")
            .uri("/admin/schedule/unknown/run")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&h.state, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_reflects_pool_contents() {
        let h = harness().await;
        let (status, json) = send(&h.state, get_request("/health")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "empty");

        h.manager.admit("sk-fresh", Duration::ZERO).await.unwrap();
        let (status, json) = send(&h.state, get_request("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["members_current"], 1);

        // Past the TTL the member no longer counts as current
        h.clock.advance(Duration::from_secs(TTL + 1));
        let (status, _) = send(&h.state, get_request("/health")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_text() {
        let h = harness().await;
        let app = build_admin_router(h.state.clone(), 16);
        let response = app.oneshot(get_request("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/plain; version=0.0.4; charset=utf-8"
        );
    }
}
