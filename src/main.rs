mod automation;
mod catalog;
mod config;
mod http;
mod idempotency;
mod jobs;
mod metrics;
mod models;
mod procedures;
mod queue;
mod quota;
mod scheduler;
mod security;
mod session;
mod store;

use automation::{AutomationDriver, RemoteDriver, SimulatedDriver};
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Extension, Path, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use catalog::{Catalog, CatalogError, CatalogSeed, MemoryCatalog};
use config::{AutomationBackend, ServiceConfig};
use idempotency::IdempotencyCache;
use jobs::{JobError, JobRunner};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, JobRequest, TaskKind, TaskRecord};
use procedures::Procedures;
use quota::{QuotaSnapshot, QuotaTracker};
use scheduler::{ScheduleEntry, ScheduleError, Scheduler};
use security::{AuthContext, AuthState, require_api_auth};
use serde::{Deserialize, Serialize};
use serde_json::json;
use session::SessionPool;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use store::{MemoryScheduleStore, MemoryTaskStore, RedisScheduleStore, ScheduleStore};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "fleet.api", "server crashed: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    init_tracing();

    let config = ServiceConfig::from_env()?;
    let seed = match &config.seed_path {
        Some(path) => CatalogSeed::load(path)?,
        None => {
            warn!(target = "fleet.api", "FLEET_SEED not set; starting with an empty catalog");
            CatalogSeed::default()
        }
    };
    let catalog: Arc<dyn Catalog> =
        Arc::new(MemoryCatalog::from_seed(seed, config.default_daily_limit));
    let idempotency = IdempotencyCache::new(
        config.redis_url.as_deref(),
        Duration::from_secs(config.idempotency_ttl_secs),
    )?;
    let schedules: Arc<dyn ScheduleStore> = match config.redis_url.as_deref() {
        Some(url) => Arc::new(RedisScheduleStore::new(url)?),
        None => Arc::new(MemoryScheduleStore::new()),
    };
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| eyre::eyre!("prometheus recorder: {err}"))?;

    let state = AppState::assemble(
        &config,
        catalog,
        automation_driver(&config),
        schedules,
        idempotency,
        prometheus_handle,
    );
    if let Err(err) = state.scheduler.restore(chrono::Local::now()).await {
        warn!(target = "fleet.api", error = %err, "schedules not restored; starting without them");
    }
    let auth_state = AuthState::new(
        config.api_keys.as_deref(),
        config.rate_limit_per_sec,
        config.rate_limit_capacity,
    );

    let shutdown = CancellationToken::new();
    let scheduler_task = state.scheduler.clone().spawn(shutdown.clone());
    let app = build_router(state, auth_state, config.request_max_bytes);

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    let driver = match config.automation {
        AutomationBackend::Simulated { .. } => "simulated",
        AutomationBackend::Remote { .. } => "remote",
    };
    info!(
        target = "fleet.api",
        pool = config.session_pool_size,
        driver,
        "listening on {addr}"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    shutdown.cancel();
    if let Err(err) = scheduler_task.await {
        warn!(target = "fleet.api", error = %err, "scheduler task ended abnormally");
    }
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                error!(target = "fleet.api", error = %err, "failed to listen for ctrl-c");
            }
            info!(target = "fleet.api", "shutdown requested");
        }
    }
}

fn automation_driver(config: &ServiceConfig) -> Arc<dyn AutomationDriver> {
    match &config.automation {
        AutomationBackend::Simulated {
            success_rate,
            latency_ms,
        } => Arc::new(SimulatedDriver::new(
            *success_rate,
            Duration::from_millis(*latency_ms),
        )),
        AutomationBackend::Remote { base_url } => Arc::new(RemoteDriver::new(base_url)),
    }
}

#[derive(Clone)]
struct AppState {
    runner: JobRunner,
    scheduler: Scheduler,
    quota: QuotaTracker,
    catalog: Arc<dyn Catalog>,
    sessions: SessionPool,
    idempotency: Arc<IdempotencyCache>,
    prometheus_handle: PrometheusHandle,
    metrics_key: Option<String>,
}

impl AppState {
    fn assemble(
        config: &ServiceConfig,
        catalog: Arc<dyn Catalog>,
        driver: Arc<dyn AutomationDriver>,
        schedules: Arc<dyn ScheduleStore>,
        idempotency: IdempotencyCache,
        prometheus_handle: PrometheusHandle,
    ) -> Self {
        let sessions = SessionPool::new(driver, config.session_pool_size, config.step_timeout());
        let quota = QuotaTracker::new(catalog.clone());
        let procedures = Procedures::new(catalog.clone(), quota.clone(), sessions.clone());
        let runner = JobRunner::new(
            Arc::new(MemoryTaskStore::new()),
            procedures,
            config.runner_settings(),
        );
        let scheduler = Scheduler::new(runner.clone(), schedules, config.scheduler_tick());
        Self {
            runner,
            scheduler,
            quota,
            catalog,
            sessions,
            idempotency: Arc::new(idempotency),
            prometheus_handle,
            metrics_key: config.metrics_key.clone(),
        }
    }
}

fn build_router(state: AppState, auth_state: AuthState, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/jobs", post(start_job).get(list_jobs))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/schedules", get(list_schedules))
        .route("/schedules/{kind}", put(set_schedule))
        .route("/accounts", get(list_accounts))
        .route("/accounts/quota/reset", post(reset_quota))
        .route("/accounts/{id}/publish-count", post(add_publish_count))
        .route("/publish-queue", get(publish_queue))
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
}

/// Liveness plus session pool occupancy. No auth.
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "fleetd",
        "sessions": {
            "size": state.sessions.size(),
            "available": state.sessions.available(),
            "created": state.sessions.created(),
        },
    }))
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = &state.metrics_key {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct StartedJob {
    job_id: Uuid,
    replayed: bool,
}

/// Start a job.
///
/// - Method: `POST`
/// - Path: `/jobs`
/// - Auth: `Authorization: Bearer <key>` or `X-Fleet-Key: <key>`
/// - Body: `JobRequest` tagged by `kind`
/// - Response: `202` with the new job id, `409` when the same kind is
///   already running for the caller. An `Idempotency-Key` header replays
///   the id of an earlier start with `200`.
async fn start_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    headers: HeaderMap,
    payload: Result<Json<JobRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<StartedJob>), AppError> {
    crate::metrics::inc_requests("/jobs");
    let Json(request) = payload.map_err(|err| AppError::Validation(err.body_text()))?;

    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    if let Some(key) = &idempotency_key
        && let Some(existing) = state.idempotency.lookup(&context.owner, key).await
    {
        return Ok((
            StatusCode::OK,
            Json(StartedJob {
                job_id: existing,
                replayed: true,
            }),
        ));
    }

    let kind = request.payload.kind();
    let id = state.runner.start(&context.owner, request).await?;
    if let Some(key) = &idempotency_key {
        state.idempotency.remember(&context.owner, key, id).await;
    }
    info!(
        target = "fleet.api",
        owner = %context.owner,
        api_key = %context.api_key_id,
        kind = %kind,
        job_id = %id,
        "job accepted",
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(StartedJob {
            job_id: id,
            replayed: false,
        }),
    ))
}

async fn list_jobs(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Json<Vec<TaskRecord>> {
    crate::metrics::inc_requests("/jobs");
    Json(state.runner.list(&context.owner).await)
}

async fn get_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<TaskRecord>, AppError> {
    crate::metrics::inc_requests("/jobs/{id}");
    let id = parse_job_id(&id)?;
    Ok(Json(state.runner.status(&context.owner, id).await?))
}

async fn cancel_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<TaskRecord>), AppError> {
    crate::metrics::inc_requests("/jobs/{id}/cancel");
    let id = parse_job_id(&id)?;
    let record = state.runner.cancel(&context.owner, id).await?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

fn parse_job_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::Validation(format!("`{raw}` is not a job id")))
}

async fn list_schedules(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Result<Json<Vec<ScheduleEntry>>, AppError> {
    crate::metrics::inc_requests("/schedules");
    Ok(Json(state.scheduler.entries(&context.owner).await?))
}

#[derive(Debug, Deserialize)]
struct ScheduleRequest {
    #[serde(default = "enabled_by_default")]
    enabled: bool,
    #[serde(default)]
    product_ids: Vec<String>,
    #[serde(default)]
    at: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct ScheduleResponse {
    kind: TaskKind,
    enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    entry: Option<ScheduleEntry>,
}

async fn set_schedule(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(kind): Path<String>,
    payload: Result<Json<ScheduleRequest>, JsonRejection>,
) -> Result<Json<ScheduleResponse>, AppError> {
    crate::metrics::inc_requests("/schedules/{kind}");
    let kind: TaskKind = kind
        .parse::<TaskKind>()
        .map_err(|err| AppError::Validation(err.to_string()))?;
    let Json(request) = payload.map_err(|err| AppError::Validation(err.body_text()))?;
    let entry = state
        .scheduler
        .set(
            &context.owner,
            kind,
            request.enabled,
            request.product_ids,
            request.at.as_deref(),
        )
        .await?;
    Ok(Json(ScheduleResponse {
        kind,
        enabled: entry.is_some(),
        entry,
    }))
}

async fn list_accounts(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Json<Vec<QuotaSnapshot>> {
    crate::metrics::inc_requests("/accounts");
    Json(state.quota.snapshots(&context.owner).await)
}

async fn reset_quota(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Json<serde_json::Value> {
    crate::metrics::inc_requests("/accounts/quota/reset");
    let reset = state.quota.reset_all(&context.owner).await;
    Json(json!({ "reset": reset }))
}

#[derive(Debug, Deserialize)]
struct PublishCountRequest {
    #[serde(default = "one")]
    count: u32,
}

fn one() -> u32 {
    1
}

async fn add_publish_count(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(account_id): Path<String>,
    payload: Result<Json<PublishCountRequest>, JsonRejection>,
) -> Result<Json<QuotaSnapshot>, AppError> {
    crate::metrics::inc_requests("/accounts/{id}/publish-count");
    let Json(request) = payload.map_err(|err| AppError::Validation(err.body_text()))?;
    if request.count == 0 {
        return Err(AppError::Validation("count must be positive".into()));
    }
    let snapshot = state
        .quota
        .increment(&context.owner, &account_id, request.count)
        .await?;
    Ok(Json(snapshot))
}

async fn publish_queue(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Json<Vec<queue::QueueEntry>> {
    crate::metrics::inc_requests("/publish-queue");
    Json(queue::build_queue(state.catalog.as_ref(), &context.owner).await)
}

#[derive(Debug)]
enum AppError {
    Validation(String),
    Job(JobError),
    Schedule(ScheduleError),
    Catalog(CatalogError),
}

impl From<JobError> for AppError {
    fn from(value: JobError) -> Self {
        Self::Job(value)
    }
}

impl From<ScheduleError> for AppError {
    fn from(value: ScheduleError) -> Self {
        Self::Schedule(value)
    }
}

impl From<CatalogError> for AppError {
    fn from(value: CatalogError) -> Self {
        Self::Catalog(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, detail) = match &self {
            AppError::Validation(detail) => {
                (StatusCode::BAD_REQUEST, "validation", detail.clone())
            }
            AppError::Job(err) => {
                let (status, code) = match err {
                    JobError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
                    JobError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                    JobError::Conflict { .. } => (StatusCode::CONFLICT, "conflict"),
                    JobError::AlreadyFinished(_) => (StatusCode::CONFLICT, "already_finished"),
                    JobError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store_unavailable"),
                };
                (status, code, err.to_string())
            }
            AppError::Schedule(ScheduleError::Store(err)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "store_unavailable",
                err.to_string(),
            ),
            AppError::Schedule(err) => (StatusCode::BAD_REQUEST, "validation", err.to_string()),
            AppError::Catalog(err) => (StatusCode::NOT_FOUND, "not_found", err.to_string()),
        };
        if status.is_server_error() {
            error!(target = "fleet.api", error = %detail, "request failed");
        }
        let payload = ApiError {
            error: code.to_string(),
            detail: Some(detail),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::testing::ScriptedDriver;
    use crate::catalog::fixtures::{account, product};
    use crate::models::TaskStatus;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    fn app_with(driver: ScriptedDriver) -> Router {
        let config = ServiceConfig {
            item_delay_min_ms: 0,
            item_delay_max_ms: 0,
            session_pool_size: 1,
            ..ServiceConfig::default()
        };
        let seed = CatalogSeed {
            accounts: vec![account("a1", "alice", 20, 20), account("a2", "alice", 3, 3)],
            products: vec![
                product("p1", "alice", "a2", 1),
                product("p2", "alice", "a2", 2),
                product("p3", "alice", "a1", 3),
            ],
            orders: vec![],
        };
        let catalog: Arc<dyn Catalog> = Arc::new(MemoryCatalog::from_seed(seed, 20));
        let state = AppState::assemble(
            &config,
            catalog,
            Arc::new(driver),
            Arc::new(MemoryScheduleStore::new()),
            IdempotencyCache::in_memory(Duration::from_secs(60)),
            PrometheusBuilder::new().build_recorder().handle(),
        );
        let auth = AuthState::new(Some("alice:k-alice,bob:k-bob"), 1000.0, 1000.0);
        build_router(state, auth, 64 * 1024)
    }

    fn app() -> Router {
        app_with(ScriptedDriver::new())
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        key: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            builder = builder.header("X-Fleet-Key", key);
        }
        let body = match body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(builder.body(body).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn wait_finished(app: &Router, key: &str, id: &str) -> Value {
        for _ in 0..500 {
            let (status, record) = call(app, "GET", &format!("/jobs/{id}"), Some(key), None).await;
            assert_eq!(status, StatusCode::OK);
            if record["status"] != "running" {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} did not finish");
    }

    #[tokio::test]
    async fn protected_routes_require_a_key() {
        let app = app();
        let (status, body) = call(&app, "GET", "/jobs", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "missing_api_key");

        let (status, _) = call(&app, "GET", "/jobs", Some("nope"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = call(&app, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sessions"]["size"], 1);
    }

    #[tokio::test]
    async fn started_job_is_pollable_by_its_owner_only() {
        let app = app();
        let (status, started) = call(
            &app,
            "POST",
            "/jobs",
            Some("k-alice"),
            Some(json!({"kind": "polish", "product_ids": ["p1", "p2"]})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let id = started["job_id"].as_str().expect("job id").to_string();

        let record = wait_finished(&app, "k-alice", &id).await;
        assert_eq!(record["status"], "completed");
        assert_eq!(record["progress"], 100);
        assert_eq!(record["results"].as_array().map(Vec::len), Some(2));

        let (status, body) = call(&app, "GET", &format!("/jobs/{id}"), Some("k-bob"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");

        let (_, listed) = call(&app, "GET", "/jobs", Some("k-bob"), None).await;
        assert_eq!(listed, json!([]));
    }

    #[tokio::test]
    async fn duplicate_running_job_is_a_conflict() {
        let app = app_with(ScriptedDriver::new().with_latency(Duration::from_millis(100)));
        let request = json!({"kind": "daily_tasks"});
        let (first, started) =
            call(&app, "POST", "/jobs", Some("k-alice"), Some(request.clone())).await;
        assert_eq!(first, StatusCode::ACCEPTED);
        let (second, body) = call(&app, "POST", "/jobs", Some("k-alice"), Some(request)).await;
        assert_eq!(second, StatusCode::CONFLICT);
        assert_eq!(body["error"], "conflict");
        let id = started["job_id"].as_str().expect("job id");
        assert!(body["detail"].as_str().unwrap_or("").contains(id));
        wait_finished(&app, "k-alice", id).await;
    }

    #[tokio::test]
    async fn idempotency_key_replays_the_first_start() {
        let app = app();
        let send = |key: &'static str| {
            let app = app.clone();
            async move {
                let request = Request::builder()
                    .method("POST")
                    .uri("/jobs")
                    .header("X-Fleet-Key", "k-alice")
                    .header("Idempotency-Key", key)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"kind":"polish","product_ids":["p1"]}"#))
                    .expect("request");
                let response = app.oneshot(request).await.expect("response");
                let status = response.status();
                let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
                (status, serde_json::from_slice::<Value>(&bytes).expect("json"))
            }
        };
        let (first_status, first) = send("req-1").await;
        assert_eq!(first_status, StatusCode::ACCEPTED);
        let (replay_status, replay) = send("req-1").await;
        assert_eq!(replay_status, StatusCode::OK);
        assert_eq!(replay["job_id"], first["job_id"]);
        assert_eq!(replay["replayed"], true);
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_up_front() {
        let app = app();
        let (status, body) = call(
            &app,
            "POST",
            "/jobs",
            Some("k-alice"),
            Some(json!({"kind": "refund"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation");

        let (status, _) = call(
            &app,
            "POST",
            "/jobs",
            Some("k-alice"),
            Some(json!({"kind": "polish", "product_ids": []})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, "GET", "/jobs/not-a-uuid", Some("k-alice"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn finished_job_cannot_be_cancelled() {
        let app = app();
        let (_, started) = call(
            &app,
            "POST",
            "/jobs",
            Some("k-alice"),
            Some(json!({"kind": "polish", "product_ids": ["p1"]})),
        )
        .await;
        let id = started["job_id"].as_str().expect("job id");
        let record = wait_finished(&app, "k-alice", id).await;
        assert_eq!(record["status"], "completed");

        let (status, body) = call(
            &app,
            "POST",
            &format!("/jobs/{id}/cancel"),
            Some("k-alice"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "already_finished");
    }

    #[tokio::test]
    async fn quota_routes_report_and_mutate_counters() {
        let app = app();
        let (_, queue) = call(&app, "GET", "/publish-queue", Some("k-alice"), None).await;
        let accounts: Vec<&str> = queue
            .as_array()
            .expect("queue")
            .iter()
            .filter_map(|entry| entry["account_id"].as_str())
            .collect();
        assert_eq!(accounts, vec!["a2"]);
        assert_eq!(queue[0]["products"].as_array().map(Vec::len), Some(2));

        let (status, snapshot) = call(
            &app,
            "POST",
            "/accounts/a2/publish-count",
            Some("k-alice"),
            Some(json!({"count": 2})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(snapshot["today_published"], 5);
        assert_eq!(snapshot["remaining"], 15);

        let (status, _) = call(
            &app,
            "POST",
            "/accounts/a2/publish-count",
            Some("k-bob"),
            Some(json!({"count": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, reset) = call(&app, "POST", "/accounts/quota/reset", Some("k-alice"), None).await;
        assert_eq!(reset["reset"], 2);
        let (_, accounts) = call(&app, "GET", "/accounts", Some("k-alice"), None).await;
        let totals: Vec<(u64, u64)> = accounts
            .as_array()
            .expect("accounts")
            .iter()
            .map(|a| {
                (
                    a["today_published"].as_u64().unwrap_or(99),
                    a["total_published"].as_u64().unwrap_or(0),
                )
            })
            .collect();
        assert_eq!(totals, vec![(0, 20), (0, 5)]);
    }

    #[tokio::test]
    async fn schedules_can_be_set_listed_and_disabled() {
        let app = app();
        let (status, body) = call(
            &app,
            "PUT",
            "/schedules/midnight-polish",
            Some("k-alice"),
            Some(json!({"product_ids": ["p1"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["enabled"], true);
        assert_eq!(body["entry"]["fire"]["at"], "00:00:00");

        let (status, _) = call(
            &app,
            "PUT",
            "/schedules/publish",
            Some("k-alice"),
            Some(json!({"product_ids": ["p1"]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, listed) = call(&app, "GET", "/schedules", Some("k-alice"), None).await;
        assert_eq!(listed.as_array().map(Vec::len), Some(1));

        let (_, body) = call(
            &app,
            "PUT",
            "/schedules/midnight_polish",
            Some("k-alice"),
            Some(json!({"enabled": false})),
        )
        .await;
        assert_eq!(body["enabled"], false);
        let (_, listed) = call(&app, "GET", "/schedules", Some("k-alice"), None).await;
        assert_eq!(listed, json!([]));
    }

    #[tokio::test]
    async fn published_job_result_carries_listing_id() {
        let app = app();
        let (_, started) = call(
            &app,
            "POST",
            "/jobs",
            Some("k-alice"),
            Some(json!({"kind": "publish", "product_ids": ["p1", "p3"], "region": "beijing"})),
        )
        .await;
        let id = started["job_id"].as_str().expect("job id");
        let record = wait_finished(&app, "k-alice", id).await;
        let status: TaskStatus =
            serde_json::from_value(record["status"].clone()).expect("status");
        assert_eq!(status, TaskStatus::Completed);
        assert_eq!(record["results"][0]["derived_id"], "listing-1");
        assert_eq!(record["results"][1]["reason"], "quota_exhausted");
    }
}
