use crate::wiring::Wiring;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use core::{JobOptions, JobPayload, ReadinessResponse, ServiceStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use worker::JobExecutor;

#[derive(Clone)]
pub struct AppState {
    wiring: Arc<Wiring>,
    /// Only used by `/tasks/process` (dispatcher variant); harmless to
    /// build unconditionally since it's a thin wrapper over shared Arcs.
    executor: Arc<JobExecutor>,
}

pub async fn serve(wiring: Wiring) -> core::Result<()> {
    let wiring = Arc::new(wiring);
    let executor = Arc::new(JobExecutor::new(
        wiring.queue.clone(),
        wiring.state_store.clone(),
        wiring.crawl.clone(),
        wiring.scrape.clone(),
        &wiring.config.worker,
    ));
    let state = AppState { wiring: wiring.clone(), executor };

    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any).allow_origin(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/queues/active", get(queues_active))
        .route("/tasks/process", post(tasks_process))
        .layer(ServiceBuilder::new().layer(cors))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", wiring.config.server.host, wiring.config.server.port))
        .await
        .map_err(|e| core::AppError::Internal(e.to_string()))?;

    info!(host = %wiring.config.server.host, port = wiring.config.server.port, "admin surface listening");
    axum::serve(listener, app).await.map_err(|e| core::AppError::Internal(e.to_string()))?;
    Ok(())
}

/// §6: `GET /health` → 200 "ok", plain text, no JSON envelope.
async fn health() -> &'static str {
    "ok"
}

async fn ready(State(state): State<AppState>) -> Json<ReadinessResponse> {
    let database = match state.wiring.state_store.get_job_state("__readiness_probe__").await {
        Ok(_) => "ok".to_string(),
        Err(e) if e.is_transient() => "degraded".to_string(),
        Err(_) => "ok".to_string(),
    };

    Json(ReadinessResponse {
        status: "ready".to_string(),
        services: ServiceStatus { database, cache: None, queue: Some("ok".to_string()) },
        timestamp: Utc::now(),
    })
}

/// `queuesController` health gate (§6): 503 while jobs are active, 200
/// once the queue has drained. Named `/queues/active` since the core
/// itself doesn't own the controller, only the count it needs.
async fn queues_active(State(state): State<AppState>) -> StatusCode {
    match state.wiring.queue.get_active_count().await {
        Ok(0) => StatusCode::OK,
        Ok(_) => StatusCode::SERVICE_UNAVAILABLE,
        Err(e) => {
            warn!(error = %e, "get_active_count failed during health gate");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

#[derive(Deserialize)]
struct TaskRequest {
    name: String,
    data: JobPayload,
    options: JobOptions,
}

#[derive(Serialize)]
struct TaskResponse {
    success: bool,
    job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// §6 wire contract, variant B: always replies 200, even when the job
/// itself failed, so the dispatcher never redelivers on a permanent
/// error — the real outcome lives in the State Store.
async fn tasks_process(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(task): Json<TaskRequest>,
) -> Json<TaskResponse> {
    let task_name = headers
        .get("X-CloudTasks-TaskName")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");
    info!(task_name, job_id = %task.options.job_id, "received dispatcher task");

    let job = queue::QueueJob {
        id: task.options.job_id.clone(),
        name: task.name.clone(),
        data: task.data,
        options: task.options,
        progress: serde_json::Value::from(0),
    };

    let outcome = state.executor.process(&job).await;
    Json(TaskResponse { success: outcome.success, job_id: job.id, error: outcome.error })
}
