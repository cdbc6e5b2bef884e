//! HTTP handlers implementing the REST surface (§6).

use std::collections::BTreeSet;
use std::str::FromStr;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use cdr_engine::BatchJobRequest;
use cdr_store::JobStore;
use cdr_types::{CoreError, Job, JobId, Phase, Priority};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/jobs/batch", post(submit_batch))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/:id", get(get_job).delete(cancel_job))
        .route("/api/jobs/:id/results", get(get_job_results))
        .route("/api/health", get(health))
        .with_state(state)
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    JobId::from_str(raw).map_err(|_| ApiError::BadRequest(format!("invalid job id {raw:?}")))
}

fn phase_from_int(n: u8) -> Result<Phase, ApiError> {
    match n {
        1 => Ok(Phase::Cdr),
        2 => Ok(Phase::Av),
        3 => Ok(Phase::Edr),
        other => Err(ApiError::BadRequest(format!("unknown phase {other}; expected 1 (CDR), 2 (AV), or 3 (EDR)"))),
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchRequestBody {
    pub container_name: String,
    #[serde(default)]
    pub file_paths: Option<Vec<String>>,
    pub phases: Vec<u8>,
    #[serde(default = "default_priority")]
    pub priority: Priority,
}

fn default_priority() -> Priority {
    Priority::Normal
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub job_id: String,
    pub status: &'static str,
    pub message: String,
}

/// `POST /api/jobs/batch` (§6).
async fn submit_batch(
    State(state): State<AppState>,
    Json(body): Json<BatchRequestBody>,
) -> Result<(StatusCode, Json<BatchResponse>), ApiError> {
    if body.phases.is_empty() {
        return Err(ApiError::BadRequest("phases must not be empty".to_string()));
    }
    let mut enabled_phases = BTreeSet::new();
    for raw in &body.phases {
        enabled_phases.insert(phase_from_int(*raw)?);
    }

    let request = BatchJobRequest {
        container_name: body.container_name,
        file_paths: body.file_paths,
        enabled_phases,
        priority: body.priority,
    };

    let job_id = state.coordinator.submit(request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(BatchResponse {
            job_id: job_id.to_string(),
            status: "pending",
            message: "job accepted".to_string(),
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
}

/// `GET /api/jobs?limit=N` (§6).
async fn list_jobs(State(state): State<AppState>, Query(params): Query<ListParams>) -> Result<Json<Vec<Job>>, ApiError> {
    let limit = params.limit.unwrap_or(50);
    let jobs = state.store.list_recent_jobs(limit).await.map_err(CoreError::from)?;
    Ok(Json(jobs))
}

#[derive(Debug, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: Job,
    pub progress_percent: f64,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        let progress_percent = job.progress_percent();
        Self { job, progress_percent }
    }
}

/// `GET /api/jobs/{id}` (§6).
async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<JobView>, ApiError> {
    let job_id = parse_job_id(&id)?;
    let job = state.store.get_job(job_id).await.map_err(CoreError::from)?;
    Ok(Json(JobView::from(job)))
}

#[derive(Debug, Serialize)]
pub struct ResultsView {
    pub phase1: Vec<serde_json::Value>,
    pub phase2: Vec<serde_json::Value>,
    pub phase3: Vec<serde_json::Value>,
}

/// `GET /api/jobs/{id}/results` (§6, §7: returns whatever has been appended
/// so far, useful mid-run and post-cancel).
async fn get_job_results(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<ResultsView>, ApiError> {
    let job_id = parse_job_id(&id)?;
    state.store.get_job(job_id).await.map_err(CoreError::from)?;

    let phase1 = state.store.list_phase_results(job_id, Phase::Cdr).await.map_err(CoreError::from)?;
    let phase2 = state.store.list_phase_results(job_id, Phase::Av).await.map_err(CoreError::from)?;
    let phase3 = state.store.list_phase_results(job_id, Phase::Edr).await.map_err(CoreError::from)?;
    Ok(Json(ResultsView { phase1, phase2, phase3 }))
}

/// `DELETE /api/jobs/{id}` (§6): 404 if not found or already terminal.
async fn cancel_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    let job_id = parse_job_id(&id)?;
    let cancelled = state.coordinator.cancel(job_id).await?;
    if cancelled {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("job {job_id} not found or already terminal")))
    }
}

#[derive(Debug, Serialize)]
pub struct HealthView {
    pub status: &'static str,
    pub store_reachable: bool,
    pub vm_pool: cdr_vmpool::PoolHealth,
}

/// `GET /api/health` (§6, §10): reports whether the job store and VM pool
/// are reachable.
async fn health(State(state): State<AppState>) -> Json<HealthView> {
    let store_reachable = state.store.list_recent_jobs(1).await.is_ok();
    let vm_pool = state.vm_pool.health().await;
    let status = if store_reachable && vm_pool.is_healthy() { "ok" } else { "degraded" };
    Json(HealthView { status, store_reachable, vm_pool })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use cdr_adapters::mock::{MockAvEngine, MockBlobStore, MockCdrEngine, MockEdrConsole, MockVmBackend};
    use cdr_adapters::EdrConsole;
    use cdr_engine::{Coordinator, CoordinatorDeps};
    use cdr_store::InMemoryJobStore;
    use cdr_types::config::{PhaseConfig, PoolConfig};
    use cdr_vmpool::VmPool;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn test_state() -> AppState {
        let store: Arc<dyn cdr_store::JobStore> = Arc::new(InMemoryJobStore::new(chrono::Duration::days(7)));
        let blob_store = Arc::new(MockBlobStore::new());
        blob_store.seed("bucket", "a.pdf", b"content".to_vec());

        let vm_pool = Arc::new(VmPool::new(
            &["crowdstrike".to_string()],
            PoolConfig { pool_size: 1, ..PoolConfig::default() },
            Arc::new(MockVmBackend::new()),
        ));
        vm_pool.initialize().await;

        let deps = CoordinatorDeps {
            store: Arc::clone(&store),
            blob_store,
            cdr_engines: vec![Arc::new(MockCdrEngine::new("engine-a"))],
            av_engines: vec![Arc::new(MockAvEngine::new("defender"))],
            edr_consoles: vec![Arc::new(MockEdrConsole::new("crowdstrike")) as Arc<dyn EdrConsole>],
            vm_pool: Arc::clone(&vm_pool),
            phase1_config: PhaseConfig::default(),
            phase2_config: PhaseConfig::default(),
            phase3_config: PhaseConfig::default(),
        };
        let coordinator = Arc::new(Coordinator::new(deps));
        AppState::new(coordinator, store, vm_pool)
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn submit_batch_accepts_and_returns_a_pending_job_id() {
        let app = router(test_state().await);
        let body = serde_json::json!({
            "container_name": "bucket",
            "file_paths": ["a.pdf"],
            "phases": [1],
            "priority": "normal",
        });
        let request = Request::builder()
            .method("POST")
            .uri("/api/jobs/batch")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let value = json_body(response).await;
        assert_eq!(value["status"], "pending");
        assert!(value["job_id"].is_string());
    }

    #[tokio::test]
    async fn submit_batch_rejects_unknown_phase_numbers() {
        let app = router(test_state().await);
        let body = serde_json::json!({
            "container_name": "bucket",
            "phases": [9],
            "priority": "normal",
        });
        let request = Request::builder()
            .method("POST")
            .uri("/api/jobs/batch")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_job_404s_for_an_unknown_id() {
        let app = router(test_state().await);
        let request = Request::builder()
            .uri(format!("/api/jobs/{}", JobId::new()))
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_unknown_job_404s() {
        let app = router(test_state().await);
        let request = Request::builder()
            .method("DELETE")
            .uri(format!("/api/jobs/{}", JobId::new()))
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_reports_ok_once_the_pool_is_initialized() {
        let app = router(test_state().await);
        let request = Request::builder().uri("/api/health").body(Body::empty()).unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let value = json_body(response).await;
        assert_eq!(value["status"], "ok");
        assert_eq!(value["store_reachable"], true);
    }

    #[tokio::test]
    async fn submit_then_fetch_job_round_trips_through_the_store() {
        let app = router(test_state().await);
        let body = serde_json::json!({
            "container_name": "bucket",
            "file_paths": ["a.pdf"],
            "phases": [1],
        });
        let request = Request::builder()
            .method("POST")
            .uri("/api/jobs/batch")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let value = json_body(response).await;
        let job_id = value["job_id"].as_str().unwrap().to_string();

        let request = Request::builder().uri(format!("/api/jobs/{job_id}")).body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let job = json_body(response).await;
        assert_eq!(job["id"], job_id);
    }
}
