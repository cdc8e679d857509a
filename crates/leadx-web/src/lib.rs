//! Axum JSON API for LeadX job control and the enricher proxy.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use leadx_adapters::{parse_bulk_csv, BULK_TEMPLATE_CSV};
use leadx_core::{Job, JobTarget};
use leadx_sync::{JobService, JobServiceError, RunnerConfig};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadx-web";

pub const DEFAULT_ENRICHER_BASE_URL: &str = "http://localhost:3006";
pub const ENRICHER_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum EnricherError {
    #[error("{0}")]
    Transport(#[from] reqwest::Error),
    #[error("{message}")]
    Upstream { status: u16, message: String },
}

/// Thin client for the external enricher service.
#[derive(Debug, Clone)]
pub struct EnricherClient {
    client: reqwest::Client,
    base_url: String,
}

impl EnricherClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building enricher http client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn start(&self, job: &Job) -> Result<Value, EnricherError> {
        let request = self
            .client
            .post(format!("{}/api/enrich/start", self.base_url))
            .json(&json!({ "jobId": job.id, "filePath": job.file_path }));
        self.send(request, "Failed to start enricher").await
    }

    pub async fn status(&self, job_id: &str) -> Result<Value, EnricherError> {
        let request = self
            .client
            .get(format!("{}/api/enrich/status/{job_id}", self.base_url));
        self.send(request, "Failed to fetch enricher status").await
    }

    pub async fn stop(&self, job_id: &str) -> Result<Value, EnricherError> {
        let request = self
            .client
            .post(format!("{}/api/enrich/stop/{job_id}", self.base_url));
        self.send(request, "Failed to stop enricher").await
    }

    pub async fn resume(&self, job_id: &str) -> Result<Value, EnricherError> {
        let request = self
            .client
            .post(format!("{}/api/enrich/resume/{job_id}", self.base_url));
        self.send(request, "Failed to resume enricher").await
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        default_message: &str,
    ) -> Result<Value, EnricherError> {
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::Null);
        if status.is_success() {
            return Ok(body);
        }
        let message = ["message", "error"]
            .iter()
            .find_map(|key| body.get(key).and_then(Value::as_str))
            .unwrap_or(default_message)
            .to_string();
        Err(EnricherError::Upstream {
            status: status.as_u16(),
            message,
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub jobs: JobService,
    pub enricher: EnricherClient,
}

impl AppState {
    pub fn new(jobs: JobService, enricher: EnricherClient) -> Self {
        Self { jobs, enricher }
    }
}

/// JSON `{ "message": .. }` error response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn job_not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "Job not found")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "message": self.message }))).into_response()
    }
}

impl From<JobServiceError> for ApiError {
    fn from(err: JobServiceError) -> Self {
        match err {
            JobServiceError::InvalidRequest(message) => Self::new(StatusCode::BAD_REQUEST, message),
            other => {
                warn!(error = %other, "job request failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
            }
        }
    }
}

impl From<EnricherError> for ApiError {
    fn from(err: EnricherError) -> Self {
        match err {
            EnricherError::Upstream { status, message } => Self::new(
                StatusCode::from_u16(status)
                    .ok()
                    .filter(|s| s.is_client_error() || s.is_server_error())
                    .unwrap_or(StatusCode::BAD_GATEWAY),
                message,
            ),
            EnricherError::Transport(err) => {
                warn!(error = %err, "enricher unreachable");
                Self::new(StatusCode::BAD_GATEWAY, format!("Failed to contact enricher: {err}"))
            }
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RunJobRequest {
    list_name: String,
    url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RunBulkRequest {
    list_name: String,
    csv_text: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct EnrichStartRequest {
    job_id: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs_handler))
        .route("/jobs/run", post(run_job_handler))
        .route("/jobs/run-bulk", post(run_bulk_handler))
        .route("/jobs/bulk-template", get(bulk_template_handler))
        .route("/jobs/{id}", get(get_job_handler).delete(delete_job_handler))
        .route("/jobs/{id}/stop", post(stop_job_handler))
        .route("/jobs/{id}/run", post(resume_job_handler))
        .route("/jobs/{id}/download", get(download_handler))
        .route("/enrich/start", post(enrich_start_handler))
        .route("/enrich/status/{job_id}", get(enrich_status_handler))
        .route("/enrich/stop/{job_id}", post(enrich_stop_handler))
        .route("/enrich/resume/{job_id}", post(enrich_resume_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3005);
    let enricher_base = std::env::var("ENRICHER_BASE_URL")
        .unwrap_or_else(|_| DEFAULT_ENRICHER_BASE_URL.to_string());

    let jobs = JobService::from_config(RunnerConfig::from_env()).await?;
    let enricher = EnricherClient::new(enricher_base, ENRICHER_TIMEOUT)?;
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, enricher = enricher.base_url(), "leadx api listening");
    axum::serve(listener, app(AppState::new(jobs, enricher))).await?;
    Ok(())
}

async fn list_jobs_handler(State(state): State<Arc<AppState>>) -> Json<Vec<Job>> {
    Json(state.jobs.list_jobs().await)
}

async fn run_job_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunJobRequest>,
) -> ApiResult<Json<Job>> {
    let job = state
        .jobs
        .create_job(&request.list_name, JobTarget::Single(request.url.trim().to_string()))
        .await?;
    Ok(Json(job))
}

async fn run_bulk_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunBulkRequest>,
) -> ApiResult<Json<Job>> {
    let entries = parse_bulk_csv(&request.csv_text)
        .map_err(|err| ApiError::new(StatusCode::BAD_REQUEST, err.to_string()))?;
    let job = state
        .jobs
        .create_job(&request.list_name, JobTarget::Bulk(entries))
        .await?;
    Ok(Json(job))
}

async fn bulk_template_handler() -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"bulk-template.csv\"",
            ),
        ],
        BULK_TEMPLATE_CSV,
    )
        .into_response()
}

async fn get_job_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    state
        .jobs
        .get_job(id)
        .await
        .map(Json)
        .ok_or_else(ApiError::job_not_found)
}

async fn stop_job_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    state
        .jobs
        .stop_job(id)
        .await?
        .map(Json)
        .ok_or_else(ApiError::job_not_found)
}

async fn resume_job_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    state
        .jobs
        .resume_job(id)
        .await?
        .map(Json)
        .ok_or_else(ApiError::job_not_found)
}

async fn delete_job_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let job = state
        .jobs
        .delete_job(id)
        .await?
        .ok_or_else(ApiError::job_not_found)?;
    Ok(Json(json!({ "id": job.id, "deleted": true })))
}

async fn download_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let job = state
        .jobs
        .get_job(id)
        .await
        .ok_or_else(ApiError::job_not_found)?;
    let bytes = tokio::fs::read(&job.file_path)
        .await
        .map_err(|_| ApiError::new(StatusCode::NOT_FOUND, "File not found"))?;
    let file_name = job
        .file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "leads.csv".to_string());
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

async fn enrich_start_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EnrichStartRequest>,
) -> ApiResult<Json<Value>> {
    let job_id = request.job_id.trim();
    if job_id.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "Job id is required"));
    }
    let id = Uuid::parse_str(job_id).map_err(|_| ApiError::job_not_found())?;
    let job = state
        .jobs
        .get_job(id)
        .await
        .ok_or_else(ApiError::job_not_found)?;

    info!(job_id = %job.id, file = %job.file_path.display(), "sending job file to enricher");
    let enricher = match state.enricher.start(&job).await {
        Ok(body) => body,
        Err(EnricherError::Upstream { message, .. }) => {
            return Err(ApiError::new(StatusCode::BAD_GATEWAY, message))
        }
        Err(err) => return Err(err.into()),
    };
    Ok(Json(json!({
        "jobId": job.id,
        "filePath": job.file_path,
        "enricher": enricher,
    })))
}

async fn enrich_status_handler(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Value>> {
    Ok(Json(state.enricher.status(job_id.trim()).await?))
}

async fn enrich_stop_handler(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Value>> {
    Ok(Json(state.enricher.stop(job_id.trim()).await?))
}

async fn enrich_resume_handler(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Value>> {
    Ok(Json(state.enricher.resume(job_id.trim()).await?))
}
