//! REST API (§6.1, §6.1a): the hub's only operator-facing surface.
//!
//! An `axum` router over shared `Arc<HubState>` state, in the same spirit
//! as a hand-rolled REST layer but without a bespoke schema macro: axum's
//! extractors cover the same ground with far less machinery for a crate
//! this size (§9).

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::error;
use serde::{Deserialize, Serialize};

use vbr_api_types::{BackupChain, BackupJob, BackupType, CompletionRequest, CoreError, JobId, JobStatus, TelemetryUpdate, VmContextId};

use crate::state::HubState;

pub fn router(state: Arc<HubState>) -> Router {
    Router::new()
        .route("/backups", post(start_backup).get(list_backups))
        .route("/backups/:id", get(get_backup).delete(delete_backup))
        .route("/backups/:vm_name/chain", get(get_chain_view))
        .route("/backups/:id/complete", post(complete_backup))
        .route("/telemetry/backup/:id", post(ingest_telemetry))
        .route("/healthz", get(healthz))
        .route("/metrics/ports", get(port_metrics))
        .route("/metrics/qemu", get(qemu_metrics))
        .with_state(state)
}

/// Thin wrapper so `CoreError` and catalog `anyhow::Error`s both get a
/// status code and a JSON body without every handler writing its own match.
struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorBody { error: self.1 })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        let status = match &e {
            CoreError::ConfigMissing { .. } | CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::CredentialMissing { .. } => StatusCode::BAD_REQUEST,
            CoreError::VmInFailover { .. } | CoreError::ChainMissing { .. } | CoreError::DuplicateBackup { .. } => {
                StatusCode::CONFLICT
            }
            CoreError::PortsExhausted { .. } | CoreError::RepoFull { .. } | CoreError::TunnelUnavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            CoreError::QemuStart { .. }
            | CoreError::QemuCrashed { .. }
            | CoreError::SnapshotFailed { .. }
            | CoreError::NbdIo { .. }
            | CoreError::ClientUnreachable { .. } => StatusCode::BAD_GATEWAY,
            CoreError::Catalog { .. } | CoreError::RepositoryIo { .. } | CoreError::Stalled { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        ApiError(status, e.to_string())
    }
}

fn catalog_error(e: anyhow::Error) -> ApiError {
    error!("rest: catalog error: {e}");
    ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

#[derive(Deserialize)]
struct StartBackupBody {
    vm_name: Option<String>,
    vm_context_id: Option<String>,
    repository_id: String,
    backup_type: BackupType,
    #[serde(default)]
    force_full: bool,
}

#[derive(Serialize)]
struct StartBackupResponse {
    job: BackupJob,
}

/// `POST /backups` (§6.1): `{vm_name | vm_context_id, repository_id,
/// backup_type}`.
async fn start_backup(
    State(state): State<Arc<HubState>>,
    Json(body): Json<StartBackupBody>,
) -> Result<(StatusCode, Json<StartBackupResponse>), ApiError> {
    let context_id = resolve_context_id(&state, body.vm_name, body.vm_context_id).await?;

    let outcome = state
        .job_engine
        .start_backup(context_id, body.backup_type, body.repository_id, body.force_full)
        .await?;

    Ok((StatusCode::CREATED, Json(StartBackupResponse { job: outcome.job })))
}

async fn resolve_context_id(
    state: &HubState,
    vm_name: Option<String>,
    vm_context_id: Option<String>,
) -> Result<VmContextId, ApiError> {
    if let Some(id) = vm_context_id {
        return Ok(VmContextId(id));
    }
    let Some(vm_name) = vm_name else {
        return Err(ApiError(StatusCode::BAD_REQUEST, "one of vm_name or vm_context_id is required".to_string()));
    };
    let ctx = state
        .catalog
        .find_context_by_vm_name(vm_name.clone())
        .await
        .map_err(catalog_error)?
        .ok_or_else(|| ApiError(StatusCode::NOT_FOUND, format!("no VM named '{vm_name}'")))?;
    Ok(ctx.context_id)
}

#[derive(Deserialize)]
struct ListBackupsQuery {
    context_id: Option<String>,
    vm_name: Option<String>,
    status: Option<String>,
}

/// `GET /backups` (§6.1): filterable by `context_id`/`vm_name` and `status`.
async fn list_backups(
    State(state): State<Arc<HubState>>,
    Query(query): Query<ListBackupsQuery>,
) -> Result<Json<Vec<BackupJob>>, ApiError> {
    let context_id = if let Some(id) = query.context_id {
        Some(VmContextId(id))
    } else if let Some(vm_name) = query.vm_name {
        Some(resolve_context_id(&state, Some(vm_name), None).await?)
    } else {
        None
    };

    let status = query
        .status
        .map(|s| parse_job_status(&s))
        .transpose()
        .map_err(|e| ApiError(StatusCode::BAD_REQUEST, e))?;

    let jobs = state.catalog.list_jobs(context_id, status).await.map_err(catalog_error)?;
    Ok(Json(jobs))
}

fn parse_job_status(s: &str) -> Result<JobStatus, String> {
    Ok(match s {
        "queued" => JobStatus::Queued,
        "running" => JobStatus::Running,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        "cancelled" => JobStatus::Cancelled,
        other => return Err(format!("unknown status '{other}'")),
    })
}

fn parse_job_id(id: &str) -> Result<JobId, ApiError> {
    id.parse().map_err(|_| ApiError(StatusCode::BAD_REQUEST, format!("malformed job id '{id}'")))
}

/// `GET /backups/{id}` (§6.1).
async fn get_backup(State(state): State<Arc<HubState>>, Path(id): Path<String>) -> Result<Json<BackupJob>, ApiError> {
    let job_id = parse_job_id(&id)?;
    let job = state
        .catalog
        .get_job(job_id.clone())
        .await
        .map_err(catalog_error)?
        .ok_or_else(|| ApiError(StatusCode::NOT_FOUND, format!("no job '{job_id}'")))?;
    Ok(Json(job))
}

/// `DELETE /backups/{id}` (§6.1): delete, chain-aware.
async fn delete_backup(State(state): State<Arc<HubState>>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    let job_id = parse_job_id(&id)?;
    state
        .catalog
        .delete_job(job_id)
        .await
        .map_err(|e| ApiError(StatusCode::CONFLICT, e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /backups/{vm_name}/chain` (§6.1): one chain per disk of the VM.
async fn get_chain_view(
    State(state): State<Arc<HubState>>,
    Path(vm_name): Path<String>,
) -> Result<Json<Vec<BackupChain>>, ApiError> {
    let context_id = resolve_context_id(&state, Some(vm_name), None).await?;
    let disks = state.catalog.list_current_vm_disks(context_id.clone()).await.map_err(catalog_error)?;

    let mut chains = Vec::new();
    for disk in disks {
        if let Some(chain) = state.catalog.get_chain(context_id.clone(), disk.disk_key).await.map_err(catalog_error)? {
            chains.push(chain);
        }
    }
    Ok(Json(chains))
}

/// `POST /backups/{id}/complete` (§6.1): client completion report.
async fn complete_backup(
    State(state): State<Arc<HubState>>,
    Path(id): Path<String>,
    Json(body): Json<CompletionRequest>,
) -> Result<StatusCode, ApiError> {
    let job_id = parse_job_id(&id)?;
    state.job_engine.complete_backup(job_id, body).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /telemetry/backup/{jobId}` (§4.4, §6.1): push telemetry update.
async fn ingest_telemetry(
    State(state): State<Arc<HubState>>,
    Path(id): Path<String>,
    Json(body): Json<TelemetryUpdate>,
) -> Result<StatusCode, ApiError> {
    let job_id = parse_job_id(&id)?;
    crate::telemetry::ingest(&state.catalog, job_id, body).await.map_err(catalog_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
}

/// `GET /healthz` (§6.1a): liveness once the catalog and port allocator are
/// initialized, which by construction they are by the time this handler
/// can run.
async fn healthz(State(state): State<Arc<HubState>>) -> Result<Json<HealthBody>, ApiError> {
    state.catalog.list_running_jobs().await.map_err(catalog_error)?;
    Ok(Json(HealthBody { status: "ok" }))
}

/// `GET /metrics/ports` (§6.1a): proxies `PortAllocator::metrics()`.
async fn port_metrics(State(state): State<Arc<HubState>>) -> Json<vbr_port_allocator::PortAllocatorMetrics> {
    Json(state.ports.metrics())
}

/// `GET /metrics/qemu` (§6.1a): proxies `QemuNbdManager::metrics()`.
async fn qemu_metrics(State(state): State<Arc<HubState>>) -> Json<vbr_qemu_nbd::QemuNbdMetrics> {
    Json(state.qemu.metrics().await)
}
