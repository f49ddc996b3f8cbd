use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use std::sync::Arc;

use crate::core::job::{self, Job, JobStatus};
use crate::core::{db, gpu, ids, runner, Context};
use crate::error::NexusError;
use crate::integrations::system;
use crate::logging;

use super::models::{
    ArtifactResponse, BlacklistResponse, HealthResponse, JobActionError, JobActionResponse,
    JobListQuery, JobLogsResponse, JobQueueActionResponse, JobRequest, JobUpdateRequest,
    ServerActionResponse, ServerLogsResponse, ServerStatusResponse,
};

const SERVER_LOG_TAIL_BYTES: usize = 64 * 1024;

fn parse_status(status: Option<&str>) -> Result<Option<JobStatus>, NexusError> {
    status
        .map(|s| {
            s.parse::<JobStatus>().map_err(|_| {
                NexusError::InvalidRequest(format!("invalid job status: {s}"))
            })
        })
        .transpose()
}

pub async fn get_server_status(
    State(ctx): State<Arc<Context>>,
) -> Result<Json<ServerStatusResponse>, NexusError> {
    let counts = ctx.db.with_conn(db::count_jobs_by_status)?;
    let count = |status: JobStatus| counts.get(&status.to_string()).copied().unwrap_or(0);

    let running = ctx
        .db
        .with_conn(|c| db::list_jobs(c, Some(JobStatus::Running), None))?;
    let running_local: Vec<Job> = running
        .into_iter()
        .filter(|j| j.node.as_deref() == Some(ctx.config.node_name.as_str()))
        .collect();
    let blacklist = ctx
        .db
        .with_conn(|c| db::list_blacklisted_gpus(c, &ctx.config.node_name))?;
    let gpus = gpu::get_gpus(&running_local, &blacklist, ctx.config.mock_gpus).await;

    Ok(Json(ServerStatusResponse {
        gpu_count: gpus.len(),
        queued_jobs: count(JobStatus::Queued),
        running_jobs: count(JobStatus::Running),
        completed_jobs: count(JobStatus::Completed),
        failed_jobs: count(JobStatus::Failed),
        killed_jobs: count(JobStatus::Killed),
        node_name: ctx.config.node_name.clone(),
        server_user: std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
        server_version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

pub async fn get_server_logs(
    State(ctx): State<Arc<Context>>,
) -> Result<Json<ServerLogsResponse>, NexusError> {
    let logs = logging::read_log_tail(&ctx.log_dir, SERVER_LOG_TAIL_BYTES).await;
    Ok(Json(ServerLogsResponse { logs }))
}

pub async fn list_jobs(
    State(ctx): State<Arc<Context>>,
    Query(query): Query<JobListQuery>,
) -> Result<Json<Vec<Job>>, NexusError> {
    let status = parse_status(query.status.as_deref())?;
    let mut jobs = ctx
        .db
        .with_conn(|c| db::list_jobs(c, status, query.command_regex.as_deref()))?;

    if let Some(gpu_idx) = query.gpu_idx {
        jobs.retain(|j| j.gpu_idxs_assigned.contains(&gpu_idx));
    }
    Ok(Json(jobs))
}

pub async fn create_job(
    State(ctx): State<Arc<Context>>,
    Json(request): Json<JobRequest>,
) -> Result<(StatusCode, Json<Job>), NexusError> {
    request.validate()?;

    let git_repo_url = request
        .git_repo_url
        .as_deref()
        .map(crate::integrations::git::normalize_git_url)
        .transpose()
        .map_err(|e| {
            NexusError::Validation(vec![crate::error::FieldError::new(
                "git_repo_url",
                e.to_string(),
            )])
        })?;

    let mut integrations = Vec::new();
    if request.search_wandb {
        integrations.push("wandb".to_string());
    }

    let new_job = job::create_job(job::NewJob {
        command: request.command,
        artifact_id: request.artifact_id,
        user: request.user,
        git_repo_url,
        git_branch: request.git_branch,
        priority: request.priority,
        num_gpus: request.num_gpus,
        gpu_idxs: request.gpu_idxs,
        ignore_blacklist: request.ignore_blacklist,
        env: request.env,
        jobrc: request.jobrc,
        integrations,
        notifications: request.notifications,
    });

    let created = ctx.db.transaction(|tx| {
        if !db::artifact_exists(tx, &new_job.artifact_id)? {
            return Err(NexusError::Validation(vec![crate::error::FieldError::new(
                "artifact_id",
                format!("unknown artifact: {}", new_job.artifact_id),
            )]));
        }
        db::add_job(tx, &new_job)?;
        Ok(new_job.clone())
    })?;

    tracing::info!(job_id = %created.id, user = %created.user, "Job added to queue");
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn get_job(
    State(ctx): State<Arc<Context>>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, NexusError> {
    let job = ctx
        .db
        .with_conn(|c| db::get_job(c, &job_id))?
        .ok_or_else(|| NexusError::NotFound(format!("job not found: {job_id}")))?;
    Ok(Json(job))
}

pub async fn get_job_logs(
    State(ctx): State<Arc<Context>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobLogsResponse>, NexusError> {
    let job = ctx
        .db
        .with_conn(|c| db::get_job(c, &job_id))?
        .ok_or_else(|| NexusError::NotFound(format!("job not found: {job_id}")))?;

    let logs = runner::read_job_logs(job.dir.as_deref(), None)
        .await
        .unwrap_or_default();
    Ok(Json(JobLogsResponse { logs }))
}

pub async fn update_job(
    State(ctx): State<Arc<Context>>,
    Path(job_id): Path<String>,
    Json(request): Json<JobUpdateRequest>,
) -> Result<Json<Job>, NexusError> {
    let updated = ctx.db.transaction(|tx| {
        let mut job = db::get_job(tx, &job_id)?
            .ok_or_else(|| NexusError::NotFound(format!("job not found: {job_id}")))?;

        if job.status != JobStatus::Queued {
            return Err(NexusError::InvalidState(format!(
                "cannot update job {job_id} with status '{}'; only queued jobs can be updated",
                job.status
            )));
        }

        if let Some(command) = &request.command {
            if command.trim().is_empty() {
                return Err(NexusError::InvalidRequest(
                    "command cannot be empty".to_string(),
                ));
            }
            job.command = command.trim().to_string();
        }
        if let Some(priority) = request.priority {
            job.priority = priority;
        }

        db::update_job(tx, &job)?;
        Ok(job)
    })?;

    Ok(Json(updated))
}

pub async fn delete_job(
    State(ctx): State<Arc<Context>>,
    Path(job_id): Path<String>,
) -> Result<StatusCode, NexusError> {
    ctx.db.transaction(|tx| db::delete_queued_job(tx, &job_id))?;
    tracing::info!(job_id = %job_id, "Removed queued job");
    Ok(StatusCode::NO_CONTENT)
}

/// Kill is a signal: mark the row and let the owning node's scheduler do
/// the termination on its next tick.
pub async fn kill_job(
    State(ctx): State<Arc<Context>>,
    Path(job_id): Path<String>,
) -> Result<StatusCode, NexusError> {
    ctx.db.transaction(|tx| {
        let mut job = db::get_job(tx, &job_id)?
            .ok_or_else(|| NexusError::NotFound(format!("job not found: {job_id}")))?;

        if job.status != JobStatus::Running {
            return Err(NexusError::InvalidState(format!(
                "cannot kill job {job_id} with status '{}'; only running jobs can be killed",
                job.status
            )));
        }

        job.marked_for_kill = true;
        db::update_job(tx, &job)
    })?;

    tracing::info!(job_id = %job_id, "Marked job for termination");
    Ok(StatusCode::NO_CONTENT)
}

/// Mark a batch of running jobs for termination. Errors are collected per
/// job so one bad id does not abort the rest.
pub async fn kill_jobs_bulk(
    State(ctx): State<Arc<Context>>,
    Json(job_ids): Json<Vec<String>>,
) -> Result<Json<JobActionResponse>, NexusError> {
    if job_ids.is_empty() {
        return Err(NexusError::InvalidRequest(
            "no job ids provided".to_string(),
        ));
    }

    let mut killed = Vec::new();
    let mut failed = Vec::new();
    for job_id in job_ids {
        let result = ctx.db.transaction(|tx| {
            let mut job = db::get_job(tx, &job_id)?
                .ok_or_else(|| NexusError::NotFound(format!("job not found: {job_id}")))?;
            if job.status != JobStatus::Running {
                return Err(NexusError::InvalidState(format!(
                    "job is not running (current status: {})",
                    job.status
                )));
            }
            job.marked_for_kill = true;
            db::update_job(tx, &job)
        });
        match result {
            Ok(()) => {
                tracing::info!(job_id = %job_id, "Marked job for termination");
                killed.push(job_id);
            }
            Err(e) => failed.push(JobActionError {
                id: job_id,
                error: e.to_string(),
            }),
        }
    }

    Ok(Json(JobActionResponse { killed, failed }))
}

/// Remove a batch of queued jobs, garbage-collecting artifacts as their
/// last references disappear.
pub async fn remove_jobs_bulk(
    State(ctx): State<Arc<Context>>,
    Json(job_ids): Json<Vec<String>>,
) -> Result<Json<JobQueueActionResponse>, NexusError> {
    if job_ids.is_empty() {
        return Err(NexusError::InvalidRequest(
            "no job ids provided".to_string(),
        ));
    }

    let mut removed = Vec::new();
    let mut failed = Vec::new();
    for job_id in job_ids {
        match ctx.db.transaction(|tx| db::delete_queued_job(tx, &job_id)) {
            Ok(()) => {
                tracing::info!(job_id = %job_id, "Removed queued job");
                removed.push(job_id);
            }
            Err(e) => failed.push(JobActionError {
                id: job_id,
                error: e.to_string(),
            }),
        }
    }

    Ok(Json(JobQueueActionResponse { removed, failed }))
}

pub async fn stop_server() -> Json<ServerActionResponse> {
    tracing::info!("Server shutdown initiated by API request");
    tokio::spawn(async {
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        std::process::exit(0);
    });
    Json(ServerActionResponse {
        status: "stopping".to_string(),
    })
}

pub async fn get_queue(State(ctx): State<Arc<Context>>) -> Result<Json<Vec<Job>>, NexusError> {
    let queued = ctx
        .db
        .with_conn(|c| db::list_jobs(c, Some(JobStatus::Queued), None))?;
    Ok(Json(job::sort_queue(queued)))
}

pub async fn list_gpus(
    State(ctx): State<Arc<Context>>,
) -> Result<Json<Vec<gpu::GpuInfo>>, NexusError> {
    let running = ctx
        .db
        .with_conn(|c| db::list_jobs(c, Some(JobStatus::Running), None))?;
    let running_local: Vec<Job> = running
        .into_iter()
        .filter(|j| j.node.as_deref() == Some(ctx.config.node_name.as_str()))
        .collect();
    let blacklist = ctx
        .db
        .with_conn(|c| db::list_blacklisted_gpus(c, &ctx.config.node_name))?;
    Ok(Json(
        gpu::get_gpus(&running_local, &blacklist, ctx.config.mock_gpus).await,
    ))
}

pub async fn blacklist_gpu(
    State(ctx): State<Arc<Context>>,
    Path(gpu_idx): Path<u32>,
) -> Result<Json<BlacklistResponse>, NexusError> {
    let changed = ctx
        .db
        .transaction(|tx| db::add_blacklisted_gpu(tx, &ctx.config.node_name, gpu_idx))?;
    if changed {
        tracing::info!(gpu_idx, "Blacklisted GPU");
    }
    Ok(Json(BlacklistResponse { gpu_idx, changed }))
}

pub async fn remove_gpu_blacklist(
    State(ctx): State<Arc<Context>>,
    Path(gpu_idx): Path<u32>,
) -> Result<Json<BlacklistResponse>, NexusError> {
    let changed = ctx
        .db
        .transaction(|tx| db::remove_blacklisted_gpu(tx, &ctx.config.node_name, gpu_idx))?;
    if changed {
        tracing::info!(gpu_idx, "Removed GPU from blacklist");
    }
    Ok(Json(BlacklistResponse { gpu_idx, changed }))
}

pub async fn upload_artifact(
    State(ctx): State<Arc<Context>>,
    body: Bytes,
) -> Result<(StatusCode, Json<ArtifactResponse>), NexusError> {
    if body.is_empty() {
        return Err(NexusError::InvalidRequest(
            "artifact body cannot be empty".to_string(),
        ));
    }

    let artifact_id = ids::artifact_id(&body);
    ctx.db
        .transaction(|tx| db::add_artifact(tx, &artifact_id, &body))?;

    tracing::info!(artifact_id = %artifact_id, size = body.len(), "Stored artifact");
    Ok((
        StatusCode::CREATED,
        Json(ArtifactResponse { data: artifact_id }),
    ))
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse(system::check_health().await))
}
