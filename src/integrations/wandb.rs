//! Experiment-tracker URL discovery. The runner drops tracker metadata
//! inside the job workspace; we look for a run whose metadata mentions the
//! job id, then confirm it against the tracker API before reporting a URL.

use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::core::{Context, Job};

const API_TIMEOUT: Duration = Duration::from_secs(2);
const GRAPHQL_URL: &str = "https://api.wandb.ai/graphql";

/// Minimum spacing between discovery attempts for one job. The scheduler
/// asks on every tick; the tracker does not need to be probed that often.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Per-daemon memory of recent discovery attempts, so unanswered lookups
/// are retried on a slow cadence instead of every tick.
#[derive(Default)]
pub struct TrackerCache {
    attempts: Mutex<HashMap<String, Instant>>,
}

impl TrackerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a new attempt for this job is due; records the attempt.
    fn should_attempt(&self, job_id: &str) -> bool {
        let mut attempts = self.attempts.lock().unwrap();
        let now = Instant::now();
        match attempts.get(job_id) {
            Some(last) if now.duration_since(*last) < REFRESH_INTERVAL => false,
            _ => {
                attempts.insert(job_id.to_string(), now);
                true
            }
        }
    }

    /// Drop the record once a job no longer needs discovery.
    pub fn forget(&self, job_id: &str) {
        self.attempts.lock().unwrap().remove(job_id);
    }
}

/// Resolve the tracker run URL for a running job, or None if it cannot be
/// determined yet. Never fails: every error path degrades to None.
pub async fn find_wandb_run(ctx: &Context, job: &Job) -> Option<String> {
    if !ctx.tracker_cache.should_attempt(&job.id) {
        return None;
    }
    let dir = job.dir.as_deref()?;
    let api_key = job.env.get("WANDB_API_KEY")?;
    let entity = job.env.get("WANDB_ENTITY")?;

    let run_id = find_run_id_in_workspace(dir, &job.id)?;
    tracing::debug!(job_id = %job.id, run_id = %run_id, "Found tracker run id in workspace");

    match tokio::time::timeout(API_TIMEOUT, confirm_run(ctx, api_key, entity, &run_id)).await {
        Ok(Some(project)) => Some(format!("https://wandb.ai/{entity}/{project}/runs/{run_id}")),
        Ok(None) => {
            tracing::debug!(run_id = %run_id, "Tracker run not visible through the API yet");
            None
        }
        Err(_) => {
            tracing::debug!(run_id = %run_id, "Tracker API lookup timed out");
            None
        }
    }
}

/// Scan the workspace for `wandb-metadata.json` files mentioning the job id.
/// The run id is the last dash-separated segment of the run directory
/// (`wandb/run-<timestamp>-<run_id>/files/wandb-metadata.json`).
fn find_run_id_in_workspace(dir: &Path, job_id: &str) -> Option<String> {
    for metadata_file in collect_metadata_files(dir) {
        let Ok(content) = std::fs::read_to_string(&metadata_file) else {
            continue;
        };
        if !content.contains(job_id) {
            continue;
        }
        let run_dir = metadata_file.parent()?.parent()?;
        let run_id = run_dir.file_name()?.to_string_lossy().rsplit('-').next()?.to_string();
        if !run_id.is_empty() {
            return Some(run_id);
        }
    }
    None
}

fn collect_metadata_files(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.file_name().is_some_and(|n| n == "wandb-metadata.json") {
                found.push(path);
            }
        }
    }
    found
}

/// Probe the entity's projects for one containing the run. Returns the
/// project name on a hit.
async fn confirm_run(ctx: &Context, api_key: &str, entity: &str, run_id: &str) -> Option<String> {
    let projects = list_projects(ctx, api_key, entity).await?;
    for project in projects {
        if run_exists(ctx, api_key, entity, &project, run_id).await {
            return Some(project);
        }
    }
    None
}

async fn graphql(
    ctx: &Context,
    api_key: &str,
    query: &str,
    variables: serde_json::Value,
) -> Option<serde_json::Value> {
    let resp = ctx
        .http
        .post(GRAPHQL_URL)
        .basic_auth("api", Some(api_key))
        .json(&json!({"query": query, "variables": variables}))
        .send()
        .await
        .ok()?;
    resp.json().await.ok()
}

async fn list_projects(ctx: &Context, api_key: &str, entity: &str) -> Option<Vec<String>> {
    let body = graphql(
        ctx,
        api_key,
        "query($entity: String!) { models(entityName: $entity, first: 100) \
         { edges { node { name } } } }",
        json!({"entity": entity}),
    )
    .await?;

    let edges = body["data"]["models"]["edges"].as_array()?;
    Some(
        edges
            .iter()
            .filter_map(|e| e["node"]["name"].as_str().map(|s| s.to_string()))
            .collect(),
    )
}

async fn run_exists(
    ctx: &Context,
    api_key: &str,
    entity: &str,
    project: &str,
    run_id: &str,
) -> bool {
    let Some(body) = graphql(
        ctx,
        api_key,
        "query($entity: String!, $project: String!, $run: String!) \
         { project(name: $project, entityName: $entity) { run(name: $run) { name } } }",
        json!({"entity": entity, "project": project, "run": run_id}),
    )
    .await
    else {
        return false;
    };
    !body["data"]["project"]["run"].is_null()
}
