use std::sync::Arc;
use std::time::Duration;

use crate::error::NexusError;
use crate::integrations::{notifications, system, wandb};

use super::db;
use super::gpu;
use super::job::{self, Job, JobStatus};
use super::runner;
use super::{now_ts, Context};

/// Tracker lookups stop once a job has been running this long.
const WANDB_SEARCH_WINDOW_SECS: f64 = 720.0;

/// How often the node's health is probed and logged.
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Scheduler entry point: tick forever, one daemon task per node. A failed
/// tick is logged and retried after the normal sleep; state it did not
/// commit is picked up again by the next tick.
pub async fn run(ctx: Arc<Context>) {
    tracing::info!(
        node = %ctx.config.node_name,
        refresh_rate = ctx.config.refresh_rate,
        "Scheduler started"
    );
    let mut last_health_check = std::time::Instant::now();
    loop {
        if let Err(e) = tick(&ctx).await {
            tracing::error!("Scheduler tick failed: {e}");
        }

        if last_health_check.elapsed() >= HEALTH_LOG_INTERVAL {
            last_health_check = std::time::Instant::now();
            let health = system::check_health().await;
            if health.status == "unhealthy" {
                tracing::warn!(score = health.score, "System health is UNHEALTHY");
            } else {
                tracing::debug!(score = health.score, status = health.status, "Health check");
            }
        }

        tokio::time::sleep(Duration::from_secs(ctx.config.refresh_rate)).await;
    }
}

/// One tick: reap our running jobs, refresh tracker URLs, then start queued
/// work. Phase order matters: GPUs freed in the reap phase are visible to
/// the start phase of the same tick.
pub async fn tick(ctx: &Context) -> Result<(), NexusError> {
    update_running_jobs(ctx).await?;
    update_wandb_urls(ctx).await?;
    start_queued_jobs(ctx).await?;
    Ok(())
}

fn our_running_jobs(ctx: &Context) -> Result<Vec<Job>, NexusError> {
    let jobs = ctx
        .db
        .with_conn(|c| db::list_jobs(c, Some(JobStatus::Running), None))?;
    Ok(jobs
        .into_iter()
        .filter(|j| j.node.as_deref() == Some(ctx.config.node_name.as_str()))
        .collect())
}

/// Phase 1: move running jobs that died (or were marked for kill) into their
/// terminal state, notify, persist, and clean their workspaces.
async fn update_running_jobs(ctx: &Context) -> Result<(), NexusError> {
    for job in our_running_jobs(ctx)? {
        let updated = if job.marked_for_kill && runner::is_job_running(ctx, &job) {
            runner::kill_job(ctx, &job).await;
            runner::end_job(&job, true).await
        } else if !runner::is_job_running(ctx, &job) {
            runner::end_job(&job, false).await
        } else {
            continue;
        };

        let action = match updated.status {
            JobStatus::Completed => notifications::JobAction::Completed,
            JobStatus::Killed => notifications::JobAction::Killed,
            _ => notifications::JobAction::Failed,
        };
        tracing::info!(
            job_id = %updated.id,
            status = %updated.status,
            exit_code = ?updated.exit_code,
            "Job finished"
        );

        // Fire-and-log; a failed callback never blocks the transition.
        let updated = notifications::notify_job_action(ctx, &updated, action).await;

        ctx.db.transaction(|tx| db::update_job(tx, &updated))?;
        runner::cleanup_job_repo(updated.dir.as_deref()).await;
        ctx.tracker_cache.forget(&updated.id);
    }
    Ok(())
}

/// Phase 2: resolve tracker URLs for young running jobs that requested the
/// wandb integration, and update the start notification once found.
async fn update_wandb_urls(ctx: &Context) -> Result<(), NexusError> {
    for job in our_running_jobs(ctx)? {
        if job.wandb_url.is_some() || !job.integrations.iter().any(|i| i == "wandb") {
            continue;
        }
        let Some(started_at) = job.started_at else {
            continue;
        };
        if now_ts() - started_at > WANDB_SEARCH_WINDOW_SECS {
            continue;
        }

        let Some(url) = wandb::find_wandb_run(ctx, &job).await else {
            continue;
        };

        let mut updated = job;
        updated.wandb_url = Some(url.clone());
        ctx.db.transaction(|tx| db::update_job(tx, &updated))?;
        tracing::info!(job_id = %updated.id, url = %url, "Associated job with tracker run");
        notifications::update_notification_with_wandb(ctx, &updated).await;
    }
    Ok(())
}

/// Phase 3: try to start the highest-priority queued job on this node. At
/// most one job starts per tick; the tick rate is the back-pressure.
async fn start_queued_jobs(ctx: &Context) -> Result<(), NexusError> {
    let queued = ctx
        .db
        .with_conn(|c| db::list_jobs(c, Some(JobStatus::Queued), None))?;
    let queue = job::sort_queue(queued);
    let Some(next) = queue.into_iter().next() else {
        return Ok(());
    };

    let Some(chosen) = choose_gpus(ctx, &next).await? else {
        tracing::debug!(job_id = %next.id, "No suitable GPUs locally, leaving job queued");
        return Ok(());
    };

    // The claim is the only cross-node synchronization point. Losing it
    // just means a peer got there first; try again next tick.
    let claimed = ctx
        .db
        .transaction(|tx| db::claim_job(tx, &next.id, &ctx.config.node_name))?;
    if !claimed {
        tracing::debug!(job_id = %next.id, "Lost claim race");
        return Ok(());
    }

    let mut claimed_job = next;
    claimed_job.node = Some(ctx.config.node_name.clone());

    match runner::start_job(ctx, claimed_job.clone(), &chosen).await {
        Ok(started) => {
            // Persisting the row is the last step; a crash between launch
            // and this update leaks a process, so keep the gap minimal.
            ctx.db.transaction(|tx| db::update_job(tx, &started))?;
            tracing::info!(
                job_id = %started.id,
                gpus = ?started.gpu_idxs_assigned,
                "Job started"
            );

            let notified = notifications::notify_job_action(
                ctx,
                &started,
                notifications::JobAction::Started,
            )
            .await;
            if notified.notification_messages != started.notification_messages {
                ctx.db.transaction(|tx| db::update_job(tx, &notified))?;
            }
        }
        Err(e) => {
            // Attribute the failure to this node; no implicit retry.
            tracing::error!(job_id = %claimed_job.id, "Failed to start job: {e}");
            claimed_job.status = JobStatus::Failed;
            claimed_job.completed_at = Some(now_ts());
            claimed_job.error_message = Some(format!("Failed to start job: {e}"));
            ctx.db.transaction(|tx| db::update_job(tx, &claimed_job))?;
        }
    }
    Ok(())
}

/// Pick GPUs for a queued job from the local inventory. None means the job
/// cannot run here right now.
async fn choose_gpus(ctx: &Context, job: &Job) -> Result<Option<Vec<u32>>, NexusError> {
    let running_local = our_running_jobs(ctx)?;
    let blacklist = ctx
        .db
        .with_conn(|c| db::list_blacklisted_gpus(c, &ctx.config.node_name))?;
    let gpus = gpu::get_gpus(&running_local, &blacklist, ctx.config.mock_gpus).await;

    let available: Vec<u32> = gpus
        .iter()
        .filter(|g| {
            if job.ignore_blacklist {
                g.running_job_id.is_none() && g.process_count == 0
            } else {
                gpu::is_gpu_available(g)
            }
        })
        .map(|g| g.index)
        .collect();

    if let Some(required) = &job.gpu_idxs {
        if required.iter().all(|idx| available.contains(idx)) {
            return Ok(Some(required.clone()));
        }
        return Ok(None);
    }

    if job.num_gpus as usize <= available.len() {
        return Ok(Some(available[..job.num_gpus as usize].to_vec()));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::db::Database;
    use crate::core::ids;
    use crate::core::session::SessionBackend;
    use std::collections::HashMap;
    use std::path::Path;
    use tempfile::TempDir;

    /// Pretends every launch succeeded and reports a fixed supervisor PID.
    struct StubBackend {
        pid: i64,
    }

    impl SessionBackend for StubBackend {
        fn start(
            &self,
            _name: &str,
            _script: &Path,
            _env: &HashMap<String, String>,
        ) -> Result<(), NexusError> {
            Ok(())
        }

        fn session_exists(&self, _name: &str) -> bool {
            false
        }

        fn session_pid(&self, _name: &str) -> Option<i64> {
            Some(self.pid)
        }

        fn kill(&self, _name: &str) {}
    }

    fn test_context(temp: &TempDir, pid: i64) -> Context {
        let config = Config {
            node_name: "test-node".to_string(),
            mock_gpus: true,
            server_dir: temp.path().to_path_buf(),
            ..Config::default()
        };
        let db = Database::new(&temp.path().join("state.db")).unwrap();
        Context::new(
            config,
            db,
            Arc::new(StubBackend { pid }),
            temp.path().join("logs"),
        )
    }

    fn submit(ctx: &Context, priority: i64, num_gpus: u32) -> String {
        let artifact = b"fake tar".to_vec();
        let artifact_id = ids::artifact_id(&artifact);
        ctx.db
            .transaction(|tx| db::add_artifact(tx, &artifact_id, &artifact))
            .unwrap();

        let job = job::create_job(job::NewJob {
            command: "echo hi".to_string(),
            artifact_id,
            user: "alice".to_string(),
            git_repo_url: None,
            git_branch: None,
            priority,
            num_gpus,
            gpu_idxs: None,
            ignore_blacklist: false,
            env: HashMap::new(),
            jobrc: None,
            integrations: vec![],
            notifications: vec![],
        });
        ctx.db.transaction(|tx| db::add_job(tx, &job)).unwrap();
        job.id
    }

    #[tokio::test]
    async fn test_tick_starts_highest_priority_job() {
        let temp = TempDir::new().unwrap();
        // Our own PID keeps the "running" liveness probe true across ticks.
        let ctx = test_context(&temp, std::process::id() as i64);

        let low = submit(&ctx, 0, 1);
        let high = submit(&ctx, 10, 1);

        tick(&ctx).await.unwrap();

        let started = ctx
            .db
            .with_conn(|c| db::get_job(c, &high))
            .unwrap()
            .unwrap();
        assert_eq!(started.status, JobStatus::Running);
        assert_eq!(started.node.as_deref(), Some("test-node"));
        assert_eq!(started.gpu_idxs_assigned, vec![0]);
        assert!(started.pid.is_some());
        assert!(started.started_at.is_some());
        assert_eq!(
            started.session_name.as_deref(),
            Some(format!("nexus_job_{high}").as_str())
        );

        // One start per tick: the low-priority job is still queued.
        let waiting = ctx.db.with_conn(|c| db::get_job(c, &low)).unwrap().unwrap();
        assert_eq!(waiting.status, JobStatus::Queued);
        assert!(waiting.node.is_none());

        // Next tick places the second job on the remaining mock device.
        tick(&ctx).await.unwrap();
        let second = ctx.db.with_conn(|c| db::get_job(c, &low)).unwrap().unwrap();
        assert_eq!(second.status, JobStatus::Running);
        assert_eq!(second.gpu_idxs_assigned, vec![1]);
    }

    #[tokio::test]
    async fn test_job_waits_when_gpus_exhausted() {
        let temp = TempDir::new().unwrap();
        let ctx = test_context(&temp, std::process::id() as i64);

        // Needs more devices than the mock table has.
        let big = submit(&ctx, 0, 3);
        tick(&ctx).await.unwrap();

        let job = ctx.db.with_conn(|c| db::get_job(c, &big)).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.node.is_none());
    }

    #[tokio::test]
    async fn test_blacklisted_required_gpu_keeps_job_queued() {
        let temp = TempDir::new().unwrap();
        let ctx = test_context(&temp, std::process::id() as i64);

        ctx.db
            .transaction(|tx| db::add_blacklisted_gpu(tx, "test-node", 0))
            .unwrap();

        let artifact = b"t".to_vec();
        let artifact_id = ids::artifact_id(&artifact);
        ctx.db
            .transaction(|tx| db::add_artifact(tx, &artifact_id, &artifact))
            .unwrap();
        let job = job::create_job(job::NewJob {
            command: "echo hi".to_string(),
            artifact_id,
            user: "alice".to_string(),
            git_repo_url: None,
            git_branch: None,
            priority: 0,
            num_gpus: 1,
            gpu_idxs: Some(vec![0]),
            ignore_blacklist: false,
            env: HashMap::new(),
            jobrc: None,
            integrations: vec![],
            notifications: vec![],
        });
        let id = job.id.clone();
        ctx.db.transaction(|tx| db::add_job(tx, &job)).unwrap();

        for _ in 0..3 {
            tick(&ctx).await.unwrap();
            let j = ctx.db.with_conn(|c| db::get_job(c, &id)).unwrap().unwrap();
            assert_eq!(j.status, JobStatus::Queued);
        }

        // Lifting the blacklist frees the demanded device.
        ctx.db
            .transaction(|tx| db::remove_blacklisted_gpu(tx, "test-node", 0))
            .unwrap();
        tick(&ctx).await.unwrap();
        let j = ctx.db.with_conn(|c| db::get_job(c, &id)).unwrap().unwrap();
        assert_eq!(j.status, JobStatus::Running);
        assert_eq!(j.gpu_idxs_assigned, vec![0]);
    }

    #[tokio::test]
    async fn test_dead_job_is_reaped_from_log_marker() {
        let temp = TempDir::new().unwrap();
        let ctx = test_context(&temp, std::process::id() as i64);

        let id = submit(&ctx, 0, 1);
        tick(&ctx).await.unwrap();

        // Simulate the supervisor having exited cleanly.
        let mut running = ctx.db.with_conn(|c| db::get_job(c, &id)).unwrap().unwrap();
        let dir = running.dir.clone().unwrap();
        tokio::fs::write(
            dir.join("output.log"),
            "hi\nScript done [COMMAND_EXIT_CODE=\"0\"]\n",
        )
        .await
        .unwrap();
        running.pid = Some(i32::MAX as i64 - 1);
        ctx.db
            .transaction(|tx| db::update_job(tx, &running))
            .unwrap();

        tick(&ctx).await.unwrap();

        let done = ctx.db.with_conn(|c| db::get_job(c, &id)).unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.exit_code, Some(0));
        assert!(done.completed_at.unwrap() >= done.started_at.unwrap());
        // Workspace repo was cleaned, log kept.
        assert!(!dir.join("repo").exists());
        assert!(dir.join("output.log").exists());
    }

    #[tokio::test]
    async fn test_start_failure_marks_job_failed_and_pins_node() {
        let temp = TempDir::new().unwrap();
        let ctx = test_context(&temp, std::process::id() as i64);

        // Job references an artifact that is not in the store.
        let job = job::create_job(job::NewJob {
            command: "echo hi".to_string(),
            artifact_id: "missing-artifact".to_string(),
            user: "alice".to_string(),
            git_repo_url: None,
            git_branch: None,
            priority: 0,
            num_gpus: 1,
            gpu_idxs: None,
            ignore_blacklist: false,
            env: HashMap::new(),
            jobrc: None,
            integrations: vec![],
            notifications: vec![],
        });
        let id = job.id.clone();
        ctx.db.transaction(|tx| db::add_job(tx, &job)).unwrap();

        tick(&ctx).await.unwrap();

        let failed = ctx.db.with_conn(|c| db::get_job(c, &id)).unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.node.as_deref(), Some("test-node"));
        assert!(failed.completed_at.is_some());
        assert!(failed
            .error_message
            .as_deref()
            .unwrap()
            .contains("Failed to start job"));
    }
}
