use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;

use crate::error::NexusError;

use super::db;
use super::job::{self, Job, JobStatus};
use super::{now_ts, Context};

/// How long to give the session tool before resolving the supervisor PID.
const SESSION_SETTLE: Duration = Duration::from_millis(500);

fn exit_code_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"COMMAND_EXIT_CODE=["']?(\d+)["']?"#).unwrap())
}

/// Materialize a job's workspace and launch it inside a supervised session.
/// Returns the job as running; any failure surfaces as a runner fault the
/// scheduler converts into a failed job.
pub async fn start_job(ctx: &Context, job: Job, gpu_idxs: &[u32]) -> Result<Job, NexusError> {
    let job_dir = tempfile::Builder::new()
        .prefix(&format!("nexus-job-{}-", job.id))
        .tempdir()
        .map_err(|e| NexusError::Runner(format!("failed to create job directory: {e}")))?
        .keep();

    let mut job = job;
    job.dir = Some(job_dir.clone());

    let archive = ctx
        .db
        .with_conn(|c| db::get_artifact(c, &job.artifact_id))?
        .ok_or_else(|| {
            NexusError::Runner(format!("artifact not found: {}", job.artifact_id))
        })?;

    let script_path = prepare_workspace(&job_dir, &archive, &job.command, job.jobrc.as_deref())
        .await
        .map_err(|e| NexusError::Runner(format!("failed to prepare workspace: {e}")))?;

    let env = build_environment(gpu_idxs, &job.env);
    let session_name = job::session_name(&job.id);
    ctx.sessions.start(&session_name, &script_path, &env)?;

    tokio::time::sleep(SESSION_SETTLE).await;
    let pid = resolve_supervisor_pid(ctx, &session_name).await.ok_or_else(|| {
        NexusError::Runner(format!("failed to get PID for session {session_name}"))
    })?;

    job.status = JobStatus::Running;
    job.started_at = Some(now_ts());
    job.pid = Some(pid);
    job.session_name = Some(session_name);
    job.gpu_idxs_assigned = gpu_idxs.to_vec();
    Ok(job)
}

/// Lay out the workspace: `code.tar`, an empty `repo/`, and `run.sh`. The
/// wrapper pipes everything through `script`, whose trailer line carries the
/// COMMAND_EXIT_CODE marker the reaper parses.
async fn prepare_workspace(
    job_dir: &Path,
    archive: &[u8],
    command: &str,
    jobrc: Option<&str>,
) -> anyhow::Result<PathBuf> {
    let repo_dir = job_dir.join("repo");
    tokio::fs::create_dir_all(&repo_dir).await?;

    let archive_path = job_dir.join("code.tar");
    tokio::fs::write(&archive_path, archive).await?;

    let log_file = job_dir.join("output.log");
    let script_path = job_dir.join("run.sh");
    let content = build_script_content(&log_file, &repo_dir, &archive_path, command, jobrc);
    tokio::fs::write(&script_path, content).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).await?;
    }

    Ok(script_path)
}

fn build_script_content(
    log_file: &Path,
    repo_dir: &Path,
    archive_path: &Path,
    command: &str,
    jobrc: Option<&str>,
) -> String {
    let quote = |p: &Path| shell_escape::escape(p.to_string_lossy()).into_owned();
    let repo = quote(repo_dir);
    let archive = quote(archive_path);
    let log = quote(log_file);

    let jobrc_cmd = match jobrc.map(str::trim) {
        Some(rc) if !rc.is_empty() => format!("{rc} && "),
        _ => String::new(),
    };
    let pipeline =
        format!("mkdir -p {repo} && tar -xf {archive} -C {repo} && cd {repo} && {jobrc_cmd}{command}");

    format!(
        "#!/bin/bash\nset -e\nscript -q -e -f -c {} {log}\n",
        shell_escape::escape(pipeline.into())
    )
}

/// Runtime environment for the launched process: the daemon environment,
/// CUDA_VISIBLE_DEVICES for the allocation, then the job's own variables.
fn build_environment(gpu_idxs: &[u32], job_env: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    env.insert(
        "CUDA_VISIBLE_DEVICES".to_string(),
        gpu_idxs
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(","),
    );
    env.extend(job_env.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

/// The session tool's own handle is authoritative; a command-line scan is
/// only the fallback for tools that offer nothing.
async fn resolve_supervisor_pid(ctx: &Context, session_name: &str) -> Option<i64> {
    if let Some(pid) = ctx.sessions.session_pid(session_name) {
        return Some(pid);
    }

    let output = Command::new("pgrep")
        .args(["-f", session_name])
        .output()
        .await
        .ok()?;
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .find_map(|l| l.trim().parse().ok())
}

/// Liveness probe. Signal 0 to the recorded PID; a permission error still
/// means the process exists. Without a PID, fall back to the session list.
pub fn is_job_running(ctx: &Context, job: &Job) -> bool {
    let Some(pid) = job.pid else {
        return ctx.sessions.session_exists(&job::session_name(&job.id));
    };

    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Transition a no-longer-running job to its terminal state from the log's
/// exit marker. `killed` overrides the log verdict.
pub async fn end_job(job: &Job, killed: bool) -> Job {
    let mut ended = job.clone();
    ended.completed_at = Some(now_ts());

    if killed {
        ended.status = JobStatus::Killed;
        return ended;
    }

    let last_line = match read_last_log_line(job.dir.as_deref()).await {
        Some(line) => line,
        None => {
            ended.status = JobStatus::Failed;
            ended.error_message = Some("No output log found".to_string());
            return ended;
        }
    };

    match parse_exit_code(&last_line) {
        Some(0) => {
            ended.status = JobStatus::Completed;
            ended.exit_code = Some(0);
            ended.error_message = None;
        }
        Some(code) => {
            ended.status = JobStatus::Failed;
            ended.exit_code = Some(code);
            ended.error_message = Some(format!("Job failed with exit code {code}"));
        }
        None => {
            ended.status = JobStatus::Failed;
            ended.error_message = Some("Could not find exit code in log".to_string());
        }
    }
    ended
}

fn parse_exit_code(last_line: &str) -> Option<i64> {
    exit_code_regex()
        .captures(last_line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

async fn read_last_log_line(job_dir: Option<&Path>) -> Option<String> {
    let content = read_job_logs(job_dir, None).await?;
    content.lines().last().map(|l| l.to_string())
}

/// Combined stdout+stderr of the job, optionally only the last `n` lines.
/// None when no log exists yet.
pub async fn read_job_logs(job_dir: Option<&Path>, last_n_lines: Option<usize>) -> Option<String> {
    let log_path = job_dir?.join("output.log");
    let content = tokio::fs::read_to_string(&log_path).await.ok()?;
    match last_n_lines {
        Some(n) => {
            let lines: Vec<&str> = content.lines().collect();
            let start = lines.len().saturating_sub(n);
            Some(lines[start..].join("\n"))
        }
        None => Some(content),
    }
}

/// SIGKILL everything belonging to the job: processes rooted in the
/// workspace, processes carrying the session name, and the supervisor's
/// process group. Nothing here is allowed to fail the caller.
pub async fn kill_job(ctx: &Context, job: &Job) {
    if let Some(dir) = &job.dir {
        let _ = Command::new("pkill")
            .args(["-9", "-f", &dir.to_string_lossy()])
            .status()
            .await;
    }

    let session_name = job::session_name(&job.id);
    let _ = Command::new("pkill")
        .args(["-9", "-f", &session_name])
        .status()
        .await;

    if let Some(pid) = job.pid {
        if let Ok(output) = Command::new("ps")
            .args(["-o", "pgid=", "-p", &pid.to_string()])
            .output()
            .await
        {
            let pgid = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !pgid.is_empty() {
                let _ = Command::new("kill")
                    .args(["-9", &format!("-{pgid}")])
                    .status()
                    .await;
            }
        }
    }

    ctx.sessions.kill(&session_name);
}

/// Drop the extracted snapshot once the job is terminal. The log and the
/// tarball stay for later inspection; failures are logged only.
pub async fn cleanup_job_repo(job_dir: Option<&Path>) {
    let Some(job_dir) = job_dir else { return };
    let repo_dir = job_dir.join("repo");
    if repo_dir.exists() {
        match tokio::fs::remove_dir_all(&repo_dir).await {
            Ok(()) => tracing::info!("Cleaned up {}", repo_dir.display()),
            Err(e) => tracing::warn!("Failed to clean up {}: {e}", repo_dir.display()),
        }
    }
}
