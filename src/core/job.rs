use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use strum::{Display, EnumIter, EnumString};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Killed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Killed
        )
    }
}

/// The unit of work. Durable fields only; the row in the shared store is the
/// source of truth and this struct mirrors it one to one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub artifact_id: String,
    pub user: String,
    pub git_repo_url: Option<String>,
    pub git_branch: Option<String>,
    pub status: JobStatus,
    pub created_at: f64,
    pub priority: i64,
    pub num_gpus: u32,
    /// Fixed GPU indices demanded by the user. Overrides `num_gpus` selection.
    pub gpu_idxs: Option<Vec<u32>>,
    pub ignore_blacklist: bool,
    pub env: HashMap<String, String>,
    pub jobrc: Option<String>,
    pub integrations: Vec<String>,
    pub notifications: Vec<String>,
    pub notification_messages: HashMap<String, String>,
    /// Claiming node. Never rewritten to a different node once set.
    pub node: Option<String>,
    pub pid: Option<i64>,
    pub dir: Option<PathBuf>,
    pub session_name: Option<String>,
    pub started_at: Option<f64>,
    pub gpu_idxs_assigned: Vec<u32>,
    pub wandb_url: Option<String>,
    pub marked_for_kill: bool,
    pub completed_at: Option<f64>,
    pub exit_code: Option<i64>,
    pub error_message: Option<String>,
}

impl Default for Job {
    fn default() -> Self {
        Self {
            id: String::new(),
            command: String::new(),
            artifact_id: String::new(),
            user: String::new(),
            git_repo_url: None,
            git_branch: None,
            status: JobStatus::Queued,
            created_at: 0.0,
            priority: 0,
            num_gpus: 1,
            gpu_idxs: None,
            ignore_blacklist: false,
            env: HashMap::new(),
            jobrc: None,
            integrations: Vec::new(),
            notifications: Vec::new(),
            notification_messages: HashMap::new(),
            node: None,
            pid: None,
            dir: None,
            session_name: None,
            started_at: None,
            gpu_idxs_assigned: Vec::new(),
            wandb_url: None,
            marked_for_kill: false,
            completed_at: None,
            exit_code: None,
            error_message: None,
        }
    }
}

/// Parameters for a new job. Everything else starts at its queued defaults.
pub struct NewJob {
    pub command: String,
    pub artifact_id: String,
    pub user: String,
    pub git_repo_url: Option<String>,
    pub git_branch: Option<String>,
    pub priority: i64,
    pub num_gpus: u32,
    pub gpu_idxs: Option<Vec<u32>>,
    pub ignore_blacklist: bool,
    pub env: HashMap<String, String>,
    pub jobrc: Option<String>,
    pub integrations: Vec<String>,
    pub notifications: Vec<String>,
}

pub fn create_job(params: NewJob) -> Job {
    Job {
        id: super::ids::generate_job_id(),
        command: params.command.trim().to_string(),
        artifact_id: params.artifact_id,
        user: params.user,
        git_repo_url: params.git_repo_url,
        git_branch: params.git_branch,
        status: JobStatus::Queued,
        created_at: super::now_ts(),
        priority: params.priority,
        num_gpus: params.num_gpus,
        gpu_idxs: params.gpu_idxs,
        ignore_blacklist: params.ignore_blacklist,
        env: params.env,
        jobrc: params.jobrc,
        integrations: params.integrations,
        notifications: params.notifications,
        ..Job::default()
    }
}

/// Queue order: priority descending, arrival ascending on ties.
pub fn sort_queue(mut queued: Vec<Job>) -> Vec<Job> {
    queued.sort_by(|a, b| {
        b.priority.cmp(&a.priority).then(
            a.created_at
                .partial_cmp(&b.created_at)
                .unwrap_or(std::cmp::Ordering::Equal),
        )
    });
    queued
}

pub fn session_name(job_id: &str) -> String {
    format!("nexus_job_{job_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Killed,
        ] {
            let s = status.to_string();
            assert_eq!(s, s.to_lowercase());
            assert_eq!(s.parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Killed.is_terminal());
    }

    #[test]
    fn test_queue_ordering() {
        let mk = |id: &str, priority: i64, created_at: f64| Job {
            id: id.to_string(),
            priority,
            created_at,
            ..Job::default()
        };
        let sorted = sort_queue(vec![
            mk("a", 0, 30.0),
            mk("b", 5, 20.0),
            mk("c", 5, 10.0),
            mk("d", 0, 5.0),
        ]);
        let ids: Vec<&str> = sorted.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "d", "a"]);
    }

    #[test]
    fn test_create_job_defaults() {
        let job = create_job(NewJob {
            command: "  echo hi  ".to_string(),
            artifact_id: "abc".to_string(),
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
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.command, "echo hi");
        assert_eq!(job.id.len(), 6);
        assert!(job.node.is_none());
        assert!(job.pid.is_none());
        assert!(job.started_at.is_none());
        assert!(!job.marked_for_kill);
    }

    #[test]
    fn test_session_name() {
        assert_eq!(session_name("abc123"), "nexus_job_abc123");
    }
}
