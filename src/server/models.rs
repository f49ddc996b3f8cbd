use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{FieldError, NexusError};
use crate::integrations::system::HealthCheckResult;

/// Environment variables each integration requires at submission time.
const REQUIRED_ENV_VARS: &[(&str, &[&str])] = &[
    ("wandb", &["WANDB_API_KEY", "WANDB_ENTITY"]),
    ("discord", &["DISCORD_USER_ID", "DISCORD_WEBHOOK_URL"]),
    ("whatsapp", &["WHATSAPP_TO_NUMBER", "TEXTMEBOT_API_KEY"]),
    (
        "phone",
        &[
            "TWILIO_ACCOUNT_SID",
            "TWILIO_AUTH_TOKEN",
            "TWILIO_FROM_NUMBER",
            "PHONE_TO_NUMBER",
        ],
    ),
];

const KNOWN_NOTIFICATION_CHANNELS: &[&str] = &["discord", "whatsapp", "phone"];

#[derive(Debug, Deserialize)]
pub struct JobRequest {
    pub command: String,
    pub artifact_id: String,
    pub user: String,
    #[serde(default)]
    pub git_repo_url: Option<String>,
    #[serde(default)]
    pub git_branch: Option<String>,
    #[serde(default = "default_num_gpus")]
    pub num_gpus: u32,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub search_wandb: bool,
    #[serde(default)]
    pub notifications: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub jobrc: Option<String>,
    #[serde(default)]
    pub gpu_idxs: Option<Vec<u32>>,
    #[serde(default)]
    pub ignore_blacklist: bool,
}

fn default_num_gpus() -> u32 {
    1
}

impl JobRequest {
    /// Submission-time validation: request shape plus the per-integration
    /// required-env matrix. All problems are reported at once.
    pub fn validate(&self) -> Result<(), NexusError> {
        let mut errors = Vec::new();

        if self.command.trim().is_empty() {
            errors.push(FieldError::new("command", "cannot be empty"));
        }
        if self.artifact_id.trim().is_empty() {
            errors.push(FieldError::new("artifact_id", "cannot be empty"));
        }
        if self.user.trim().is_empty() {
            errors.push(FieldError::new("user", "cannot be empty"));
        }
        if self.num_gpus == 0 && self.gpu_idxs.is_none() {
            errors.push(FieldError::new("num_gpus", "must be a positive integer"));
        }
        if let Some(idxs) = &self.gpu_idxs {
            if idxs.is_empty() {
                errors.push(FieldError::new("gpu_idxs", "cannot be an empty list"));
            }
        }

        for channel in &self.notifications {
            if !KNOWN_NOTIFICATION_CHANNELS.contains(&channel.as_str()) {
                errors.push(FieldError::new(
                    "notifications",
                    format!("unknown notification channel '{channel}'"),
                ));
            }
        }

        if self.search_wandb {
            self.check_required_env("wandb", &mut errors);
        }
        for channel in &self.notifications {
            self.check_required_env(channel, &mut errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(NexusError::Validation(errors))
        }
    }

    fn check_required_env(&self, integration: &str, errors: &mut Vec<FieldError>) {
        let Some((_, required)) = REQUIRED_ENV_VARS
            .iter()
            .find(|(name, _)| *name == integration)
        else {
            return;
        };
        for key in *required {
            if !self.env.contains_key(*key) {
                errors.push(FieldError::new(
                    format!("env.{key}"),
                    format!("required for {integration}"),
                ));
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct JobListQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub gpu_idx: Option<u32>,
    #[serde(default)]
    pub command_regex: Option<String>,
}

/// Fields a queued job may still change.
#[derive(Debug, Deserialize)]
pub struct JobUpdateRequest {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ServerStatusResponse {
    pub gpu_count: usize,
    pub queued_jobs: i64,
    pub running_jobs: i64,
    pub completed_jobs: i64,
    pub failed_jobs: i64,
    pub killed_jobs: i64,
    pub node_name: String,
    pub server_user: String,
    pub server_version: String,
}

#[derive(Debug, Serialize)]
pub struct ServerLogsResponse {
    pub logs: String,
}

#[derive(Debug, Serialize)]
pub struct JobLogsResponse {
    pub logs: String,
}

#[derive(Debug, Serialize)]
pub struct BlacklistResponse {
    pub gpu_idx: u32,
    pub changed: bool,
}

#[derive(Debug, Serialize)]
pub struct JobActionError {
    pub id: String,
    pub error: String,
}

/// Outcome of a bulk kill request: per-job success or error.
#[derive(Debug, Serialize)]
pub struct JobActionResponse {
    pub killed: Vec<String>,
    pub failed: Vec<JobActionError>,
}

/// Outcome of a bulk remove request.
#[derive(Debug, Serialize)]
pub struct JobQueueActionResponse {
    pub removed: Vec<String>,
    pub failed: Vec<JobActionError>,
}

#[derive(Debug, Serialize)]
pub struct ServerActionResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct ArtifactResponse {
    pub data: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse(pub HealthCheckResult);

#[cfg(test)]
mod tests {
    use super::*;

    fn base_request() -> JobRequest {
        JobRequest {
            command: "echo hi".to_string(),
            artifact_id: "abc".to_string(),
            user: "alice".to_string(),
            git_repo_url: None,
            git_branch: None,
            num_gpus: 1,
            priority: 0,
            search_wandb: false,
            notifications: vec![],
            env: HashMap::new(),
            jobrc: None,
            gpu_idxs: None,
            ignore_blacklist: false,
        }
    }

    fn field_names(err: NexusError) -> Vec<String> {
        match err {
            NexusError::Validation(fields) => fields.into_iter().map(|f| f.field).collect(),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_request_passes() {
        assert!(base_request().validate().is_ok());
    }

    #[test]
    fn test_empty_command_rejected() {
        let mut req = base_request();
        req.command = "   ".to_string();
        assert_eq!(field_names(req.validate().unwrap_err()), vec!["command"]);
    }

    #[test]
    fn test_wandb_env_matrix() {
        let mut req = base_request();
        req.search_wandb = true;
        let fields = field_names(req.validate().unwrap_err());
        assert!(fields.contains(&"env.WANDB_API_KEY".to_string()));
        assert!(fields.contains(&"env.WANDB_ENTITY".to_string()));

        req.env
            .insert("WANDB_API_KEY".to_string(), "k".to_string());
        req.env.insert("WANDB_ENTITY".to_string(), "e".to_string());
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_notification_env_matrix() {
        let mut req = base_request();
        req.notifications = vec!["discord".to_string(), "phone".to_string()];
        let fields = field_names(req.validate().unwrap_err());
        assert!(fields.contains(&"env.DISCORD_USER_ID".to_string()));
        assert!(fields.contains(&"env.DISCORD_WEBHOOK_URL".to_string()));
        assert!(fields.contains(&"env.TWILIO_ACCOUNT_SID".to_string()));
        assert!(fields.contains(&"env.PHONE_TO_NUMBER".to_string()));
    }

    #[test]
    fn test_unknown_channel_rejected() {
        let mut req = base_request();
        req.notifications = vec!["pager".to_string()];
        assert_eq!(
            field_names(req.validate().unwrap_err()),
            vec!["notifications"]
        );
    }

    #[test]
    fn test_zero_gpus_rejected_unless_fixed_idxs() {
        let mut req = base_request();
        req.num_gpus = 0;
        assert_eq!(field_names(req.validate().unwrap_err()), vec!["num_gpus"]);

        req.gpu_idxs = Some(vec![1]);
        assert!(req.validate().is_ok());

        req.gpu_idxs = Some(vec![]);
        assert_eq!(field_names(req.validate().unwrap_err()), vec!["gpu_idxs"]);
    }
}
