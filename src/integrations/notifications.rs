//! Callbacks fired on job state transitions. Delivery is best-effort:
//! every failure is logged and dropped, and no callback may block or fail
//! job progress.

use serde_json::json;
use std::fmt;
use std::time::Duration;

use crate::core::{runner, Context, Job};
use crate::integrations::nullpointer;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);
const DISCORD_START_MESSAGE_KEY: &str = "discord_start_job";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobAction {
    Started,
    Completed,
    Failed,
    Killed,
}

impl fmt::Display for JobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobAction::Started => "started",
            JobAction::Completed => "completed",
            JobAction::Failed => "failed",
            JobAction::Killed => "killed",
        };
        f.write_str(s)
    }
}

impl JobAction {
    fn emoji(&self) -> &'static str {
        match self {
            JobAction::Started => ":rocket:",
            JobAction::Completed => ":checkered_flag:",
            JobAction::Failed => ":interrobang:",
            JobAction::Killed => ":octagonal_sign:",
        }
    }

    fn embed_color(&self) -> u32 {
        match self {
            JobAction::Started => 0x3498DB,
            JobAction::Completed => 0x2ECC71,
            JobAction::Failed => 0xE74C3C,
            JobAction::Killed => 0xF39C12,
        }
    }

    fn is_terminal(&self) -> bool {
        !matches!(self, JobAction::Started)
    }
}

/// Deliver the configured callbacks for a transition. Returns the job with
/// any externally-issued message ids folded into `notification_messages`.
pub async fn notify_job_action(ctx: &Context, job: &Job, action: JobAction) -> Job {
    let mut updated = job.clone();

    for channel in &job.notifications {
        let result = match channel.as_str() {
            "discord" => notify_discord(ctx, &mut updated, action).await,
            "whatsapp" => notify_whatsapp(ctx, job, action).await,
            "phone" => notify_phone(ctx, job, action).await,
            other => {
                tracing::warn!(job_id = %job.id, "Unknown notification channel: {other}");
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::warn!(
                job_id = %job.id,
                channel = %channel,
                "Notification delivery failed: {e}"
            );
        }
    }

    updated
}

/// Rewrite the start message once the tracker URL is known.
pub async fn update_notification_with_wandb(ctx: &Context, job: &Job) {
    if !job.notifications.iter().any(|c| c == "discord") {
        return;
    }
    let (Some(webhook_url), Some(message_id)) = (
        job.env.get("DISCORD_WEBHOOK_URL"),
        job.notification_messages.get(DISCORD_START_MESSAGE_KEY),
    ) else {
        return;
    };

    let payload = discord_payload(job, JobAction::Started);
    let edit_url = format!("{webhook_url}/messages/{message_id}");
    let result = ctx
        .http
        .patch(&edit_url)
        .timeout(DELIVERY_TIMEOUT)
        .json(&payload)
        .send()
        .await;

    match result {
        Ok(resp) if resp.status().is_success() => {
            tracing::info!(job_id = %job.id, "Updated start notification with tracker URL");
        }
        Ok(resp) => {
            tracing::warn!(job_id = %job.id, "Notification edit rejected: {}", resp.status());
        }
        Err(e) => {
            tracing::warn!(job_id = %job.id, "Notification edit failed: {e}");
        }
    }
}

async fn notify_discord(
    ctx: &Context,
    job: &mut Job,
    action: JobAction,
) -> Result<(), anyhow::Error> {
    let webhook_url = job
        .env
        .get("DISCORD_WEBHOOK_URL")
        .ok_or_else(|| anyhow::anyhow!("missing DISCORD_WEBHOOK_URL in job environment"))?
        .clone();

    let mut payload = discord_payload(job, action);
    if matches!(action, JobAction::Failed | JobAction::Killed) {
        if let Some(tail) = runner::read_job_logs(job.dir.as_deref(), Some(20)).await {
            if let Some(fields) = payload["embeds"][0]["fields"].as_array_mut() {
                fields.push(json!({
                    "name": "Last few log lines",
                    "value": format!("```\n{tail}\n```"),
                }));
            }
        }
    }
    if action.is_terminal() {
        if let Some(logs_url) = upload_full_logs(ctx, job).await {
            if let Some(fields) = payload["embeds"][0]["fields"].as_array_mut() {
                fields.push(json!({
                    "name": "Full logs",
                    "value": format!("[View full logs]({logs_url})"),
                }));
            }
        }
    }

    if action == JobAction::Started {
        // wait=true makes the webhook return the created message, whose id
        // we keep for the later tracker-URL edit.
        let resp = ctx
            .http
            .post(&webhook_url)
            .query(&[("wait", "true")])
            .timeout(DELIVERY_TIMEOUT)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        let body: serde_json::Value = resp.json().await?;
        if let Some(id) = body.get("id").and_then(|v| v.as_str()) {
            job.notification_messages
                .insert(DISCORD_START_MESSAGE_KEY.to_string(), id.to_string());
        }
    } else {
        ctx.http
            .post(&webhook_url)
            .timeout(DELIVERY_TIMEOUT)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
    }
    Ok(())
}

async fn upload_full_logs(ctx: &Context, job: &Job) -> Option<String> {
    let logs = runner::read_job_logs(job.dir.as_deref(), None).await?;
    if logs.is_empty() {
        return None;
    }
    let instance_url = job.env.get("NULLPOINTER_URL").map(|s| s.as_str());
    let paste_url = nullpointer::upload_text(ctx, logs, instance_url).await?;
    tracing::info!(job_id = %job.id, url = %paste_url, "Uploaded job logs");
    Some(paste_url)
}

fn discord_payload(job: &Job, action: JobAction) -> serde_json::Value {
    let user_mention = job
        .env
        .get("DISCORD_USER_ID")
        .map(|id| format!("<@{id}>"))
        .unwrap_or_default();
    let gpus = job
        .gpu_idxs_assigned
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let node = job.node.as_deref().unwrap_or("-");

    let wandb = if action == JobAction::Started && job.wandb_url.is_none() {
        "Pending ...".to_string()
    } else {
        job.wandb_url.clone().unwrap_or_else(|| "Not Found".to_string())
    };
    let git = format!(
        "{} - Branch: {}",
        job.git_repo_url.as_deref().unwrap_or("-"),
        job.git_branch.as_deref().unwrap_or("-"),
    );

    let mut fields = vec![
        json!({"name": "Command", "value": job.command}),
        json!({"name": "W&B", "value": wandb}),
        json!({"name": "Git", "value": git}),
        json!({"name": "User", "value": job.user, "inline": true}),
    ];
    if let Some(error) = &job.error_message {
        if action.is_terminal() {
            fields.insert(1, json!({"name": "Error Message", "value": error}));
        }
    }

    json!({
        "content": format!(
            "{} **Job {} {action} on GPU {gpus} - ({node})** - {user_mention}",
            action.emoji(),
            job.id,
        ),
        "username": "Nexus",
        "embeds": [{
            "fields": fields,
            "color": action.embed_color(),
            "footer": {"text": format!("Job Status Update - {}", job.id)},
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }],
    })
}

fn messaging_text(job: &Job, action: JobAction) -> String {
    let gpus = job
        .gpu_idxs_assigned
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let node = job.node.as_deref().unwrap_or("-");

    let mut parts = vec![
        format!("*Nexus Job {} {action}* on GPU {gpus} - ({node})", job.id),
        format!("*Command:* {}", job.command),
        format!("*User:* {}", job.user),
    ];
    if action.is_terminal() {
        if let Some(error) = &job.error_message {
            parts.insert(1, format!("*Error:* {error}"));
        }
    }
    parts.join("\n")
}

async fn notify_whatsapp(ctx: &Context, job: &Job, action: JobAction) -> Result<(), anyhow::Error> {
    let to_number = job
        .env
        .get("WHATSAPP_TO_NUMBER")
        .ok_or_else(|| anyhow::anyhow!("missing WHATSAPP_TO_NUMBER in job environment"))?;
    let api_key = job
        .env
        .get("TEXTMEBOT_API_KEY")
        .ok_or_else(|| anyhow::anyhow!("missing TEXTMEBOT_API_KEY in job environment"))?;

    let mut text = messaging_text(job, action);
    if matches!(action, JobAction::Failed | JobAction::Killed) {
        if let Some(tail) = runner::read_job_logs(job.dir.as_deref(), Some(10)).await {
            text.push_str(&format!("\n\n*Last few log lines:*\n```{tail}```"));
        }
    }
    if action.is_terminal() {
        if let Some(logs_url) = upload_full_logs(ctx, job).await {
            text.push_str(&format!("\n\n*Full logs:* {logs_url}"));
        }
    }

    let resp = ctx
        .http
        .get("https://api.textmebot.com/send.php")
        .query(&[
            ("recipient", to_number.trim_start_matches('+')),
            ("apikey", api_key.as_str()),
            ("text", text.as_str()),
        ])
        .timeout(DELIVERY_TIMEOUT)
        .send()
        .await?;
    resp.error_for_status()?;
    Ok(())
}

/// Phone calls only make sense for terminal transitions; a start never
/// rings anyone.
async fn notify_phone(ctx: &Context, job: &Job, action: JobAction) -> Result<(), anyhow::Error> {
    if !action.is_terminal() {
        return Ok(());
    }

    let sid = job
        .env
        .get("TWILIO_ACCOUNT_SID")
        .ok_or_else(|| anyhow::anyhow!("missing TWILIO_ACCOUNT_SID in job environment"))?;
    let token = job
        .env
        .get("TWILIO_AUTH_TOKEN")
        .ok_or_else(|| anyhow::anyhow!("missing TWILIO_AUTH_TOKEN in job environment"))?;
    let from = job
        .env
        .get("TWILIO_FROM_NUMBER")
        .ok_or_else(|| anyhow::anyhow!("missing TWILIO_FROM_NUMBER in job environment"))?;
    let to = job
        .env
        .get("PHONE_TO_NUMBER")
        .ok_or_else(|| anyhow::anyhow!("missing PHONE_TO_NUMBER in job environment"))?;

    let twiml = format!(
        "<Response><Say>Your job {} has {action}.</Say></Response>",
        job.id
    );
    let url = format!("https://api.twilio.com/2010-04-01/Accounts/{sid}/Calls.json");
    let resp = ctx
        .http
        .post(&url)
        .basic_auth(sid, Some(token))
        .form(&[("To", to.as_str()), ("From", from.as_str()), ("Twiml", twiml.as_str())])
        .timeout(DELIVERY_TIMEOUT)
        .send()
        .await?;
    resp.error_for_status()?;
    Ok(())
}
