use crate::core::session::SessionBackend;
use crate::error::NexusError;
use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use tmux_interface::{HasSession, KillSession, ListPanes, Tmux};

/// Session backend over tmux. Each job runs in a detached session named
/// `nexus_job_<id>`; users can `tmux attach -t` it to watch the job live.
pub struct TmuxBackend;

impl TmuxBackend {
    /// Daemon startup precondition: the session tool must be on PATH.
    pub fn available() -> bool {
        Command::new("tmux")
            .arg("-V")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
}

impl SessionBackend for TmuxBackend {
    fn start(
        &self,
        name: &str,
        script: &Path,
        env: &HashMap<String, String>,
    ) -> Result<(), NexusError> {
        // Spawned directly so the job environment travels with the session
        // command rather than leaking through the tmux server environment.
        let output = Command::new("tmux")
            .args(["new-session", "-d", "-s", name])
            .arg(script)
            .env_clear()
            .envs(env)
            .output()
            .map_err(|e| NexusError::Runner(format!("failed to launch tmux session: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NexusError::Runner(format!(
                "tmux new-session exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }

    fn session_exists(&self, name: &str) -> bool {
        Tmux::with_command(HasSession::new().target_session(name))
            .output()
            .map(|output| output.success())
            .unwrap_or(false)
    }

    fn session_pid(&self, name: &str) -> Option<i64> {
        let output = Tmux::with_command(
            ListPanes::new()
                .target(name)
                .format("#{pane_pid}"),
        )
        .output()
        .ok()?;

        if !output.success() {
            return None;
        }
        let stdout = output.stdout();
        String::from_utf8_lossy(&stdout)
            .lines()
            .next()?
            .trim()
            .parse()
            .ok()
    }

    fn kill(&self, name: &str) {
        let _ = Tmux::with_command(KillSession::new().target_session(name)).output();
    }
}
