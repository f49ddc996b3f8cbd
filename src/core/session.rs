use crate::error::NexusError;
use std::collections::HashMap;
use std::path::Path;

/// Seam to the detachable-session tool hosting job supervisors. Anything
/// providing {start detached, existence check, native PID handle, quit}
/// satisfies the runner; tests substitute their own implementation.
pub trait SessionBackend: Send + Sync {
    /// Launch `script` detached inside a session called `name`, with exactly
    /// the given process environment.
    fn start(
        &self,
        name: &str,
        script: &Path,
        env: &HashMap<String, String>,
    ) -> Result<(), NexusError>;

    /// Whether a session with this name is currently listed.
    fn session_exists(&self, name: &str) -> bool;

    /// The PID of the session's supervising process, from the tool's own
    /// status query where available.
    fn session_pid(&self, name: &str) -> Option<i64>;

    /// Tear the session down. Best-effort; must not fail loudly.
    fn kill(&self, name: &str);
}
