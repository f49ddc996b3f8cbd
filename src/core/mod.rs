pub mod db;
pub mod gpu;
pub mod ids;
pub mod job;
pub mod runner;
pub mod scheduler;
pub mod session;

pub use job::{Job, JobStatus};

use crate::config::Config;
use crate::core::db::Database;
use crate::core::session::SessionBackend;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Per-daemon context threaded through handlers and scheduler phases.
pub struct Context {
    pub config: Config,
    pub db: Database,
    pub sessions: Arc<dyn SessionBackend>,
    pub http: reqwest::Client,
    pub tracker_cache: crate::integrations::wandb::TrackerCache,
    /// Directory the rolling daemon log is written to.
    pub log_dir: PathBuf,
}

impl Context {
    pub fn new(
        config: Config,
        db: Database,
        sessions: Arc<dyn SessionBackend>,
        log_dir: PathBuf,
    ) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(concat!("nexusd/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            config,
            db,
            sessions,
            http,
            tracker_cache: crate::integrations::wandb::TrackerCache::new(),
            log_dir,
        }
    }
}

/// Current time as epoch seconds.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}
