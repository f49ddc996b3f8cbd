use crate::config::Config;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global subscriber: human-readable output on stderr plus a
/// daily-rolling file under `<server_dir>/logs/`. The returned guard must be
/// kept alive for the lifetime of the daemon so buffered lines are flushed.
pub fn init(config: &Config) -> anyhow::Result<(WorkerGuard, PathBuf)> {
    let log_dir = config.server_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "nexusd.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter()));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    Ok((guard, log_dir))
}

/// Path of the file the daily appender is currently writing to.
pub fn current_log_path(log_dir: &Path) -> PathBuf {
    log_dir.join(format!(
        "nexusd.log.{}",
        chrono::Utc::now().format("%Y-%m-%d")
    ))
}

/// Tail of the daemon log, capped to `max_bytes` from the end of the file.
pub async fn read_log_tail(log_dir: &Path, max_bytes: usize) -> String {
    let path = current_log_path(log_dir);
    let Ok(bytes) = tokio::fs::read(&path).await else {
        return String::new();
    };
    let start = bytes.len().saturating_sub(max_bytes);
    let tail = String::from_utf8_lossy(&bytes[start..]);
    if start == 0 {
        return tail.into_owned();
    }
    // Resync to the next line boundary after the byte cut.
    match tail.find('\n') {
        Some(nl) => tail[nl + 1..].to_string(),
        None => tail.into_owned(),
    }
}
