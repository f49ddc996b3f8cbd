use clap::Parser;
use std::sync::Arc;

mod cli;

use nexusd::core::db::Database;
use nexusd::core::Context;
use nexusd::tmux::TmuxBackend;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Nexusd::parse();

    let mut config = nexusd::config::load_config(args.config.as_ref())?;
    if args.mock_gpus {
        config.mock_gpus = true;
    }

    let (_guard, log_dir) = nexusd::logging::init(&config)?;

    if !config.mock_gpus && !TmuxBackend::available() {
        anyhow::bail!("tmux not found on PATH; the session tool is a startup requirement");
    }

    let db = Database::new(&config.store_endpoint)
        .map_err(|e| anyhow::anyhow!("cannot open store at {:?}: {e}", config.store_endpoint))?;
    db.health_check()
        .map_err(|e| anyhow::anyhow!("store unreachable: {e}"))?;

    tracing::info!(
        node = %config.node_name,
        store = ?config.store_endpoint,
        "nexusd {} starting",
        env!("CARGO_PKG_VERSION")
    );

    let ctx = Arc::new(Context::new(config, db, Arc::new(TmuxBackend), log_dir));
    nexusd::server::run(ctx).await
}
