use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "nexusd", version, about = "Distributed GPU job scheduler daemon")]
pub struct Nexusd {
    /// Path to a TOML config file (defaults to <server_dir>/nexusd.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Use a fixed two-device GPU table instead of querying nvidia-smi
    #[arg(long)]
    pub mock_gpus: bool,
}
