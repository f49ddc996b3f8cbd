use serde::Deserialize;
use std::path::PathBuf;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Directive string for the tracing env-filter.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Identity of this node in the shared store. Must be unique per daemon.
    #[serde(default = "default_node_name")]
    pub node_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
    /// Seconds between scheduler ticks.
    #[serde(default = "default_refresh_rate")]
    pub refresh_rate: u64,
    /// Use a fixed two-device GPU table instead of querying nvidia-smi.
    #[serde(default)]
    pub mock_gpus: bool,
    /// Shared bearer credential. Empty disables authentication.
    #[serde(default)]
    pub api_key: String,
    /// Location of the shared SQL store reachable from every node.
    #[serde(default = "default_store_endpoint")]
    pub store_endpoint: PathBuf,
    /// Daemon home for logs and local scratch.
    #[serde(default = "default_server_dir")]
    pub server_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            node_name: default_node_name(),
            log_level: default_log_level(),
            refresh_rate: default_refresh_rate(),
            mock_gpus: false,
            api_key: String::new(),
            store_endpoint: default_store_endpoint(),
            server_dir: default_server_dir(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    54322
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "node-0".to_string())
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_refresh_rate() -> u64 {
    3
}

fn default_server_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".nexusd")
}

fn default_store_endpoint() -> PathBuf {
    default_server_dir().join("nexus.db")
}

pub fn load_config(config_path: Option<&PathBuf>) -> Result<Config, config::ConfigError> {
    let mut config_vec = vec![];

    // User-provided config file
    if let Some(config_path) = config_path {
        if config_path.exists() {
            config_vec.push(config_path.clone());
        } else {
            eprintln!("Warning: Config file {config_path:?} not found.");
        }
    }

    // Default config file
    let default_config_path = default_server_dir().join("nexusd.toml");
    if default_config_path.exists() {
        config_vec.push(default_config_path);
    }

    let settings = config::Config::builder();
    let settings = config_vec.iter().fold(settings, |s, path| {
        s.add_source(config::File::from(path.as_path()))
    });

    settings
        .add_source(config::Environment::with_prefix("NS").try_parsing(true))
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.refresh_rate, 3);
        assert_eq!(config.port, 54322);
        assert!(!config.mock_gpus);
        assert!(config.api_key.is_empty());
    }

    #[test]
    fn test_log_level_parsing() {
        let config: Config = serde_json::from_str(r#"{"log_level": "warning"}"#).unwrap();
        assert_eq!(config.log_level, LogLevel::Warning);
        assert_eq!(config.log_level.as_filter(), "warn");
    }
}
