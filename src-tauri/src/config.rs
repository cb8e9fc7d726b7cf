//! Daemon configuration: command line layered over an optional TOML file.
//!
//! Precedence is CLI, then `config.toml`, then built-in defaults.

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use thiserror::Error;

use crate::host::DEFAULT_EMIT_INTERVAL;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:4732";
pub const CONFIG_FILE: &str = "config.toml";
const DATA_DIR_NAME: &str = "channel-bridge-web";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid listen address `{value}`: {source}")]
    InvalidListen {
        value: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("token requires a non-empty value")]
    EmptyToken,

    #[error("emit interval must be greater than zero")]
    ZeroInterval,
}

/// Channel bridge WebSocket daemon
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "channel-bridge-web", version, about = "Channel bridge WebSocket daemon")]
pub struct Cli {
    /// Bind address (default: 127.0.0.1:4732)
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<String>,

    /// Data dir holding settings.json and config.toml
    #[arg(long, value_name = "PATH")]
    pub data_dir: Option<PathBuf>,

    /// Optional shared token required by clients
    #[arg(long, env = "CHANNEL_BRIDGE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Milliseconds between emitted channel events (default: 10)
    #[arg(long, value_name = "MS")]
    pub emit_interval_ms: Option<u64>,

    /// Config file (default: <data-dir>/config.toml)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct FileConfig {
    listen: Option<String>,
    token: Option<String>,
    emit_interval_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub listen: SocketAddr,
    pub token: Option<String>,
    pub data_dir: PathBuf,
    pub emit_interval: Duration,
}

impl DaemonConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
        let file = match &cli.config {
            Some(path) => read_file_config(path, true)?,
            None => read_file_config(&data_dir.join(CONFIG_FILE), false)?,
        };

        let listen_raw = cli
            .listen
            .clone()
            .or(file.listen)
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let listen = listen_raw
            .trim()
            .parse::<SocketAddr>()
            .map_err(|source| ConfigError::InvalidListen {
                value: listen_raw.clone(),
                source,
            })?;

        let token = match cli.token.clone().or(file.token) {
            Some(value) if value.trim().is_empty() => return Err(ConfigError::EmptyToken),
            Some(value) => Some(value.trim().to_string()),
            None => None,
        };

        let emit_interval = match cli.emit_interval_ms.or(file.emit_interval_ms) {
            Some(0) => return Err(ConfigError::ZeroInterval),
            Some(ms) => Duration::from_millis(ms),
            None => DEFAULT_EMIT_INTERVAL,
        };

        Ok(Self {
            listen,
            token,
            data_dir,
            emit_interval,
        })
    }
}

fn read_file_config(path: &Path, required: bool) -> Result<FileConfig, ConfigError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if !required && err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(FileConfig::default());
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn default_data_dir() -> PathBuf {
    if let Ok(xdg) = env::var("XDG_DATA_HOME") {
        let trimmed = xdg.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed).join(DATA_DIR_NAME);
        }
    }
    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".local").join("share").join(DATA_DIR_NAME)
}
