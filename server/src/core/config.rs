use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::broker::{BrokerOptions, DEFAULT_MEM_QUEUE_SIZE, DEFAULT_MSG_TIMEOUT};

use super::cli::CliConfig;
use super::constants::{
    APP_NAME_LOWER, CONFIG_FILE_NAME, DEFAULT_HOST, DEFAULT_HTTP_PORT, DEFAULT_TCP_PORT,
};

// =============================================================================
// Server Config
// =============================================================================

/// Listen endpoints for both transports
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub tcp_address: String,
    pub tcp_port: u16,
    pub http_address: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_address: DEFAULT_HOST.to_string(),
            tcp_port: DEFAULT_TCP_PORT,
            http_address: DEFAULT_HOST.to_string(),
            http_port: DEFAULT_HTTP_PORT,
        }
    }
}

// =============================================================================
// Broker Config
// =============================================================================

/// Broker tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    /// Bound for every topic and channel in-memory buffer
    pub mem_queue_size: usize,
    /// Seconds an unacknowledged delivery may wait before it is requeued
    pub msg_timeout_secs: u64,
    /// Persist channel overflow to disk instead of dropping it
    pub spill: bool,
    /// Directory for spill queue files
    pub data_dir: PathBuf,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            mem_queue_size: DEFAULT_MEM_QUEUE_SIZE,
            msg_timeout_secs: DEFAULT_MSG_TIMEOUT.as_secs(),
            spill: false,
            data_dir: default_data_dir(),
        }
    }
}

/// Platform data directory, with a dotfile fallback for odd environments
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join(APP_NAME_LOWER))
        .unwrap_or_else(|| PathBuf::from(format!(".{APP_NAME_LOWER}")))
}

// =============================================================================
// App Config
// =============================================================================

/// Full application configuration, merged from CLI > env > config file >
/// defaults. Env vars are handled by the CLI layer.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub broker: BrokerConfig,
}

/// Optional-everything shape of the JSON config file
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    tcp_address: Option<String>,
    tcp_port: Option<u16>,
    http_address: Option<String>,
    http_port: Option<u16>,
    mem_queue_size: Option<usize>,
    msg_timeout_secs: Option<u64>,
    spill: Option<bool>,
    data_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn load(cli: &CliConfig) -> Result<Self> {
        let file = Self::load_file(cli)?;
        let defaults_server = ServerConfig::default();
        let defaults_broker = BrokerConfig::default();

        let config = Self {
            server: ServerConfig {
                tcp_address: cli
                    .tcp_address
                    .clone()
                    .or(file.tcp_address)
                    .unwrap_or(defaults_server.tcp_address),
                tcp_port: cli
                    .tcp_port
                    .or(file.tcp_port)
                    .unwrap_or(defaults_server.tcp_port),
                http_address: cli
                    .http_address
                    .clone()
                    .or(file.http_address)
                    .unwrap_or(defaults_server.http_address),
                http_port: cli
                    .http_port
                    .or(file.http_port)
                    .unwrap_or(defaults_server.http_port),
            },
            broker: BrokerConfig {
                mem_queue_size: cli
                    .mem_queue_size
                    .or(file.mem_queue_size)
                    .unwrap_or(defaults_broker.mem_queue_size),
                msg_timeout_secs: cli
                    .msg_timeout
                    .or(file.msg_timeout_secs)
                    .unwrap_or(defaults_broker.msg_timeout_secs),
                spill: cli.spill.or(file.spill).unwrap_or(defaults_broker.spill),
                data_dir: cli
                    .data_dir
                    .clone()
                    .or(file.data_dir)
                    .unwrap_or(defaults_broker.data_dir),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn load_file(cli: &CliConfig) -> Result<FileConfig> {
        let path = match &cli.config {
            Some(path) => path.clone(),
            None => {
                let default = PathBuf::from(CONFIG_FILE_NAME);
                if !default.exists() {
                    return Ok(FileConfig::default());
                }
                default
            }
        };
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        if self.broker.mem_queue_size == 0 {
            bail!("mem-queue-size must be at least 1");
        }
        if self.broker.msg_timeout_secs == 0 {
            bail!("msg-timeout must be at least 1 second");
        }
        Ok(())
    }

    /// The broker-core view of this configuration
    pub fn broker_options(&self) -> BrokerOptions {
        BrokerOptions {
            mem_queue_size: self.broker.mem_queue_size,
            msg_timeout: Duration::from_secs(self.broker.msg_timeout_secs),
            spill_dir: self.broker.spill.then(|| self.broker.data_dir.clone()),
        }
    }
}
