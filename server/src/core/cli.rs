use clap::Parser;

use std::path::PathBuf;

use super::constants::{
    ENV_CONFIG, ENV_DATA_DIR, ENV_HTTP_ADDRESS, ENV_HTTP_PORT, ENV_MEM_QUEUE_SIZE,
    ENV_MSG_TIMEOUT, ENV_SPILL, ENV_TCP_ADDRESS, ENV_TCP_PORT,
};

#[derive(Parser)]
#[command(name = "carrier")]
#[command(version, about = "In-memory publish/subscribe message broker", long_about = None)]
pub struct Cli {
    /// TCP listen address for the line protocol
    #[arg(long, env = ENV_TCP_ADDRESS)]
    pub tcp_address: Option<String>,

    /// TCP listen port for the line protocol
    #[arg(long, env = ENV_TCP_PORT)]
    pub tcp_port: Option<u16>,

    /// HTTP listen address for the ingestion surface
    #[arg(long, env = ENV_HTTP_ADDRESS)]
    pub http_address: Option<String>,

    /// HTTP listen port for the ingestion surface
    #[arg(long, env = ENV_HTTP_PORT)]
    pub http_port: Option<u16>,

    /// Number of messages to keep in memory per topic and per channel
    #[arg(long, env = ENV_MEM_QUEUE_SIZE)]
    pub mem_queue_size: Option<usize>,

    /// Seconds an unacknowledged delivery may wait before it is requeued
    #[arg(long, env = ENV_MSG_TIMEOUT)]
    pub msg_timeout: Option<u64>,

    /// Persist channel overflow to disk instead of dropping it
    #[arg(long, env = ENV_SPILL)]
    pub spill: Option<bool>,

    /// Directory for spill queue files
    #[arg(long, env = ENV_DATA_DIR)]
    pub data_dir: Option<PathBuf>,

    /// Path to config file
    #[arg(long, short = 'c', env = ENV_CONFIG)]
    pub config: Option<PathBuf>,
}

/// Configuration derived from CLI arguments
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub tcp_address: Option<String>,
    pub tcp_port: Option<u16>,
    pub http_address: Option<String>,
    pub http_port: Option<u16>,
    pub mem_queue_size: Option<usize>,
    pub msg_timeout: Option<u64>,
    pub spill: Option<bool>,
    pub data_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

/// Parse CLI arguments
pub fn parse() -> CliConfig {
    let cli = Cli::parse();
    CliConfig {
        tcp_address: cli.tcp_address,
        tcp_port: cli.tcp_port,
        http_address: cli.http_address,
        http_port: cli.http_port,
        mem_queue_size: cli.mem_queue_size,
        msg_timeout: cli.msg_timeout,
        spill: cli.spill,
        data_dir: cli.data_dir,
        config: cli.config,
    }
}
