//! Core application infrastructure

pub mod cli;
pub mod config;
pub mod constants;
pub mod shutdown;

pub use crate::app::BrokerApp;
pub use cli::CliConfig;
pub use config::{AppConfig, BrokerConfig, ServerConfig};
pub use shutdown::ShutdownService;
