//! Core application

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use crate::broker::Registry;
use crate::core::cli::{self, CliConfig};
use crate::core::config::AppConfig;
use crate::core::constants::{APP_NAME_LOWER, ENV_LOG};
use crate::core::shutdown::ShutdownService;
use crate::transport;

pub struct BrokerApp {
    pub config: AppConfig,
    pub registry: Registry,
    pub shutdown: ShutdownService,
}

impl BrokerApp {
    /// Run the application with CLI argument parsing
    pub async fn run() -> Result<()> {
        dotenvy::dotenv().ok();
        Self::init_logging();

        tracing::debug!("application starting");

        let cli_config = cli::parse();
        let app = Self::init(&cli_config)?;
        Self::start_server(app).await
    }

    fn init(cli: &CliConfig) -> Result<Self> {
        let config = AppConfig::load(cli)?;

        if config.broker.spill {
            std::fs::create_dir_all(&config.broker.data_dir).with_context(|| {
                format!(
                    "failed to create data directory: {}",
                    config.broker.data_dir.display()
                )
            })?;
            tracing::info!(dir = %config.broker.data_dir.display(), "spill queue enabled");
        }

        let registry = Registry::start(config.broker_options());
        let shutdown = ShutdownService::new(registry.clone());

        Ok(Self {
            config,
            registry,
            shutdown,
        })
    }

    fn init_logging() {
        let default_filter = format!("info,{}=info", APP_NAME_LOWER);

        let filter = std::env::var(ENV_LOG)
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or(default_filter);

        tracing_subscriber::fmt()
            .with_target(false)
            .with_thread_ids(false)
            .with_level(true)
            .with_ansi(true)
            .compact()
            .with_env_filter(filter)
            .init();
    }

    async fn start_server(app: Self) -> Result<()> {
        // Install signal handlers FIRST (before any blocking calls)
        app.shutdown.install_signal_handlers();

        let tcp_addr = SocketAddr::new(
            app.config
                .server
                .tcp_address
                .parse()
                .with_context(|| format!("invalid tcp address: {}", app.config.server.tcp_address))?,
            app.config.server.tcp_port,
        );
        let http_addr = SocketAddr::new(
            app.config
                .server
                .http_address
                .parse()
                .with_context(|| {
                    format!("invalid http address: {}", app.config.server.http_address)
                })?,
            app.config.server.http_port,
        );

        let tcp_listener = TcpListener::bind(tcp_addr)
            .await
            .with_context(|| format!("tcp listen ({tcp_addr}) failed"))?;
        let http_listener = TcpListener::bind(http_addr)
            .await
            .with_context(|| format!("http listen ({http_addr}) failed"))?;

        let tcp_task = {
            let registry = app.registry.clone();
            let shutdown_rx = app.shutdown.subscribe();
            tokio::spawn(async move {
                if let Err(e) = transport::tcp::serve(tcp_listener, registry, shutdown_rx).await {
                    tracing::error!(error = %e, "tcp server error");
                }
            })
        };
        app.shutdown.register(tcp_task).await;

        transport::http::serve(http_listener, app.registry.clone(), app.shutdown.clone()).await?;
        app.shutdown.shutdown().await;

        Ok(())
    }
}
