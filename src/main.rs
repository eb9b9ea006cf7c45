//! Container SSH Gateway
//!
//! An SSH server that authenticates users against the platform's identity
//! service, lists their containers in a small menu and relays the chosen
//! terminal session to the container's own SSH daemon.

mod channel_io;
mod config;
mod directory;
mod host_key;
mod menu;
mod relay;
mod ssh;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

use crate::config::GatewayConfig;
use crate::directory::{Container, DirectoryClient};
use crate::relay::RelayEngine;

/// Container SSH Gateway - SSH access to your platform containers
#[derive(Parser, Debug)]
#[command(name = "container-gateway", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/container-gateway/gateway.toml")]
    config: PathBuf,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Override the SSH listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that a container's SSH daemon accepts the backend login
    CheckHealth {
        /// Backend SSH port of the container
        #[arg(long)]
        port: u16,

        /// Label used in the report
        #[arg(long, default_value = "container")]
        name: String,
    },

    /// Ask the identity service whether a token is still valid
    ValidateToken {
        /// Bearer token
        token: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Handle --generate-config
    if cli.generate_config {
        let config = GatewayConfig::default();
        let content = toml::to_string_pretty(&config)?;
        println!("{}", content);
        return Ok(ExitCode::SUCCESS);
    }

    // Load configuration
    let mut config = GatewayConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    // Apply CLI overrides
    if let Some(port) = cli.port {
        config.ssh_port = port;
    }

    let config = Arc::new(config);

    match cli.command {
        Some(Command::CheckHealth { port, name }) => check_health(&config, port, name).await,
        Some(Command::ValidateToken { token }) => validate_token(&config, &token).await,
        None => serve(config).await,
    }
}

async fn serve(config: Arc<GatewayConfig>) -> Result<ExitCode> {
    // Ensure required directories exist
    config.ensure_dirs()?;

    info!("Starting container-gateway");
    info!("  SSH port: {}", config.ssh_port);
    info!("  Identity service: {}", config.api_base_url);
    info!("  Backend host: {}", config.backend.host);

    let host_key = host_key::load_or_generate(&config.host_key_path)
        .await
        .context("Failed to prepare host key")?;
    info!("Host key fingerprint: {}", host_key::fingerprint(&host_key));

    // Run SSH server until interrupted
    tokio::select! {
        result = ssh::run_server(config, host_key) => result?,
        _ = tokio::signal::ctrl_c() => info!("Received interrupt, shutting down"),
    }

    Ok(ExitCode::SUCCESS)
}

async fn check_health(config: &GatewayConfig, port: u16, name: String) -> Result<ExitCode> {
    let engine = RelayEngine::new(Arc::new(config.backend.clone()));
    let container = Container {
        name,
        ssh_port: port,
        running: true,
        ..Default::default()
    };

    match engine.check_health(&container).await {
        Ok(()) => {
            info!("Container {} is healthy", container.name);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!("Container {} health check failed: {}", container.name, e);
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn validate_token(config: &GatewayConfig, token: &str) -> Result<ExitCode> {
    let directory = DirectoryClient::new(&config.api_base_url)
        .context("Failed to create identity service client")?;

    match directory.validate_token(token).await {
        Ok(()) => {
            info!("Token is valid");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!("Token rejected: {}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}
