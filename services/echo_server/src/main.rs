//! Echo port service
//!
//! Usage:
//!   echo-server --config config/echo.toml
//!   PORT_TRANSPORT__URL=tcp://0.0.0.0:7410 echo-server

use anyhow::{bail, Context, Result};
use clap::Parser;
use config::PortConfig;
use echo_server::{echo_backend, EchoState};
use network::{TransportFactory, TransportKind};
use port::{FirstComeFirstServe, Server};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "echo-server")]
#[command(about = "Serve the echo endpoint catalog over the port protocol")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error) or a full filter directive
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("Starting echo server");
    let config = PortConfig::load(args.config.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {:#}", e);
        e
    })?;

    if config.transport.kind != TransportKind::Socket {
        bail!("echo-server only serves socket transports; set transport.kind = \"socket\"");
    }

    let state = EchoState::new();
    let backend = echo_backend(state).context("Failed to build echo backend")?;
    let authenticator = FirstComeFirstServe::with_release_callback(|client| {
        info!(client, "Client disconnected");
    });
    let server = Server::new(
        Arc::new(backend),
        Arc::new(authenticator),
        config.server_options(),
    );

    let listener = TransportFactory::bind(&config.transport)
        .await
        .with_context(|| format!("Failed to bind {}", config.transport.url))?;

    tokio::select! {
        result = server.serve_socket(listener) => {
            result.context("Accept loop failed")?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to install CTRL+C handler")?;
            info!("Received shutdown signal");
        }
    }

    Ok(())
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("Invalid log level")?;

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if args.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}
