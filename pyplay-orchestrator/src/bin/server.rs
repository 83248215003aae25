//! pyplay server binary

use anyhow::{Context, Result};
use pyplay::api::{ApiState, create_router};
use pyplay::{InterpreterBackend, Playground, PlaygroundConfig, Session};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting pyplay server v{}", env!("CARGO_PKG_VERSION"));

    // Load config from file
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "pyplay.toml".to_string());

    let config_contents = std::fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read config file: {}", config_path))?;

    let config = PlaygroundConfig::from_toml_str(&config_contents)
        .with_context(|| format!("Failed to parse config file: {}", config_path))?;

    info!(
        config_path = config_path,
        backend = match config.interpreter.backend {
            InterpreterBackend::Process => "process",
            InterpreterBackend::Embedded => "embedded",
        },
        scratch_dir = %config.interpreter.scratch_dir().display(),
        "Loaded configuration"
    );

    let playground = Playground::from_config(&config).context("Failed to set up playground")?;
    info!(samples = playground.manifest().len(), "Manifest loaded");

    // One session for the whole server; the empty fragment selects the default
    let session = Session::spawn(playground, "");
    let app = create_router(Arc::new(ApiState { session }));

    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address: {}", config.server.bind))?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
