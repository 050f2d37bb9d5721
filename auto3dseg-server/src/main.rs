//! auto3dseg-server: HTTP front end for Auto3DSeg inference.

use anyhow::Context;
use auto3dseg_core::config::load_config;
use auto3dseg_server::AppState;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Serve the model catalog and segmentation inference over HTTP
#[derive(Parser, Debug)]
#[command(name = "auto3dseg-server", version, about, long_about = None)]
struct Args {
    /// Host name or address to bind
    #[arg(long = "host", visible_alias = "ip")]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let filter = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let workspace = std::env::current_dir().ok();
    let mut config = load_config(workspace.as_deref(), args.config.as_deref(), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {e}"))?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    std::fs::create_dir_all(&config.server.session_root).with_context(|| {
        format!(
            "Cannot create session root {}",
            config.server.session_root.display()
        )
    })?;
    let state = AppState::from_config(&config).context("Failed to load model catalog")?;
    tracing::info!(models = state.catalog.models().len(), "Model catalog loaded");

    auto3dseg_server::serve(Arc::new(state), &config.server.bind_address(), shutdown_signal())
        .await
        .context("Server error")?;
    Ok(())
}
