//! auto3dseg CLI: run segmentations, manage the model cache and supervise
//! the inference server.

mod commands;

use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Auto3DSeg segmentation from the command line
#[derive(Parser, Debug)]
#[command(name = "auto3dseg", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum Commands {
    /// Segment one or more input volumes
    Segment {
        /// Input volumes, in the order the model expects them
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Model id (defaults to the first model in the catalog)
        #[arg(short, long)]
        model: Option<String>,
        /// Where to write the segmentation
        #[arg(short, long)]
        output: PathBuf,
        /// Run on CPU even if a GPU is available
        #[arg(long)]
        cpu: bool,
        /// Send the job to a remote inference server instead
        #[arg(long, value_name = "URL")]
        remote: Option<String>,
        /// Keep the job's temporary folder
        #[arg(long)]
        preserve: bool,
    },
    /// List available models
    Models {
        /// Query a remote inference server instead of the local catalog
        #[arg(long, value_name = "URL")]
        remote: Option<String>,
    },
    /// Download model weights into the cache
    Download {
        /// Model id
        #[arg(required_unless_present = "all")]
        id: Option<String>,
        /// Download every model in the catalog
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },
    /// Delete all downloaded models
    DeleteModels,
    /// Start the inference server and supervise it until Ctrl+C
    Server {
        /// Host name or address to bind
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum ConfigAction {
    /// Create a default configuration file in the workspace
    Init,
    /// Show the merged configuration
    Show,
    /// Print the configuration file locations
    Path,
}

/// Daily-rotated log file under `log_dir`, creating the directory first.
fn file_appender(log_dir: &Path) -> anyhow::Result<RollingFileAppender> {
    std::fs::create_dir_all(log_dir)?;
    Ok(RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("auto3dseg.log")
        .build(log_dir)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("org", "auto3dseg", "auto3dseg")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let (json_layer, _guard, log_error) = match file_appender(&log_dir) {
        Ok(appender) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard), None)
        }
        Err(e) => (None, None, Some(e)),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();
    if let Some(e) = log_error {
        tracing::warn!(path = %log_dir.display(), error = %e, "File logging disabled");
    }

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace, cli.config.as_deref()).await
}
