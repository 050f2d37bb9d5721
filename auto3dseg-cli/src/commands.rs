//! Subcommand handlers.

use crate::{Commands, ConfigAction};
use auto3dseg_core::config::{RemoteConfig, user_config_path, workspace_config_path};
use auto3dseg_core::logic::CopyResultImporter;
use auto3dseg_core::{
    Auto3dSegConfig, InferenceExecutor, InferenceServer, JobOutcome, LocalExecutor, LogSink,
    ModelCatalog, ModelDescription, ModelDownloader, RemoteExecutor, SegmentationLogic,
    SegmentationRequest,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub(crate) async fn handle_command(
    command: Commands,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    let load = || {
        auto3dseg_core::load_config(Some(workspace), config_file, None)
            .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
    };

    match command {
        Commands::Config { action } => handle_config(action, workspace, config_file),
        Commands::Segment {
            inputs,
            model,
            output,
            cpu,
            remote,
            preserve,
        } => {
            let config = load()?;
            let request = SegmentationRequest {
                inputs,
                model,
                cpu: cpu || config.inference.force_cpu,
                correlation: None,
            };
            handle_segment(&config, request, output, remote, preserve).await
        }
        Commands::Models { remote } => handle_models(&load()?, remote).await,
        Commands::Download { id, all } => handle_download(&load()?, id, all).await,
        Commands::DeleteModels => {
            let catalog = load_catalog(&load()?)?;
            catalog.delete_all_models()?;
            println!("Deleted all models from {}", catalog.models_dir().display());
            Ok(())
        }
        Commands::Server { host, port } => handle_server(&load()?, host, port).await,
    }
}

fn handle_config(action: ConfigAction, workspace: &Path, config_file: Option<&Path>) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = workspace_config_path(workspace);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let toml_str = Auto3dSegConfig::default()
                .to_toml_string()
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            std::fs::write(&config_path, toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = auto3dseg_core::load_config(Some(workspace), config_file, None)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            let toml_str = config
                .to_toml_string()
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            println!("{}", toml_str);
            Ok(())
        }
        ConfigAction::Path => {
            for line in config_locations(workspace, config_file) {
                println!("{line}");
            }
            Ok(())
        }
    }
}

/// Config files in merge order, each marked with whether it exists.
fn config_locations(workspace: &Path, config_file: Option<&Path>) -> Vec<String> {
    let mut paths: Vec<(&str, PathBuf)> = Vec::new();
    if let Some(user) = user_config_path() {
        paths.push(("user", user));
    }
    paths.push(("workspace", workspace_config_path(workspace)));
    if let Some(file) = config_file {
        paths.push(("explicit", file.to_path_buf()));
    }
    paths
        .into_iter()
        .map(|(layer, path)| {
            let marker = if path.exists() { "" } else { " (not found)" };
            format!("{layer}: {}{marker}", path.display())
        })
        .collect()
}

fn load_catalog(config: &Auto3dSegConfig) -> anyhow::Result<ModelCatalog> {
    Ok(ModelCatalog::load(
        &config.catalog.models_json,
        &config.catalog.cache_dir,
    )?)
}

fn remote_executor(config: &Auto3dSegConfig, url: String) -> anyhow::Result<RemoteExecutor> {
    let remote = RemoteConfig {
        base_url: url,
        ..config.remote.clone()
    };
    Ok(RemoteExecutor::from_config(&remote)?)
}

/// Job log lines go straight to the terminal.
fn stdout_sink() -> LogSink {
    Arc::new(|line: &str| println!("{line}"))
}

/// Cancel `token` on the first Ctrl+C.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, cancelling");
            token.cancel();
        }
    });
}

async fn handle_segment(
    config: &Auto3dSegConfig,
    request: SegmentationRequest,
    output: PathBuf,
    remote: Option<String>,
    preserve: bool,
) -> anyhow::Result<()> {
    let (catalog, executor): (Arc<ModelCatalog>, Arc<dyn InferenceExecutor>) = match remote {
        Some(url) => {
            let executor = remote_executor(config, url)?;
            let models = executor.models().await?;
            (
                Arc::new(ModelCatalog::from_models(models, &config.catalog.cache_dir)),
                Arc::new(executor),
            )
        }
        None => {
            let catalog = Arc::new(load_catalog(config)?);
            let executor = LocalExecutor::new(Arc::clone(&catalog), &config.inference)
                .with_downloader(ModelDownloader::default());
            (catalog, Arc::new(executor))
        }
    };

    let logic = SegmentationLogic::new(
        catalog,
        executor,
        Arc::new(CopyResultImporter::new(&output)),
    )
    .with_log(stdout_sink())
    .preserve_temp_dir(preserve || config.inference.preserve_temp_dir);

    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    let report = logic.process(request, cancel).await?;
    match report.outcome {
        JobOutcome::Succeeded => {
            println!("Segmentation saved to {}", output.display());
            Ok(())
        }
        JobOutcome::Failed { code } => anyhow::bail!("Segmentation failed with error code {code}"),
        JobOutcome::Cancelled => anyhow::bail!("Segmentation was cancelled"),
        JobOutcome::Running => anyhow::bail!("Segmentation did not finish"),
    }
}

fn format_model_row(model: &ModelDescription, downloaded: Option<bool>) -> String {
    let mut row = format!(
        "{:<40} {:<8} {} input(s)  {}",
        model.id,
        model.imaging_modality,
        model.inputs.len(),
        model.title
    );
    if downloaded == Some(true) {
        row.push_str("  [downloaded]");
    }
    if model.deprecated {
        row.push_str("  [deprecated]");
    }
    row
}

async fn handle_models(config: &Auto3dSegConfig, remote: Option<String>) -> anyhow::Result<()> {
    match remote {
        Some(url) => {
            let executor = remote_executor(config, url)?;
            let models = executor.models().await?;
            println!("Models on {} ({}):", executor.base_url(), models.len());
            for model in &models {
                println!("  {}", format_model_row(model, None));
            }
        }
        None => {
            let catalog = load_catalog(config)?;
            println!("Models ({}):", catalog.models().len());
            for model in catalog.models() {
                let downloaded = catalog.is_model_downloaded(&model.id);
                println!("  {}", format_model_row(model, Some(downloaded)));
            }
        }
    }
    Ok(())
}

async fn handle_download(config: &Auto3dSegConfig, id: Option<String>, all: bool) -> anyhow::Result<()> {
    let catalog = load_catalog(config)?;
    let downloader = ModelDownloader::default();

    let ids: Vec<String> = if all {
        catalog.models().iter().map(|m| m.id.clone()).collect()
    } else {
        id.into_iter().collect()
    };
    for id in &ids {
        if catalog.is_model_downloaded(id) {
            println!("Model {id} is already downloaded");
            continue;
        }
        let path = downloader.ensure(&catalog, id).await?;
        println!("Model {id} ready at {}", path.display());
    }
    Ok(())
}

async fn handle_server(
    config: &Auto3dSegConfig,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let mut server = InferenceServer::with_address(
        stdout_sink(),
        host.unwrap_or_else(|| config.server.host.clone()),
        port.unwrap_or(config.server.port),
    );
    server.start(&config.server.executable)?;
    println!("Inference server at {} (Ctrl+C to stop)", server.address_url());

    let interrupted = tokio::select! {
        _ = server.monitor(config.inference.poll_interval()) => false,
        _ = tokio::signal::ctrl_c() => true,
    };
    if interrupted {
        server.shutdown(config.inference.poll_interval()).await;
    }
    let code = server.exit_code();
    tracing::info!(exit_code = %code, "Inference server finished");
    Ok(())
}
