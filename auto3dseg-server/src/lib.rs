//! HTTP inference server built on axum.
//!
//! Exposes the model catalog and runs segmentation inference for uploaded
//! volumes. Each `/infer` request gets its own session directory, which is
//! removed after the result has been streamed back or the command failed.

pub mod error;
pub mod session;

pub use error::ApiError;

use auto3dseg_core::catalog::LABELS_FILE_NAME;
use auto3dseg_core::command::{MAX_INPUT_IMAGES, image_field_name};
use auto3dseg_core::logic::file_suffixes;
use auto3dseg_core::process::RESULT_FILE_NAME;
use auto3dseg_core::{Auto3dSegConfig, CatalogError, InferenceCommand, ModelCatalog, ModelDescription};
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use session::{SessionDir, SessionFileStream};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Shared server state.
pub struct AppState {
    pub catalog: Arc<ModelCatalog>,
    pub python: PathBuf,
    pub script: PathBuf,
    pub force_cpu: bool,
    pub session_root: PathBuf,
    /// Command whose stdout is served by `/monaiinfo`.
    pub monai_info: InferenceCommand,
    started_at: Instant,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(catalog: Arc<ModelCatalog>, config: &Auto3dSegConfig) -> Self {
        Self {
            catalog,
            python: config.inference.python.clone(),
            script: config.inference.script.clone(),
            force_cpu: config.inference.force_cpu,
            session_root: config.server.session_root.clone(),
            monai_info: InferenceCommand::new(&config.inference.python).args(["-m", "pip", "show", "MONAI"]),
            started_at: Instant::now(),
        }
    }

    /// Load the catalog named by `config` and build the state around it.
    pub fn from_config(config: &Auto3dSegConfig) -> Result<Self, CatalogError> {
        let catalog = ModelCatalog::load(&config.catalog.models_json, &config.catalog.cache_dir)?;
        Ok(Self::new(Arc::new(catalog), config))
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Build the router with all routes and request tracing.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/models", get(models_handler))
        .route("/modelinfo", get(model_info_handler))
        .route("/labelDescriptions", get(label_descriptions_handler))
        .route("/monaiinfo", get(monai_info_handler))
        .route("/infer", post(infer_handler).layer(DefaultBodyLimit::disable()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    state: SharedState,
    addr: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Inference server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

#[derive(Debug, Deserialize)]
pub struct IdQuery {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct InferQuery {
    pub model_name: String,
}

async fn health_handler(State(state): State<SharedState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "models": state.catalog.models().len(),
        "uptime_secs": state.uptime_secs(),
    }))
}

async fn models_handler(State(state): State<SharedState>) -> Json<Vec<ModelDescription>> {
    Json(state.catalog.models().to_vec())
}

async fn model_info_handler(
    State(state): State<SharedState>,
    Query(query): Query<IdQuery>,
) -> Result<Json<ModelDescription>, ApiError> {
    Ok(Json(state.catalog.model(&query.id)?.clone()))
}

async fn label_descriptions_handler(
    State(state): State<SharedState>,
    Query(query): Query<IdQuery>,
) -> Result<Response, ApiError> {
    let path = state.catalog.label_descriptions_path(&query.id)?;
    let data = tokio::fs::read(&path).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{LABELS_FILE_NAME}\""),
            ),
        ],
        data,
    )
        .into_response())
}

async fn monai_info_handler(State(state): State<SharedState>) -> Result<Json<String>, ApiError> {
    let output = state
        .monai_info
        .to_tokio()
        .output()
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to query MONAI package info: {e}")))?;
    if !output.status.success() {
        return Err(ApiError::Internal(format!(
            "Failed to query MONAI package info: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(Json(String::from_utf8_lossy(&output.stdout).into_owned()))
}

/// Save the `image_file*` parts of the upload into the session directory,
/// returning the saved paths in input order.
async fn save_uploads(multipart: &mut Multipart, session: &SessionDir) -> Result<Vec<PathBuf>, ApiError> {
    let accepted: Vec<String> = (0..MAX_INPUT_IMAGES).map(image_field_name).collect();
    let mut saved = BTreeMap::new();
    while let Some(mut field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        let Some(index) = accepted.iter().position(|n| *n == name) else {
            debug!(field = %name, "Ignoring unexpected upload field");
            continue;
        };
        let suffixes = file_suffixes(field.file_name().unwrap_or_default());
        let path = session.path().join(format!("{name}{suffixes}"));
        let mut file = tokio::fs::File::create(&path).await?;
        while let Some(chunk) = field.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        saved.insert(index, path);
    }
    if !saved.contains_key(&0) {
        return Err(ApiError::BadRequest("image_file is required".into()));
    }
    Ok(saved.into_values().collect())
}

/// Forward each line of a child stream to the debug log.
async fn log_output(stream: impl AsyncRead + Unpin, stream_name: &'static str) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(stream = stream_name, "{line}"),
            Ok(None) => break,
            Err(e) => {
                debug!(stream = stream_name, error = %e, "Stopped reading inference output");
                break;
            }
        }
    }
}

async fn infer_handler(
    State(state): State<SharedState>,
    Query(query): Query<InferQuery>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let weights = state.catalog.model_weights_path(&query.model_name)?;
    let session = SessionDir::create(&state.session_root)?;
    let inputs = save_uploads(&mut multipart, &session).await?;
    let result_file = session.path().join(RESULT_FILE_NAME);

    let mut command =
        InferenceCommand::segmentation(&state.python, &state.script, &weights, &inputs, &result_file)?;
    if state.force_cpu {
        command = command.force_cpu();
    }
    info!(model = %query.model_name, session_dir = %session.path().display(), "Running inference");

    let mut child = command
        .to_tokio()
        .kill_on_drop(true)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ApiError::Inference(format!("'{}': {e}", command.display())))?;
    let stdout = child.stdout.take().map(|out| tokio::spawn(log_output(out, "stdout")));
    let stderr = child.stderr.take().map(|err| tokio::spawn(log_output(err, "stderr")));
    let status = child
        .wait()
        .await
        .map_err(|e| ApiError::Inference(format!("'{}': {e}", command.display())))?;
    for reader in [stdout, stderr].into_iter().flatten() {
        let _ = reader.await;
    }

    if !status.success() {
        let code = status.code().unwrap_or(-1);
        debug!(code, "Inference command failed");
        // `session` is dropped on return, removing the directory first.
        return Err(ApiError::Inference(format!(
            "Command '{}' returned non-zero exit status {code}.",
            command.display()
        )));
    }

    let file = tokio::fs::File::open(&result_file)
        .await
        .map_err(|e| ApiError::Inference(format!("result file missing: {e}")))?;
    let length = file.metadata().await?.len();
    let body = Body::from_stream(SessionFileStream::new(file, session));
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, length.to_string()),
        ],
        body,
    )
        .into_response())
}
