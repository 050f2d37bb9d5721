//! Error types for the auto3dseg core.
//!
//! Uses `thiserror` for public API error types, one enum per concern:
//! process supervision, model catalog, inference execution and configuration.

use std::path::PathBuf;

/// Top-level error type for the auto3dseg core library.
#[derive(Debug, thiserror::Error)]
pub enum Auto3dSegError {
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from launching and supervising child processes.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process was already launched; a fresh instance is required per job")]
    AlreadyLaunched,

    #[error("Process exited with error code {code}")]
    Failed { code: i32 },

    #[error("Process was cancelled by the user")]
    Cancelled,

    #[error("Expected 1 to 4 input images, got {count}")]
    InvalidInputCount { count: usize },
}

/// Errors from the model catalog and model cache.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Model {id} not found")]
    ModelNotFound { id: String },

    #[error("Model {id} is not downloaded")]
    ModelNotDownloaded { id: String },

    #[error("Model weights file missing: {path}")]
    WeightsMissing { path: PathBuf },

    #[error("Failed to load models description from {path}: {message}")]
    Description { path: PathBuf, message: String },

    #[error("Catalog is empty")]
    Empty,

    #[error("Model download failed: {message}")]
    Download { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from inference executors and the orchestration layer.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Remote server error ({status}): {detail}")]
    Remote { status: u16, detail: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Job completion was never reported")]
    CompletionLost,

    #[error("Result import failed: {message}")]
    Import { message: String },

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {0}")]
    Parse(#[from] Box<figment::Error>),
}

/// A type alias for results using the top-level `Auto3dSegError`.
pub type Result<T> = std::result::Result<T, Auto3dSegError>;
