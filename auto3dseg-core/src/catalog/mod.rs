//! Model catalog and local model cache.
//!
//! The catalog is read from a `Models.json` description. Downloaded models
//! live under `<cache>/models/<model id>/`; a model directory is recognised
//! by the `labels.csv` file it contains, possibly in a subfolder.

mod description;
mod download;

pub use description::{
    ModelDescription, ModelInput, human_readable_time_from_sec, parse_model_url, parse_models_json,
};
pub use download::{DownloadProgress, ModelDownloader, extract_zip};

use crate::error::CatalogError;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Name of the per-user cache directory used when none is configured.
pub const DEFAULT_CACHE_DIR_NAME: &str = ".MONAIAuto3DSeg";
pub const LABELS_FILE_NAME: &str = "labels.csv";
pub const WEIGHTS_FILE_NAME: &str = "model.pt";

/// Models known to this installation plus where their files live.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models: Vec<ModelDescription>,
    cache_dir: PathBuf,
}

impl ModelCatalog {
    pub fn load(models_json: &Path, cache_dir: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let describe = |message: String| CatalogError::Description {
            path: models_json.to_path_buf(),
            message,
        };
        let content = std::fs::read_to_string(models_json).map_err(|e| describe(e.to_string()))?;
        let models = parse_models_json(&content).map_err(|e| describe(e.to_string()))?;
        debug!(path = %models_json.display(), count = models.len(), "Loaded model catalog");
        Ok(Self::from_models(models, cache_dir))
    }

    pub fn from_models(models: Vec<ModelDescription>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            models,
            cache_dir: cache_dir.into(),
        }
    }

    pub fn models(&self) -> &[ModelDescription] {
        &self.models
    }

    pub fn model(&self, id: &str) -> Result<&ModelDescription, CatalogError> {
        self.models
            .iter()
            .find(|m| m.id == id)
            .ok_or_else(|| CatalogError::ModelNotFound { id: id.to_string() })
    }

    /// First listed model.
    pub fn default_model(&self) -> Result<&ModelDescription, CatalogError> {
        self.models.first().ok_or(CatalogError::Empty)
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn models_dir(&self) -> PathBuf {
        self.cache_dir.join("models")
    }

    /// Extraction target of a model archive.
    pub fn model_dir(&self, id: &str) -> PathBuf {
        self.models_dir().join(id)
    }

    /// Directory holding the model's `labels.csv`.
    pub fn model_path(&self, id: &str) -> Result<PathBuf, CatalogError> {
        self.model(id)?;
        WalkDir::new(self.model_dir(id))
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .find(|entry| entry.file_type().is_file() && entry.file_name() == LABELS_FILE_NAME)
            .and_then(|entry| entry.path().parent().map(Path::to_path_buf))
            .ok_or_else(|| CatalogError::ModelNotDownloaded { id: id.to_string() })
    }

    pub fn model_weights_path(&self, id: &str) -> Result<PathBuf, CatalogError> {
        let path = self.model_path(id)?.join(WEIGHTS_FILE_NAME);
        if !path.is_file() {
            return Err(CatalogError::WeightsMissing { path });
        }
        Ok(path)
    }

    pub fn label_descriptions_path(&self, id: &str) -> Result<PathBuf, CatalogError> {
        Ok(self.model_path(id)?.join(LABELS_FILE_NAME))
    }

    pub fn is_model_downloaded(&self, id: &str) -> bool {
        self.model_path(id).is_ok()
    }

    pub fn delete_all_models(&self) -> Result<(), CatalogError> {
        let dir = self.models_dir();
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
            info!(path = %dir.display(), "Deleted all downloaded models");
        }
        Ok(())
    }
}
