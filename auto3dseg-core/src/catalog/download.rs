//! Model archive download and extraction.

use super::{ModelCatalog, ModelDescription};
use crate::error::CatalogError;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Minimum percentage gained between two progress reports.
const REPORTING_INCREMENT_PERCENT: f64 = 1.0;

fn download_error(e: impl std::fmt::Display) -> CatalogError {
    CatalogError::Download {
        message: e.to_string(),
    }
}

/// Throttled progress reporting for a streamed download.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    total: Option<u64>,
    downloaded: u64,
    last_reported_percent: f64,
}

impl DownloadProgress {
    pub fn new(total: Option<u64>) -> Self {
        Self {
            total: total.filter(|t| *t > 0),
            downloaded: 0,
            last_reported_percent: -REPORTING_INCREMENT_PERCENT,
        }
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    /// Account for `bytes` more and return a progress line when the
    /// percentage moved by more than the reporting increment.
    pub fn advance(&mut self, bytes: usize) -> Option<String> {
        self.downloaded += bytes as u64;
        let total = self.total?;
        let percent = 100.0 * self.downloaded as f64 / total as f64;
        if percent - self.last_reported_percent <= REPORTING_INCREMENT_PERCENT {
            return None;
        }
        self.last_reported_percent = percent;
        Some(format!(
            "Downloading model: {:.1}MB / {:.1}MB ({percent:.1}%)",
            self.downloaded as f64 / 1024.0 / 1024.0,
            total as f64 / 1024.0 / 1024.0,
        ))
    }
}

/// Fetches model archives into the catalog's cache.
#[derive(Debug, Clone)]
pub struct ModelDownloader {
    client: reqwest::Client,
}

impl Default for ModelDownloader {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl ModelDownloader {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Download and extract `model` into `models_dir/<id>`.
    pub async fn download(
        &self,
        model: &ModelDescription,
        models_dir: &Path,
    ) -> Result<PathBuf, CatalogError> {
        info!("Downloading model '{}' from {}...", model.id, model.url);
        let temp = tempfile::tempdir()?;
        let archive = temp.path().join("auto3dseg_model.zip");

        let response = self
            .client
            .get(&model.url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(download_error)?;

        let mut progress = DownloadProgress::new(response.content_length());
        let mut file = tokio::fs::File::create(&archive).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(download_error)?;
            file.write_all(&chunk).await?;
            if let Some(line) = progress.advance(chunk.len()) {
                info!("{line}");
            }
        }
        file.flush().await?;
        drop(file);

        let model_dir = models_dir.join(&model.id);
        info!("Download finished. Extracting to {}...", model_dir.display());
        let target = model_dir.clone();
        tokio::task::spawn_blocking(move || extract_zip(&archive, &target))
            .await
            .map_err(download_error)??;

        debug!(path = %temp.path().display(), "Cleaning up temporary model download folder");
        Ok(model_dir)
    }

    /// Directory of model `id`, downloading it first when it is missing.
    pub async fn ensure(&self, catalog: &ModelCatalog, id: &str) -> Result<PathBuf, CatalogError> {
        if let Ok(path) = catalog.model_path(id) {
            return Ok(path);
        }
        let model = catalog.model(id)?;
        self.download(model, &catalog.models_dir()).await?;
        catalog.model_path(id)
    }
}

/// Extract a zip archive into `dest`, creating it if needed.
pub fn extract_zip(archive: &Path, dest: &Path) -> Result<(), CatalogError> {
    std::fs::create_dir_all(dest)?;
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(download_error)?;
    zip.extract(dest).map_err(download_error)?;
    Ok(())
}
