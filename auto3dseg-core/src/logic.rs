//! Segmentation orchestration: request validation, working directory
//! preparation, execution, result import and cleanup.

use crate::catalog::ModelCatalog;
use crate::error::InferenceError;
use crate::executor::InferenceExecutor;
use crate::process::{
    JobOutcome, LogSink, ProcessHooks, ProcessInfo, SegmentationJob, cleanup_temp_dir,
    tracing_sink,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Receives the labelled volume of a successful job.
pub trait ResultImporter: Send + Sync {
    fn import_result(
        &self,
        result_file: &Path,
        model: &str,
        correlation: Option<&serde_json::Value>,
    ) -> Result<(), InferenceError>;
}

/// Copies the result file to a fixed destination.
#[derive(Debug, Clone)]
pub struct CopyResultImporter {
    destination: PathBuf,
}

impl CopyResultImporter {
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        Self {
            destination: destination.into(),
        }
    }
}

impl ResultImporter for CopyResultImporter {
    fn import_result(
        &self,
        result_file: &Path,
        model: &str,
        _correlation: Option<&serde_json::Value>,
    ) -> Result<(), InferenceError> {
        if let Some(parent) = self.destination.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(result_file, &self.destination).map_err(|e| InferenceError::Import {
            message: format!("copying {} failed: {e}", result_file.display()),
        })?;
        info!(model, destination = %self.destination.display(), "Segmentation result saved");
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentationRequest {
    /// Input volumes in the order the model expects them.
    pub inputs: Vec<PathBuf>,
    /// Model id. The catalog's default model when absent.
    pub model: Option<String>,
    /// Run on CPU even if a GPU is available.
    pub cpu: bool,
    /// Opaque value handed back to the result importer.
    pub correlation: Option<serde_json::Value>,
}

/// Summary of a processed request.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentationReport {
    pub model: String,
    pub outcome: JobOutcome,
    pub elapsed_secs: f64,
    pub temp_dir: PathBuf,
}

pub struct SegmentationLogic {
    catalog: Arc<ModelCatalog>,
    executor: Arc<dyn InferenceExecutor>,
    importer: Arc<dyn ResultImporter>,
    log: LogSink,
    temp_root: PathBuf,
    preserve_temp_dir: bool,
}

impl SegmentationLogic {
    pub fn new(
        catalog: Arc<ModelCatalog>,
        executor: Arc<dyn InferenceExecutor>,
        importer: Arc<dyn ResultImporter>,
    ) -> Self {
        Self {
            catalog,
            executor,
            importer,
            log: tracing_sink(),
            temp_root: std::env::temp_dir(),
            preserve_temp_dir: false,
        }
    }

    #[must_use]
    pub fn with_log(mut self, log: LogSink) -> Self {
        self.log = log;
        self
    }

    /// Parent directory for per-job working directories.
    #[must_use]
    pub fn with_temp_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.temp_root = root.into();
        self
    }

    #[must_use]
    pub fn preserve_temp_dir(mut self, preserve: bool) -> Self {
        self.preserve_temp_dir = preserve;
        self
    }

    fn validate(&self, request: &SegmentationRequest) -> Result<String, InferenceError> {
        let model = match &request.model {
            Some(id) => self.catalog.model(id)?,
            None => self.catalog.default_model()?,
        };
        if request.inputs.len() != model.inputs.len() {
            return Err(InferenceError::InvalidRequest {
                reason: format!(
                    "model {} expects {} input volume(s), got {}",
                    model.id,
                    model.inputs.len(),
                    request.inputs.len()
                ),
            });
        }
        if let Some(missing) = request.inputs.iter().find(|p| !p.is_file()) {
            return Err(InferenceError::InvalidRequest {
                reason: format!("input volume not found: {}", missing.display()),
            });
        }
        Ok(model.id.clone())
    }

    /// Create the working directory and copy the inputs into it.
    fn prepare(&self, request: &SegmentationRequest, model: String) -> Result<SegmentationJob, InferenceError> {
        let temp_dir = self
            .temp_root
            .join(format!("auto3dseg-{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&temp_dir)?;

        let mut job = SegmentationJob::new(model, temp_dir);
        for (index, source) in request.inputs.iter().enumerate() {
            let name = source.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            let target = job.temp_dir.join(input_file_name(index, &file_suffixes(&name)));
            if let Err(e) = std::fs::copy(source, &target) {
                cleanup_temp_dir(&job, |_| {});
                return Err(e.into());
            }
            job.input_files.push(target);
        }
        job.force_cpu = request.cpu;
        job.preserve_temp_dir = self.preserve_temp_dir;
        job.custom_data = request.correlation.clone();
        debug!(temp_dir = %job.temp_dir.display(), inputs = job.input_files.len(), "Prepared job");
        Ok(job)
    }

    /// Run one segmentation request end to end.
    pub async fn process(
        &self,
        request: SegmentationRequest,
        cancel: CancellationToken,
    ) -> Result<SegmentationReport, InferenceError> {
        let model = self.validate(&request)?;
        let job = self.prepare(&request, model)?;
        let log = Arc::clone(&self.log);

        log("Processing started");
        let start = Instant::now();
        let (tx, rx) = oneshot::channel();
        let hooks = ProcessHooks::new(Arc::clone(&log)).on_complete(move |info| {
            let _ = tx.send(info);
        });

        if let Err(e) = self
            .executor
            .execute(ProcessInfo::new(job.clone()), hooks, cancel)
            .await
        {
            log(&format!("Processing failed: {e}"));
            cleanup_temp_dir(&job, |line| log(line));
            return Err(e);
        }
        let info: ProcessInfo<SegmentationJob> = rx.await.map_err(|_| InferenceError::CompletionLost)?;

        let outcome = info.outcome();
        let imported = match outcome {
            JobOutcome::Succeeded => self.importer.import_result(
                &info.job.output_file,
                &info.job.model,
                info.job.custom_data.as_ref(),
            ),
            JobOutcome::Failed { code } => {
                log(&format!("Processing failed with error code {code}"));
                Ok(())
            }
            JobOutcome::Cancelled => {
                log("Processing was cancelled");
                Ok(())
            }
            JobOutcome::Running => {
                log("Processing failed with error code -1");
                Ok(())
            }
        };

        cleanup_temp_dir(&info.job, |line| log(line));
        if let Err(e) = imported {
            log(&format!("Processing failed: {e}"));
            return Err(e);
        }

        let elapsed_secs = start.elapsed().as_secs_f64();
        if outcome == JobOutcome::Succeeded {
            log(&format!("Processing completed in {elapsed_secs:.2} seconds"));
        }
        info!(model = %info.job.model, ?outcome, executor = self.executor.name(), "Segmentation finished");
        Ok(SegmentationReport {
            model: info.job.model.clone(),
            outcome,
            elapsed_secs,
            temp_dir: info.job.temp_dir.clone(),
        })
    }
}

/// `input-volume.<suffixes>` for the first input, `input-volume-N.<suffixes>`
/// for the rest.
pub fn input_file_name(index: usize, suffixes: &str) -> String {
    match index {
        0 => format!("input-volume{suffixes}"),
        n => format!("input-volume-{}{suffixes}", n + 1),
    }
}

/// All extensions of a file name, dots included: `scan.nii.gz` gives
/// `.nii.gz`. Leading dots do not start an extension.
pub fn file_suffixes(name: &str) -> String {
    let stem = name.trim_start_matches('.');
    if stem.ends_with('.') {
        return String::new();
    }
    match stem.find('.') {
        Some(pos) => stem[pos..].to_string(),
        None => String::new(),
    }
}
