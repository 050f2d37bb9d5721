//! Executor that runs the inference script on this machine.

use super::InferenceExecutor;
use crate::catalog::{ModelCatalog, ModelDownloader};
use crate::config::InferenceConfig;
use crate::error::InferenceError;
use crate::process::{
    ExecutionMode, LocalInference, PollStatus, ProcessHooks, ProcessInfo, SegmentationJob,
};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct LocalExecutor {
    catalog: Arc<ModelCatalog>,
    downloader: Option<ModelDownloader>,
    python: PathBuf,
    script: PathBuf,
    poll_interval: Duration,
}

impl LocalExecutor {
    pub fn new(catalog: Arc<ModelCatalog>, config: &InferenceConfig) -> Self {
        Self {
            catalog,
            downloader: None,
            python: config.python.clone(),
            script: config.script.clone(),
            poll_interval: config.poll_interval(),
        }
    }

    /// Download models that are not in the cache yet before running.
    #[must_use]
    pub fn with_downloader(mut self, downloader: ModelDownloader) -> Self {
        self.downloader = Some(downloader);
        self
    }
}

#[async_trait]
impl InferenceExecutor for LocalExecutor {
    fn name(&self) -> &str {
        "local"
    }

    async fn execute(
        &self,
        info: ProcessInfo<SegmentationJob>,
        hooks: ProcessHooks<SegmentationJob>,
        cancel: CancellationToken,
    ) -> Result<(), InferenceError> {
        if let Some(downloader) = &self.downloader {
            downloader.ensure(&self.catalog, &info.job.model).await?;
        }
        let weights = self.catalog.model_weights_path(&info.job.model)?;
        let command = LocalInference::build_command(&info.job, &self.python, &self.script, &weights)?;
        info!(model = %info.job.model, command = %command.display(), "Running local inference");

        let mut inference = LocalInference::new(info, hooks);
        inference.run(&command, ExecutionMode::Asynchronous)?;

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cancel_sent = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled(), if !cancel_sent => {
                    inference.request_cancel();
                    cancel_sent = true;
                }
                _ = ticker.tick() => {
                    if inference.poll() == PollStatus::Completed {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}
