//! Executor and catalog client for a remote auto3dseg server.

use super::InferenceExecutor;
use crate::catalog::ModelDescription;
use crate::command::{MAX_INPUT_IMAGES, image_field_name};
use crate::config::RemoteConfig;
use crate::error::InferenceError;
use crate::process::{ProcessHooks, ProcessInfo, SegmentationJob};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct RemoteExecutor {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteExecutor {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn from_config(config: &RemoteConfig) -> Result<Self, InferenceError> {
        Self::new(&config.base_url, Duration::from_secs(config.timeout_secs))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Models offered by the server.
    pub async fn models(&self) -> Result<Vec<ModelDescription>, InferenceError> {
        let response = checked(self.client.get(self.url("/models")).send().await?).await?;
        Ok(response.json().await?)
    }

    pub async fn model_info(&self, id: &str) -> Result<ModelDescription, InferenceError> {
        let request = self.client.get(self.url("/modelinfo")).query(&[("id", id)]);
        let response = checked(request.send().await?).await?;
        Ok(response.json().await?)
    }

    /// Raw `labels.csv` of a model.
    pub async fn label_descriptions(&self, id: &str) -> Result<bytes::Bytes, InferenceError> {
        let request = self.client.get(self.url("/labelDescriptions")).query(&[("id", id)]);
        let response = checked(request.send().await?).await?;
        Ok(response.bytes().await?)
    }

    /// `pip show MONAI` output from the server's Python environment.
    pub async fn monai_info(&self) -> Result<String, InferenceError> {
        let response = checked(self.client.get(self.url("/monaiinfo")).send().await?).await?;
        Ok(response.json().await?)
    }

    async fn upload_form(job: &SegmentationJob) -> Result<Form, InferenceError> {
        let mut form = Form::new();
        for (index, path) in job.input_files.iter().enumerate() {
            let data = tokio::fs::read(path).await?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| image_field_name(index));
            form = form.part(image_field_name(index), Part::bytes(data).file_name(file_name));
        }
        Ok(form)
    }

    async fn infer(&self, form: Form, model: &str, output: &Path) -> Result<(), InferenceError> {
        let request = self
            .client
            .post(self.url("/infer"))
            .query(&[("model_name", model)])
            .multipart(form);
        let response = checked(request.send().await?).await?;

        let mut file = tokio::fs::File::create(output).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

/// Turn a non-2xx response into [`InferenceError::Remote`] with the
/// server's `detail` message.
async fn checked(response: reqwest::Response) -> Result<reqwest::Response, InferenceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let detail = response
        .json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|body| body.get("detail").map(|d| match d {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown error").to_string());
    Err(InferenceError::Remote {
        status: status.as_u16(),
        detail,
    })
}

#[async_trait]
impl InferenceExecutor for RemoteExecutor {
    fn name(&self) -> &str {
        "remote"
    }

    async fn execute(
        &self,
        mut info: ProcessInfo<SegmentationJob>,
        hooks: ProcessHooks<SegmentationJob>,
        cancel: CancellationToken,
    ) -> Result<(), InferenceError> {
        let count = info.job.input_files.len();
        if count == 0 || count > MAX_INPUT_IMAGES {
            return Err(InferenceError::InvalidRequest {
                reason: format!("expected 1 to {MAX_INPUT_IMAGES} input images, got {count}"),
            });
        }
        let form = Self::upload_form(&info.job).await?;
        let log = hooks.log;

        info.started_at = Utc::now();
        info!(model = %info.job.model, server = %self.base_url, "Sending inference request");
        log(&format!("Sending inference request to {}", self.base_url));

        let result = tokio::select! {
            _ = cancel.cancelled() => None,
            result = self.infer(form, &info.job.model, &info.job.output_file) => Some(result),
        };

        match result {
            None => {
                info!("Remote inference cancelled");
                info.exit_code.latch_cancelled();
            }
            Some(Ok(())) => {
                info.exit_code.record_exit(0);
            }
            Some(Err(InferenceError::Remote { status, detail })) => {
                log(&format!("Server error {status}: {detail}"));
                info.exit_code.record_exit(i32::from(status));
            }
            Some(Err(e)) => {
                warn!(error = %e, "Remote inference request failed");
                log(&format!("Remote inference request failed: {e}"));
                info.exit_code.record_exit(-1);
            }
        }
        debug!(exit_code = %info.exit_code(), "Remote job finished");

        if let Some(callback) = hooks.on_complete {
            callback(info);
        }
        Ok(())
    }
}
