//! Per-job state record.
//!
//! A [`ProcessInfo`] is created by whoever requests a job, filled in while the
//! job is prepared, mutated by [`BackgroundProcess`](super::BackgroundProcess)
//! while the child runs, and finally handed by value to the completion
//! callback. Only the exit code and the output queue cross threads.

use super::exit_code::{ExitCode, ExitCodeCell};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;

/// Supervision state plus a job-specific payload `J`.
#[derive(Debug)]
pub struct ProcessInfo<J = ()> {
    pub(crate) pid: Option<u32>,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) exit_code: Arc<ExitCodeCell>,
    pub(crate) output: Option<mpsc::UnboundedReceiver<String>>,
    pub(crate) reader: Option<JoinHandle<()>>,
    /// Job payload, owned by the caller's side of the job.
    pub job: J,
}

impl<J> ProcessInfo<J> {
    pub fn new(job: J) -> Self {
        Self {
            pid: None,
            started_at: Utc::now(),
            exit_code: Arc::new(ExitCodeCell::new()),
            output: None,
            reader: None,
            job,
        }
    }

    /// Process id, present only while the process is supervised.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn exit_code(&self) -> ExitCode {
        self.exit_code.get()
    }

    pub fn elapsed(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }

    pub fn outcome(&self) -> JobOutcome {
        JobOutcome::from(self.exit_code())
    }
}

/// How a job ended, as seen by the completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Running,
    Succeeded,
    Failed { code: i32 },
    Cancelled,
}

impl From<ExitCode> for JobOutcome {
    fn from(code: ExitCode) -> Self {
        match code {
            ExitCode::Running => JobOutcome::Running,
            ExitCode::UserCancelled => JobOutcome::Cancelled,
            ExitCode::Exited(0) => JobOutcome::Succeeded,
            ExitCode::Exited(code) => JobOutcome::Failed { code },
        }
    }
}

/// Payload of a segmentation inference job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentationJob {
    /// Working directory holding inputs and the result.
    pub temp_dir: PathBuf,
    /// Input volumes, in `--image-file`, `--image-file-2`, ... order.
    pub input_files: Vec<PathBuf>,
    pub model: String,
    /// Labelled volume written by the inference command.
    pub output_file: PathBuf,
    /// Hide GPUs from the child process.
    #[serde(default)]
    pub force_cpu: bool,
    /// Leave `temp_dir` on disk after completion.
    #[serde(default)]
    pub preserve_temp_dir: bool,
    /// Opaque caller data carried through to completion.
    #[serde(default)]
    pub custom_data: Option<serde_json::Value>,
}

impl SegmentationJob {
    pub fn new(model: impl Into<String>, temp_dir: PathBuf) -> Self {
        Self {
            output_file: temp_dir.join(super::RESULT_FILE_NAME),
            temp_dir,
            model: model.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_info_is_unlaunched() {
        let info = ProcessInfo::new(());
        assert!(info.pid().is_none());
        assert_eq!(info.exit_code(), ExitCode::Running);
        assert_eq!(info.outcome(), JobOutcome::Running);
        assert!(info.elapsed() >= chrono::Duration::zero());
    }

    #[test]
    fn test_outcome_mapping() {
        assert_eq!(JobOutcome::from(ExitCode::Exited(0)), JobOutcome::Succeeded);
        assert_eq!(
            JobOutcome::from(ExitCode::Exited(137)),
            JobOutcome::Failed { code: 137 }
        );
        assert_eq!(JobOutcome::from(ExitCode::UserCancelled), JobOutcome::Cancelled);
    }

    #[test]
    fn test_segmentation_job_result_path() {
        let job = SegmentationJob::new("abdomen-v1.0.0", PathBuf::from("/tmp/job-1"));
        assert_eq!(
            job.output_file,
            PathBuf::from("/tmp/job-1/output-segmentation.nii.gz")
        );
        assert!(!job.preserve_temp_dir);
        assert!(job.input_files.is_empty());
    }

    #[test]
    fn test_segmentation_job_serde_defaults() {
        let job: SegmentationJob = serde_json::from_value(serde_json::json!({
            "temp_dir": "/tmp/x",
            "input_files": ["/tmp/x/a.nrrd"],
            "model": "m",
            "output_file": "/tmp/x/out.nii.gz"
        }))
        .unwrap();
        assert!(!job.force_cpu);
        assert!(job.custom_data.is_none());
    }
}
