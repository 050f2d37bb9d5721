//! Local segmentation inference on top of [`BackgroundProcess`].

use super::background::{BackgroundProcess, CancelHandle, PollStatus};
use super::exit_code::{ExitCode, JobState};
use super::info::{ProcessInfo, SegmentationJob};
use super::ProcessHooks;
use crate::command::InferenceCommand;
use crate::error::ProcessError;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// How [`LocalInference::run`] drives the child process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Block the caller until the process exits.
    Synchronous,
    /// Return right after launch; the caller drives `poll` or `monitor`.
    #[default]
    Asynchronous,
}

/// One segmentation job executed on this machine.
#[derive(Debug)]
pub struct LocalInference {
    process: BackgroundProcess<SegmentationJob>,
}

impl LocalInference {
    pub fn new(info: ProcessInfo<SegmentationJob>, hooks: ProcessHooks<SegmentationJob>) -> Self {
        Self {
            process: BackgroundProcess::new(info, hooks),
        }
    }

    /// Segmentation command line for `job`, honouring its CPU-only flag.
    pub fn build_command(
        job: &SegmentationJob,
        python: impl Into<OsString>,
        script: &Path,
        model_file: &Path,
    ) -> Result<InferenceCommand, ProcessError> {
        let cmd = InferenceCommand::segmentation(
            python,
            script,
            model_file,
            &job.input_files,
            &job.output_file,
        )?;
        Ok(if job.force_cpu { cmd.force_cpu() } else { cmd })
    }

    /// Start the job.
    ///
    /// In synchronous mode the completion callback has already run when this
    /// returns, and a non-zero exit is reported as [`ProcessError::Failed`].
    pub fn run(&mut self, command: &InferenceCommand, mode: ExecutionMode) -> Result<(), ProcessError> {
        debug!(command = %command.display(), ?mode, "Starting local inference");
        match mode {
            ExecutionMode::Synchronous => match self.process.run_blocking(command)? {
                ExitCode::Exited(0) => Ok(()),
                ExitCode::Exited(code) => Err(ProcessError::Failed { code }),
                ExitCode::UserCancelled => Err(ProcessError::Cancelled),
                ExitCode::Running => Err(ProcessError::Failed { code: -1 }),
            },
            ExecutionMode::Asynchronous => {
                self.process.launch(command)?;
                if self.process.is_running() {
                    self.process.log("Process started");
                }
                Ok(())
            }
        }
    }

    /// Complete the job without running anything.
    pub fn skip(&mut self) {
        self.process.log("Skipping inference");
        self.process.request_cancel();
    }

    pub fn poll(&mut self) -> PollStatus {
        self.process.poll()
    }

    pub async fn monitor(&mut self, interval: Duration) {
        self.process.monitor(interval).await;
    }

    pub fn request_cancel(&mut self) {
        self.process.request_cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.process.cancel_handle()
    }

    pub fn is_running(&self) -> bool {
        self.process.is_running()
    }

    pub fn state(&self) -> JobState {
        self.process.state()
    }

    pub fn exit_code(&self) -> ExitCode {
        self.process.exit_code()
    }

    pub fn job(&self) -> Option<&SegmentationJob> {
        self.process.info().map(|info| &info.job)
    }
}

/// Remove the job's working directory unless it is marked for keeping.
pub fn cleanup_temp_dir(job: &SegmentationJob, log: impl Fn(&str)) {
    if job.preserve_temp_dir {
        log(&format!(
            "Not cleaning up temporary folder: {}",
            job.temp_dir.display()
        ));
        return;
    }
    match std::fs::remove_dir_all(&job.temp_dir) {
        Ok(()) => debug!(path = %job.temp_dir.display(), "Removed temporary folder"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %job.temp_dir.display(), error = %e, "Failed to remove temporary folder"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::{JobOutcome, LogSink};
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    fn collecting_sink() -> (LogSink, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink_lines = Arc::clone(&lines);
        let sink: LogSink = Arc::new(move |line: &str| sink_lines.lock().unwrap().push(line.to_string()));
        (sink, lines)
    }

    fn output_lines(lines: &Mutex<Vec<String>>) -> Vec<String> {
        lines
            .lock()
            .unwrap()
            .iter()
            .filter(|l| *l != "Process started")
            .cloned()
            .collect()
    }

    fn job() -> ProcessInfo<SegmentationJob> {
        ProcessInfo::new(SegmentationJob::new("test-model-v1.0.0", PathBuf::from("/tmp/unused")))
    }

    fn outcome_hooks(sink: LogSink) -> (ProcessHooks<SegmentationJob>, Arc<Mutex<Vec<JobOutcome>>>) {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&outcomes);
        let hooks = ProcessHooks::new(sink).on_complete(move |info: ProcessInfo<SegmentationJob>| {
            o.lock().unwrap().push(info.outcome());
        });
        (hooks, outcomes)
    }

    fn two_lines() -> InferenceCommand {
        InferenceCommand::new("sh").args(["-c", "echo line1; sleep 0.3; echo line2; exit 0"])
    }

    #[test]
    fn test_sync_mode_end_to_end() {
        let (sink, lines) = collecting_sink();
        let (hooks, outcomes) = outcome_hooks(sink);
        let mut inference = LocalInference::new(job(), hooks);

        inference.run(&two_lines(), ExecutionMode::Synchronous).unwrap();

        assert_eq!(output_lines(&lines), vec!["line1", "line2"]);
        assert_eq!(*outcomes.lock().unwrap(), vec![JobOutcome::Succeeded]);
        assert_eq!(inference.state(), JobState::CompletedOk);
    }

    #[test]
    fn test_async_mode_end_to_end() {
        let (sink, lines) = collecting_sink();
        let (hooks, outcomes) = outcome_hooks(sink);
        let mut inference = LocalInference::new(job(), hooks);

        inference.run(&two_lines(), ExecutionMode::Asynchronous).unwrap();
        let start = Instant::now();
        let mut saw_first_line_alone = false;
        while inference.poll() == PollStatus::Pending {
            assert!(start.elapsed() < Duration::from_secs(20));
            saw_first_line_alone |= output_lines(&lines) == ["line1"];
            std::thread::sleep(Duration::from_millis(50));
        }

        assert!(saw_first_line_alone);
        assert_eq!(output_lines(&lines), vec!["line1", "line2"]);
        assert_eq!(*outcomes.lock().unwrap(), vec![JobOutcome::Succeeded]);
        assert!(inference.job().is_none());
    }

    #[test]
    fn test_sync_failure_reports_code_after_callback() {
        let (sink, _) = collecting_sink();
        let (hooks, outcomes) = outcome_hooks(sink);
        let mut inference = LocalInference::new(job(), hooks);

        let err = inference
            .run(
                &InferenceCommand::new("sh").args(["-c", "exit 3"]),
                ExecutionMode::Synchronous,
            )
            .unwrap_err();

        assert!(matches!(err, ProcessError::Failed { code: 3 }));
        assert_eq!(*outcomes.lock().unwrap(), vec![JobOutcome::Failed { code: 3 }]);
    }

    #[test]
    fn test_skip_completes_as_cancelled() {
        let (sink, lines) = collecting_sink();
        let (hooks, outcomes) = outcome_hooks(sink);
        let mut inference = LocalInference::new(job(), hooks);

        inference.skip();

        assert_eq!(*outcomes.lock().unwrap(), vec![JobOutcome::Cancelled]);
        assert_eq!(*lines.lock().unwrap(), vec!["Skipping inference"]);
        assert_eq!(inference.poll(), PollStatus::Completed);
    }

    #[tokio::test]
    async fn test_monitor_long_running_cancel() {
        let (sink, _) = collecting_sink();
        let (hooks, outcomes) = outcome_hooks(sink);
        let mut inference = LocalInference::new(job(), hooks);
        inference
            .run(
                &InferenceCommand::new("sh").args(["-c", "sleep 60"]),
                ExecutionMode::Asynchronous,
            )
            .unwrap();
        assert!(inference.is_running());

        inference.request_cancel();
        tokio::time::timeout(Duration::from_secs(20), inference.monitor(Duration::from_millis(20)))
            .await
            .unwrap();

        assert!(!inference.is_running());
        assert_eq!(inference.exit_code(), ExitCode::UserCancelled);
        assert_eq!(*outcomes.lock().unwrap(), vec![JobOutcome::Cancelled]);
    }

    #[test]
    fn test_build_command_applies_force_cpu() {
        let mut job = SegmentationJob::new("m", PathBuf::from("/tmp/j"));
        job.input_files = vec![PathBuf::from("/tmp/j/input-volume.nrrd")];
        job.force_cpu = true;
        let cmd = LocalInference::build_command(&job, "python3", Path::new("infer.py"), Path::new("model.pt"))
            .unwrap();
        assert!(cmd.env.contains_key(std::ffi::OsStr::new(crate::command::GPU_VISIBILITY_VAR)));
    }

    #[test]
    fn test_cleanup_respects_preserve_flag() {
        let dir = tempfile::tempdir().unwrap();
        let kept = dir.path().join("kept");
        let removed = dir.path().join("removed");
        std::fs::create_dir_all(&kept).unwrap();
        std::fs::create_dir_all(&removed).unwrap();

        let (sink, lines) = collecting_sink();
        let mut keep_job = SegmentationJob::new("m", kept.clone());
        keep_job.preserve_temp_dir = true;
        cleanup_temp_dir(&keep_job, |l| sink(l));
        cleanup_temp_dir(&SegmentationJob::new("m", removed.clone()), |l| sink(l));

        assert!(kept.exists());
        assert!(!removed.exists());
        assert_eq!(
            *lines.lock().unwrap(),
            vec![format!("Not cleaning up temporary folder: {}", kept.display())]
        );
    }
}
