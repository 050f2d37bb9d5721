//! Supervision of the external inference toolchain.
//!
//! [`BackgroundProcess`] owns one child process for its whole life: launch,
//! output streaming, cancellation and exactly-once completion. The two
//! wrappers put domain defaults on top of it: [`LocalInference`] for a
//! single segmentation job and [`InferenceServer`] for a long-running
//! inference server.

mod background;
mod exit_code;
mod info;
mod local;
mod server;
pub mod tree;

pub use background::{BackgroundProcess, CancelHandle, PollStatus};
pub use exit_code::{ExitCode, ExitCodeCell, JobState, USER_CANCELLED_CODE};
pub use info::{JobOutcome, ProcessInfo, SegmentationJob};
pub use local::{ExecutionMode, LocalInference, cleanup_temp_dir};
pub use server::{DEFAULT_SERVER_HOST, DEFAULT_SERVER_PORT, InferenceServer};

use std::sync::Arc;
use std::time::Duration;

/// File name the inference command writes its labelled volume to.
pub const RESULT_FILE_NAME: &str = "output-segmentation.nii.gz";

/// Interval at which [`BackgroundProcess::monitor`] polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Free-text channel that receives every output line of a job.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Invoked exactly once with the finished job.
pub type CompletionCallback<J> = Box<dyn FnOnce(ProcessInfo<J>) + Send>;

/// Caller-supplied hooks for a supervised job.
pub struct ProcessHooks<J> {
    pub log: LogSink,
    pub on_complete: Option<CompletionCallback<J>>,
}

impl<J> ProcessHooks<J> {
    pub fn new(log: LogSink) -> Self {
        Self {
            log,
            on_complete: None,
        }
    }

    /// Hooks whose log sink forwards to `tracing` at info level.
    pub fn tracing() -> Self {
        Self::new(tracing_sink())
    }

    #[must_use]
    pub fn on_complete(mut self, callback: impl FnOnce(ProcessInfo<J>) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }
}

impl<J> Default for ProcessHooks<J> {
    fn default() -> Self {
        Self::tracing()
    }
}

impl<J> std::fmt::Debug for ProcessHooks<J> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHooks")
            .field("on_complete", &self.on_complete.is_some())
            .finish_non_exhaustive()
    }
}

/// Log sink that forwards each line to `tracing::info!`.
pub fn tracing_sink() -> LogSink {
    Arc::new(|line: &str| tracing::info!(target: "auto3dseg::job", "{line}"))
}
