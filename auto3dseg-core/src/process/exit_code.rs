//! Exit-code vocabulary shared by the reader thread and the control thread.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

/// Raw value reported for a job whose cancellation won the race against
/// natural exit.
pub const USER_CANCELLED_CODE: i32 = 1001;

const RUNNING_RAW: i64 = i64::MIN;
const CANCELLED_RAW: i64 = i64::MIN + 1;

/// Final (or not yet final) code of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "code", rename_all = "snake_case")]
pub enum ExitCode {
    /// No final code yet.
    Running,
    /// Cancellation was requested before the exit was observed.
    UserCancelled,
    /// The OS exit code. Signal deaths are reported as the negated signal.
    Exited(i32),
}

impl ExitCode {
    pub fn is_running(self) -> bool {
        matches!(self, ExitCode::Running)
    }

    pub fn is_success(self) -> bool {
        matches!(self, ExitCode::Exited(0))
    }

    /// Integer form for display and for process-style return values.
    pub fn raw(self) -> Option<i32> {
        match self {
            ExitCode::Running => None,
            ExitCode::UserCancelled => Some(USER_CANCELLED_CODE),
            ExitCode::Exited(code) => Some(code),
        }
    }

    fn encode(self) -> i64 {
        match self {
            ExitCode::Running => RUNNING_RAW,
            ExitCode::UserCancelled => CANCELLED_RAW,
            ExitCode::Exited(code) => i64::from(code),
        }
    }

    fn decode(raw: i64) -> Self {
        match raw {
            RUNNING_RAW => ExitCode::Running,
            CANCELLED_RAW => ExitCode::UserCancelled,
            // Only values produced by `encode` are ever stored.
            other => ExitCode::Exited(other as i32),
        }
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitCode::Running => write!(f, "running"),
            ExitCode::UserCancelled => write!(f, "cancelled"),
            ExitCode::Exited(code) => write!(f, "{code}"),
        }
    }
}

/// Latching cell for an [`ExitCode`].
///
/// A natural exit is only recorded while the cell still reads `Running`;
/// a cancellation overwrites anything and is never overwritten afterwards.
#[derive(Debug)]
pub struct ExitCodeCell(AtomicI64);

impl ExitCodeCell {
    pub fn new() -> Self {
        Self(AtomicI64::new(RUNNING_RAW))
    }

    pub fn get(&self) -> ExitCode {
        ExitCode::decode(self.0.load(Ordering::Acquire))
    }

    /// Record the OS exit code. Returns `false` if a final value was
    /// already latched (for example by a cancellation).
    pub fn record_exit(&self, code: i32) -> bool {
        self.0
            .compare_exchange(
                RUNNING_RAW,
                ExitCode::Exited(code).encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn latch_cancelled(&self) {
        self.0.store(CANCELLED_RAW, Ordering::Release);
    }
}

impl Default for ExitCodeCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Logical job state, derived from whether a launch happened and the
/// current exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    NotStarted,
    Running,
    CompletedOk,
    CompletedError,
    Cancelled,
}

impl JobState {
    pub fn derive(launched: bool, code: ExitCode) -> Self {
        match code {
            ExitCode::UserCancelled => JobState::Cancelled,
            ExitCode::Exited(0) => JobState::CompletedOk,
            ExitCode::Exited(_) => JobState::CompletedError,
            ExitCode::Running if launched => JobState::Running,
            ExitCode::Running => JobState::NotStarted,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::CompletedOk | JobState::CompletedError | JobState::Cancelled
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::NotStarted => write!(f, "not_started"),
            JobState::Running => write!(f, "running"),
            JobState::CompletedOk => write!(f, "completed_ok"),
            JobState::CompletedError => write!(f, "completed_error"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}
