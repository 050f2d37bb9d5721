//! One-shot supervisor for an external process.
//!
//! The child's stdout and stderr share a single pipe. A dedicated OS thread
//! reads it line by line into an unbounded queue and records the exit code
//! once EOF is reached. The control side drains the queue with [`poll`],
//! either by hand or through the async [`monitor`] loop, and fires the
//! completion callback once the reader thread has finished.
//!
//! [`poll`]: BackgroundProcess::poll
//! [`monitor`]: BackgroundProcess::monitor

use super::exit_code::{ExitCode, ExitCodeCell, JobState};
use super::info::ProcessInfo;
use super::tree::{kill_process_tree, process_alive};
use super::{CompletionCallback, LogSink, ProcessHooks};
use crate::command::InferenceCommand;
use crate::error::ProcessError;
use chrono::Utc;
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::process::{Child, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// Result of a single [`BackgroundProcess::poll`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    Pending,
    Completed,
}

#[derive(Debug)]
struct CancelState {
    requested: AtomicBool,
    pid: OnceLock<u32>,
    exit_code: Arc<ExitCodeCell>,
}

impl CancelState {
    /// Latch the cancellation and kill the tree. Returns `false` when a
    /// cancellation was already requested.
    fn cancel(&self) -> bool {
        if self.requested.swap(true, Ordering::AcqRel) {
            debug!("Cancel already requested");
            return false;
        }
        self.exit_code.latch_cancelled();
        match self.pid.get() {
            Some(&pid) => {
                info!(pid, "Cancel requested, killing process tree");
                kill_process_tree(pid);
            }
            None => info!("Cancel requested before launch"),
        }
        true
    }

    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

/// Cloneable handle that cancels a job from another task or thread.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    /// Same semantics as [`BackgroundProcess::request_cancel`]. An unlaunched
    /// job completes on its next `poll`.
    pub fn cancel(&self) {
        self.state.cancel();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.state.is_requested()
    }
}

/// Supervises exactly one child process.
///
/// Instances are one-shot: a second `launch` returns
/// [`ProcessError::AlreadyLaunched`].
pub struct BackgroundProcess<J = ()> {
    info: Option<ProcessInfo<J>>,
    log: LogSink,
    on_complete: Option<CompletionCallback<J>>,
    cancel: Arc<CancelState>,
    launched: bool,
}

impl<J> BackgroundProcess<J> {
    pub fn new(info: ProcessInfo<J>, hooks: ProcessHooks<J>) -> Self {
        let cancel = Arc::new(CancelState {
            requested: AtomicBool::new(false),
            pid: OnceLock::new(),
            exit_code: Arc::clone(&info.exit_code),
        });
        Self {
            info: Some(info),
            log: hooks.log,
            on_complete: hooks.on_complete,
            cancel,
            launched: false,
        }
    }

    /// Spawn `command` and start the output reader thread.
    pub fn launch(&mut self, command: &InferenceCommand) -> Result<(), ProcessError> {
        if self.launched || self.info.is_none() {
            return Err(ProcessError::AlreadyLaunched);
        }
        if self.cancel.is_requested() {
            return Err(ProcessError::Cancelled);
        }

        let (child, output) = spawn_merged(command)?;
        let pid = child.id();
        let (tx, rx) = mpsc::unbounded_channel();
        let exit_code = Arc::clone(&self.cancel.exit_code);
        let reader = std::thread::Builder::new()
            .name(format!("auto3dseg-output-{pid}"))
            .spawn(move || pump_output(output, child, tx, exit_code))
            .map_err(|source| {
                kill_process_tree(pid);
                ProcessError::Spawn {
                    program: command.program_name(),
                    source,
                }
            })?;

        self.launched = true;
        if let Some(info) = self.info.as_mut() {
            info.pid = Some(pid);
            info.started_at = Utc::now();
            info.output = Some(rx);
            info.reader = Some(reader);
        }
        let _ = self.cancel.pid.set(pid);
        // A handle may have cancelled between the check above and the pid
        // becoming visible.
        if self.cancel.is_requested() {
            kill_process_tree(pid);
        }
        debug!(pid, command = %command.display(), "Launched process");
        Ok(())
    }

    /// Run `command` to completion on the calling thread.
    ///
    /// Output lines go to the log sink as they arrive, the completion
    /// callback fires before returning, and the final code is returned.
    pub fn run_blocking(&mut self, command: &InferenceCommand) -> Result<ExitCode, ProcessError> {
        if self.launched || self.info.is_none() {
            return Err(ProcessError::AlreadyLaunched);
        }
        if self.cancel.is_requested() {
            self.finish();
            return Ok(self.cancel.exit_code.get());
        }

        let (mut child, output) = spawn_merged(command)?;
        let pid = child.id();
        self.launched = true;
        if let Some(info) = self.info.as_mut() {
            info.pid = Some(pid);
            info.started_at = Utc::now();
        }
        let _ = self.cancel.pid.set(pid);
        if self.cancel.is_requested() {
            kill_process_tree(pid);
        }
        debug!(pid, command = %command.display(), "Running process synchronously");

        let log = Arc::clone(&self.log);
        for_each_line(output, |line| log(&line));
        let code = wait_for_exit(&mut child);
        self.cancel.exit_code.record_exit(code);

        let exit = self.cancel.exit_code.get();
        self.finish();
        Ok(exit)
    }

    /// Whether the supervised pid is alive according to the OS.
    pub fn is_running(&self) -> bool {
        self.pid().is_some_and(process_alive)
    }

    /// Idempotent, non-blocking cancellation.
    ///
    /// Kills the process tree and latches [`ExitCode::UserCancelled`]. The
    /// completion callback still fires from `poll` once the reader drains.
    /// If nothing was ever launched the job completes immediately.
    pub fn request_cancel(&mut self) {
        if self.info.is_none() {
            return;
        }
        self.cancel.cancel();
        if !self.launched {
            self.finish();
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            state: Arc::clone(&self.cancel),
        }
    }

    /// Forward queued output to the log sink and, once the reader thread
    /// has finished, complete the job. Never blocks.
    pub fn poll(&mut self) -> PollStatus {
        if self.info.is_none() {
            return PollStatus::Completed;
        }
        if !self.launched {
            if self.cancel.is_requested() {
                self.finish();
                return PollStatus::Completed;
            }
            return PollStatus::Pending;
        }

        let reader_done = match self.info.as_mut() {
            Some(info) => {
                if let Some(rx) = info.output.as_mut() {
                    drain(rx, &self.log);
                }
                info.reader.as_ref().is_none_or(|h| h.is_finished())
            }
            None => true,
        };
        if !reader_done {
            return PollStatus::Pending;
        }
        self.finish();
        PollStatus::Completed
    }

    /// Poll every `interval` until the job completes.
    ///
    /// A job that is neither launched nor cancelled never completes.
    pub async fn monitor(&mut self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while self.poll() == PollStatus::Pending {
            ticker.tick().await;
        }
    }

    /// Send a line to this job's log sink.
    pub fn log(&self, line: &str) {
        (self.log)(line);
    }

    pub fn pid(&self) -> Option<u32> {
        self.info.as_ref().and_then(ProcessInfo::pid)
    }

    pub fn exit_code(&self) -> ExitCode {
        self.cancel.exit_code.get()
    }

    pub fn state(&self) -> JobState {
        JobState::derive(self.launched, self.exit_code())
    }

    pub fn is_launched(&self) -> bool {
        self.launched
    }

    /// True once the completion callback has been handed the job.
    pub fn is_completed(&self) -> bool {
        self.info.is_none()
    }

    /// The job record, until it is handed to the completion callback.
    pub fn info(&self) -> Option<&ProcessInfo<J>> {
        self.info.as_ref()
    }

    pub fn job_mut(&mut self) -> Option<&mut J> {
        self.info.as_mut().map(|info| &mut info.job)
    }

    fn finish(&mut self) {
        let Some(mut info) = self.info.take() else {
            return;
        };
        if let Some(reader) = info.reader.take()
            && reader.join().is_err()
        {
            warn!(pid = ?info.pid, "Output reader thread panicked");
        }
        if let Some(mut rx) = info.output.take() {
            drain(&mut rx, &self.log);
        }
        if info.exit_code.get().is_running() {
            info.exit_code.record_exit(-1);
        }
        debug!(pid = ?info.pid, exit_code = %info.exit_code(), "Process completed");
        info.pid = None;

        if let Some(callback) = self.on_complete.take() {
            callback(info);
        }
    }
}

impl<J> Drop for BackgroundProcess<J> {
    fn drop(&mut self) {
        if let Some(pid) = self.pid()
            && process_alive(pid)
        {
            warn!(pid, "Supervisor dropped while process still running, killing it");
            kill_process_tree(pid);
        }
    }
}

impl<J> std::fmt::Debug for BackgroundProcess<J> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundProcess")
            .field("pid", &self.pid())
            .field("launched", &self.launched)
            .field("exit_code", &self.exit_code())
            .finish_non_exhaustive()
    }
}

/// Spawn with stdout and stderr sharing one pipe.
fn spawn_merged(command: &InferenceCommand) -> Result<(Child, std::io::PipeReader), ProcessError> {
    let spawn_error = |source| ProcessError::Spawn {
        program: command.program_name(),
        source,
    };
    let (reader, writer) = std::io::pipe().map_err(spawn_error)?;
    let writer_err = writer.try_clone().map_err(spawn_error)?;

    let mut cmd = command.to_std();
    cmd.stdin(Stdio::null()).stdout(writer).stderr(writer_err);
    let child = cmd.spawn().map_err(spawn_error)?;
    // Our copies of the write end must be closed or the reader never sees EOF.
    drop(cmd);
    Ok((child, reader))
}

fn pump_output(
    output: impl Read,
    mut child: Child,
    tx: mpsc::UnboundedSender<String>,
    exit_code: Arc<ExitCodeCell>,
) {
    for_each_line(output, |line| {
        let _ = tx.send(line);
    });
    let code = wait_for_exit(&mut child);
    if !exit_code.record_exit(code) {
        debug!(pid = child.id(), code, "Exit code ignored, job already cancelled");
    }
}

/// Read `output` to EOF, handing each UTF-8 line without its line ending.
fn for_each_line(output: impl Read, mut on_line: impl FnMut(String)) {
    let mut reader = BufReader::new(output);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => match String::from_utf8(std::mem::take(&mut buf)) {
                Ok(mut line) => {
                    let trimmed = line.trim_end_matches(['\r', '\n']).len();
                    line.truncate(trimmed);
                    on_line(line);
                }
                Err(_) => trace!("Discarding output line that is not valid UTF-8"),
            },
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "Output stream read failed");
                break;
            }
        }
    }
}

fn wait_for_exit(child: &mut Child) -> i32 {
    match child.wait() {
        Ok(status) => status_code(status),
        Err(e) => {
            warn!(pid = child.id(), error = %e, "Failed to wait for process");
            -1
        }
    }
}

fn status_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal().map_or(-1, |signal| -signal)
    }
    #[cfg(not(unix))]
    {
        -1
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<String>, log: &LogSink) {
    while let Ok(line) = rx.try_recv() {
        log(&line);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::JobOutcome;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    type Lines = Arc<Mutex<Vec<String>>>;

    fn collecting_sink() -> (LogSink, Lines) {
        let lines: Lines = Arc::default();
        let sink_lines = Arc::clone(&lines);
        let sink: LogSink = Arc::new(move |line: &str| {
            sink_lines.lock().unwrap().push(line.to_string());
        });
        (sink, lines)
    }

    fn sh(script: &str) -> InferenceCommand {
        InferenceCommand::new("sh").args(["-c", script])
    }

    fn poll_to_completion<J>(process: &mut BackgroundProcess<J>) {
        let start = Instant::now();
        while process.poll() == PollStatus::Pending {
            assert!(start.elapsed() < Duration::from_secs(20), "job never completed");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Completion callback that records how often it ran and with what code.
    fn counting_hooks(log: LogSink) -> (ProcessHooks<()>, Arc<AtomicUsize>, Arc<Mutex<Option<ExitCode>>>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let code = Arc::new(Mutex::new(None));
        let (c, k) = (Arc::clone(&calls), Arc::clone(&code));
        let hooks = ProcessHooks::new(log).on_complete(move |info: ProcessInfo<()>| {
            c.fetch_add(1, Ordering::SeqCst);
            *k.lock().unwrap() = Some(info.exit_code());
        });
        (hooks, calls, code)
    }

    #[test]
    fn test_lines_arrive_in_order() {
        let (sink, lines) = collecting_sink();
        let mut process = BackgroundProcess::new(ProcessInfo::new(()), ProcessHooks::new(sink));
        process.launch(&sh("echo A; echo B >&2; echo C")).unwrap();
        poll_to_completion(&mut process);

        assert_eq!(*lines.lock().unwrap(), vec!["A", "B", "C"]);
        assert_eq!(process.exit_code(), ExitCode::Exited(0));
        assert_eq!(process.state(), JobState::CompletedOk);
    }

    #[test]
    fn test_invalid_utf8_line_is_dropped() {
        let (sink, lines) = collecting_sink();
        let mut process = BackgroundProcess::new(ProcessInfo::new(()), ProcessHooks::new(sink));
        process.launch(&sh(r"printf '\377\376\nOK\n'")).unwrap();
        poll_to_completion(&mut process);

        assert_eq!(*lines.lock().unwrap(), vec!["OK"]);
    }

    #[test]
    fn test_carriage_returns_are_trimmed() {
        let (sink, lines) = collecting_sink();
        let mut process = BackgroundProcess::new(ProcessInfo::new(()), ProcessHooks::new(sink));
        process.launch(&sh(r"printf 'a\r\nb\n'")).unwrap();
        poll_to_completion(&mut process);

        assert_eq!(*lines.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_completion_fires_once_after_all_output() {
        let (sink, lines) = collecting_sink();
        let seen_at_completion: Lines = Arc::default();
        let (seen, observed) = (Arc::clone(&seen_at_completion), Arc::clone(&lines));
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let hooks = ProcessHooks::new(sink).on_complete(move |info: ProcessInfo<()>| {
            c.fetch_add(1, Ordering::SeqCst);
            assert!(info.pid().is_none());
            *seen.lock().unwrap() = observed.lock().unwrap().clone();
        });

        let mut process = BackgroundProcess::new(ProcessInfo::new(()), hooks);
        process.launch(&sh("for i in 1 2 3 4 5; do echo line$i; done")).unwrap();
        poll_to_completion(&mut process);
        for _ in 0..3 {
            assert_eq!(process.poll(), PollStatus::Completed);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(seen_at_completion.lock().unwrap().len(), 5);
        assert!(process.is_completed());
    }

    #[test]
    fn test_nonzero_and_signal_exit_codes() {
        let mut failing = BackgroundProcess::new(ProcessInfo::new(()), ProcessHooks::tracing());
        failing.launch(&sh("exit 3")).unwrap();
        poll_to_completion(&mut failing);
        assert_eq!(failing.exit_code(), ExitCode::Exited(3));
        assert_eq!(failing.state(), JobState::CompletedError);

        let mut killed = BackgroundProcess::new(ProcessInfo::new(()), ProcessHooks::tracing());
        killed.launch(&sh("kill -9 $$")).unwrap();
        poll_to_completion(&mut killed);
        assert_eq!(killed.exit_code(), ExitCode::Exited(-9));
    }

    #[test]
    fn test_second_launch_is_rejected() {
        let mut process = BackgroundProcess::new(ProcessInfo::new(()), ProcessHooks::tracing());
        process.launch(&sh("true")).unwrap();
        let err = process.launch(&sh("true")).unwrap_err();
        assert!(matches!(err, ProcessError::AlreadyLaunched));
        poll_to_completion(&mut process);
    }

    #[test]
    fn test_missing_executable_fails_to_launch() {
        let (sink, _) = collecting_sink();
        let (hooks, calls, _) = counting_hooks(sink);
        let mut process = BackgroundProcess::new(ProcessInfo::new(()), hooks);
        let err = process
            .launch(&InferenceCommand::new("/nonexistent/auto3dseg-python"))
            .unwrap_err();

        assert!(matches!(err, ProcessError::Spawn { .. }));
        assert!(!process.is_launched());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_latches_user_cancelled() {
        let (sink, _) = collecting_sink();
        let (hooks, calls, code) = counting_hooks(sink);
        let mut process = BackgroundProcess::new(ProcessInfo::new(()), hooks);
        process.launch(&sh("sleep 30; exit 0")).unwrap();
        assert!(process.is_running());

        process.request_cancel();
        poll_to_completion(&mut process);

        assert_eq!(*code.lock().unwrap(), Some(ExitCode::UserCancelled));
        assert_eq!(process.state(), JobState::Cancelled);
        assert!(!process.is_running());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_double_cancel_is_idempotent() {
        let (sink, _) = collecting_sink();
        let (hooks, calls, code) = counting_hooks(sink);
        let mut process = BackgroundProcess::new(ProcessInfo::new(()), hooks);
        process.launch(&sh("sleep 30")).unwrap();

        process.request_cancel();
        process.request_cancel();
        poll_to_completion(&mut process);
        process.request_cancel();

        assert_eq!(*code.lock().unwrap(), Some(ExitCode::UserCancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_after_exit_before_drain_reports_cancelled() {
        let (sink, _) = collecting_sink();
        let (hooks, calls, code) = counting_hooks(sink);
        let mut process = BackgroundProcess::new(ProcessInfo::new(()), hooks);
        process.launch(&sh("exit 0")).unwrap();

        let start = Instant::now();
        while !process.info().unwrap().reader.as_ref().unwrap().is_finished() {
            assert!(start.elapsed() < Duration::from_secs(20));
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(process.exit_code(), ExitCode::Exited(0));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        process.request_cancel();
        poll_to_completion(&mut process);

        assert_eq!(*code.lock().unwrap(), Some(ExitCode::UserCancelled));
        assert_eq!(process.state(), JobState::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_before_launch_completes_immediately() {
        let (sink, _) = collecting_sink();
        let (hooks, calls, code) = counting_hooks(sink);
        let mut process = BackgroundProcess::new(ProcessInfo::new(()), hooks);

        process.request_cancel();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*code.lock().unwrap(), Some(ExitCode::UserCancelled));
        assert!(matches!(
            process.launch(&sh("true")),
            Err(ProcessError::AlreadyLaunched)
        ));
    }

    #[test]
    fn test_run_blocking_logs_and_completes() {
        let (sink, lines) = collecting_sink();
        let (hooks, calls, code) = counting_hooks(sink);
        let mut process = BackgroundProcess::new(ProcessInfo::new(()), hooks);

        let exit = process
            .run_blocking(&sh("echo line1; echo line2; exit 0"))
            .unwrap();

        assert_eq!(exit, ExitCode::Exited(0));
        assert_eq!(*lines.lock().unwrap(), vec!["line1", "line2"]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*code.lock().unwrap(), Some(ExitCode::Exited(0)));
    }

    #[tokio::test]
    async fn test_monitor_with_cancel_handle() {
        let mut process = BackgroundProcess::new(
            ProcessInfo::new(()),
            ProcessHooks::tracing().on_complete(|info: ProcessInfo<()>| {
                assert_eq!(info.outcome(), JobOutcome::Cancelled);
            }),
        );
        process.launch(&sh("sleep 30")).unwrap();
        let handle = process.cancel_handle();

        let monitor = tokio::spawn(async move {
            process.monitor(Duration::from_millis(20)).await;
            process
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();

        let process = tokio::time::timeout(Duration::from_secs(20), monitor)
            .await
            .expect("monitor did not finish")
            .unwrap();
        assert!(handle.is_cancel_requested());
        assert!(process.is_completed());
        assert_eq!(process.exit_code(), ExitCode::UserCancelled);
    }

    #[test]
    fn test_drop_kills_running_process() {
        let mut process = BackgroundProcess::new(ProcessInfo::new(()), ProcessHooks::tracing());
        process.launch(&sh("sleep 30")).unwrap();
        let pid = process.pid().unwrap();
        drop(process);

        let start = Instant::now();
        while process_alive(pid) {
            assert!(start.elapsed() < Duration::from_secs(10), "process survived drop");
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}
