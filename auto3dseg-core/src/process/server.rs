//! Supervised inference server process.

use super::background::{BackgroundProcess, CancelHandle, PollStatus};
use super::exit_code::ExitCode;
use super::info::ProcessInfo;
use super::{LogSink, ProcessHooks};
use crate::command::InferenceCommand;
use crate::error::ProcessError;
use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";
pub const DEFAULT_SERVER_PORT: u16 = 8891;

/// Runs `<server-exe> --host H --port P` in the background.
#[derive(Debug)]
pub struct InferenceServer {
    process: BackgroundProcess<()>,
    host: String,
    port: u16,
}

impl InferenceServer {
    pub fn new(log: LogSink) -> Self {
        Self::with_address(log, DEFAULT_SERVER_HOST, DEFAULT_SERVER_PORT)
    }

    pub fn with_address(log: LogSink, host: impl Into<String>, port: u16) -> Self {
        let stopped_log = Arc::clone(&log);
        let hooks = ProcessHooks::new(log).on_complete(move |info: ProcessInfo<()>| {
            info!(exit_code = %info.exit_code(), "Inference server exited");
            stopped_log("Server stopped");
        });
        Self {
            process: BackgroundProcess::new(ProcessInfo::new(()), hooks),
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn address_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Command line used by [`start`](Self::start).
    pub fn start_command(&self, executable: impl Into<OsString>) -> InferenceCommand {
        InferenceCommand::new(executable)
            .arg("--host")
            .arg(self.host.as_str())
            .arg("--port")
            .arg(self.port.to_string())
    }

    pub fn start(&mut self, executable: impl Into<OsString>) -> Result<(), ProcessError> {
        let command = self.start_command(executable);
        self.start_with(&command)
    }

    /// Launch an arbitrary server command. Always asynchronous.
    pub fn start_with(&mut self, command: &InferenceCommand) -> Result<(), ProcessError> {
        self.process.launch(command)?;
        info!(url = %self.address_url(), pid = ?self.process.pid(), "Inference server launched");
        self.process.log("Server started");
        Ok(())
    }

    pub fn stop(&mut self) {
        self.process.request_cancel();
    }

    pub fn is_running(&self) -> bool {
        self.process.is_running()
    }

    pub fn exit_code(&self) -> ExitCode {
        self.process.exit_code()
    }

    pub fn poll(&mut self) -> PollStatus {
        self.process.poll()
    }

    pub async fn monitor(&mut self, interval: Duration) {
        self.process.monitor(interval).await;
    }

    /// Stop the server and keep polling until the completion hook has run.
    pub async fn shutdown(&mut self, interval: Duration) {
        self.stop();
        self.monitor(interval).await;
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.process.cancel_handle()
    }
}
