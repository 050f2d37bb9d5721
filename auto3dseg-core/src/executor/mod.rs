//! Inference executor trait and implementations.
//!
//! An executor takes a prepared job and eventually hands it back through the
//! completion callback in its hooks, exactly once. Errors returned from
//! `execute` mean the job never started; the callback is not invoked then.

pub mod local;
pub mod remote;

pub use local::LocalExecutor;
pub use remote::RemoteExecutor;

use crate::error::InferenceError;
use crate::process::{ProcessHooks, ProcessInfo, SegmentationJob};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Runs segmentation jobs somewhere: on this machine or on a server.
#[async_trait]
pub trait InferenceExecutor: Send + Sync {
    fn name(&self) -> &str;

    /// Run the job to completion. Cancelling `cancel` completes the job as
    /// user-cancelled.
    async fn execute(
        &self,
        info: ProcessInfo<SegmentationJob>,
        hooks: ProcessHooks<SegmentationJob>,
        cancel: CancellationToken,
    ) -> Result<(), InferenceError>;
}
