//! # auto3dseg core
//!
//! Job lifecycle engine for MONAI Auto3DSeg segmentation inference. The
//! inference toolchain is treated as an opaque command: it is launched as a
//! child process, its merged output is streamed to a log sink, and its exit
//! code decides the job outcome.
//!
//! - [`process`]: one-shot process supervision with cancellation and
//!   exactly-once completion
//! - [`catalog`]: `Models.json` model catalog and model cache
//! - [`executor`]: local and remote inference executors
//! - [`logic`]: request-level orchestration
//! - [`config`]: layered configuration

pub mod catalog;
pub mod command;
pub mod config;
pub mod error;
pub mod executor;
pub mod logic;
pub mod process;

pub use catalog::{ModelCatalog, ModelDescription, ModelDownloader};
pub use command::InferenceCommand;
pub use config::{Auto3dSegConfig, load_config};
pub use error::{Auto3dSegError, CatalogError, ConfigError, InferenceError, ProcessError, Result};
pub use executor::{InferenceExecutor, LocalExecutor, RemoteExecutor};
pub use logic::{ResultImporter, SegmentationLogic, SegmentationReport, SegmentationRequest};
pub use process::{
    BackgroundProcess, CancelHandle, ExecutionMode, ExitCode, InferenceServer, JobOutcome,
    JobState, LocalInference, LogSink, PollStatus, ProcessHooks, ProcessInfo, SegmentationJob,
};
