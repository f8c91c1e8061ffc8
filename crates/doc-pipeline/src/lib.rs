//! doc-pipeline: asynchronous document processing jobs over external tools
//!
//! Jobs (PDF rasterization, image compression, OCR, video transcoding) are
//! persisted in a [`storage::JobStore`], claimed by a [`processing::Dispatcher`]
//! under optimistic claim tokens, executed on a bounded
//! [`processing::WorkerPool`] with hard timeouts, and retried or failed by a
//! pure [`processing::RetryPolicy`].

pub mod config;
pub mod error;
pub mod executors;
pub mod processing;
pub mod storage;
pub mod types;

pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use executors::{ArtifactLayout, Executor, ExecutorRegistry};
pub use processing::{Dispatcher, Health, JobQueue, RetryPolicy, WorkerPool};
pub use storage::{JobStore, SqliteJobStore};
pub use types::{
    CancelAck, ErrorKind, Job, JobError, JobOptions, JobStatus, JobStatusView, JobType, NewJob,
    Outcome, QueueStats,
};
