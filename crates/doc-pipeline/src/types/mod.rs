//! Core types for the job pipeline

pub mod job;
pub mod options;

pub use job::{
    CancelAck, ErrorKind, Finalization, Job, JobError, JobStatus, JobStatusView, JobType, NewJob,
    Outcome, QueueStats,
};
pub use options::{
    CompressOptions, Container, ImageFormat, JobOptions, OcrOptions, OcrOutput, RasterFormat,
    RasterizeOptions, TranscodeOptions, VideoCodec,
};
