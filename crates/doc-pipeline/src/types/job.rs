//! Job model: identity, lifecycle status, failures and outcomes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use super::options::JobOptions;
use crate::error::Error;

/// Kind of processing a job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    /// PDF pages to images (pdftoppm)
    Rasterize,
    /// Image recompression (ImageMagick)
    Compress,
    /// Text extraction from images (tesseract)
    Ocr,
    /// Video transcoding (ffmpeg)
    Transcode,
}

impl JobType {
    pub const ALL: [JobType; 4] = [
        JobType::Rasterize,
        JobType::Compress,
        JobType::Ocr,
        JobType::Transcode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Rasterize => "rasterize",
            JobType::Compress => "compress",
            JobType::Ocr => "ocr",
            JobType::Transcode => "transcode",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "rasterize" => Ok(JobType::Rasterize),
            "compress" => Ok(JobType::Compress),
            "ocr" => Ok(JobType::Ocr),
            "transcode" => Ok(JobType::Transcode),
            other => Err(Error::validation(format!("unknown job type '{}'", other))),
        }
    }
}

/// Lifecycle status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Returns true if no further transitions are possible.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a failed execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input artifact or options; never retried
    Validation,
    /// Nonzero exit, crash or malformed output of the external tool
    ToolExecution,
    /// Execution exceeded its wall-clock budget
    Timeout,
    /// Known-transient condition (resource pressure, busy device)
    Transient,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::ToolExecution => "tool_execution",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Transient => "transient",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "validation" => Some(ErrorKind::Validation),
            "tool_execution" => Some(ErrorKind::ToolExecution),
            "timeout" => Some(ErrorKind::Timeout),
            "transient" => Some(ErrorKind::Transient),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure recorded on a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    /// Set by an adapter's pattern table to stop retries of an otherwise
    /// retryable kind
    #[serde(default)]
    pub permanent: bool,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            permanent: false,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn tool(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ToolExecution, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    /// Mark the failure as permanent
    pub fn permanent(mut self) -> Self {
        self.permanent = true;
        self
    }

    pub fn is_permanent(&self) -> bool {
        self.permanent || self.kind == ErrorKind::Validation
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Result of running an executor for one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Output published at `result`
    Success { result: PathBuf },
    /// Attempt failed
    Failure(JobError),
    /// Execution was stopped by a cancellation request (worker pool only)
    Cancelled,
}

impl Outcome {
    pub fn success(result: impl Into<PathBuf>) -> Self {
        Outcome::Success {
            result: result.into(),
        }
    }

    pub fn failure(error: JobError) -> Self {
        Outcome::Failure(error)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }
}

/// A persisted unit of document processing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    /// Higher is dispatched first
    pub priority: i32,
    /// Location of the input artifact
    pub input: PathBuf,
    pub options: JobOptions,
    /// Failed executions so far
    pub attempts: u32,
    pub max_attempts: u32,
    pub timeout: Duration,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Worker identity; set iff running
    pub claimed_by: Option<String>,
    /// Version stamp bumped on every claim and cancellation
    pub claim_token: i64,
    /// Not claimable before this instant
    pub backoff_until: Option<DateTime<Utc>>,
    /// Running claims older than this are reclaimed by the reaper
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Output location; set iff succeeded
    pub result: Option<PathBuf>,
    /// Terminal failure; set iff failed
    pub error: Option<JobError>,
}

impl Job {
    /// Create a new pending job
    pub fn pending(
        job_type: JobType,
        input: PathBuf,
        options: JobOptions,
        priority: i32,
        max_attempts: u32,
        timeout: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type,
            status: JobStatus::Pending,
            priority,
            input,
            options,
            attempts: 0,
            max_attempts,
            timeout,
            created_at: now,
            updated_at: now,
            claimed_by: None,
            claim_token: 0,
            backoff_until: None,
            lease_expires_at: None,
            result: None,
            error: None,
        }
    }

    /// Read-only projection returned by status queries
    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            job_id: self.id,
            job_type: self.job_type,
            status: self.status,
            attempts: self.attempts,
            error: self.error.clone(),
            result: self.result.clone(),
        }
    }
}

/// Submission request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: String,
    pub input: PathBuf,
    #[serde(default)]
    pub options: serde_json::Value,
    #[serde(default)]
    pub priority: i32,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, input: impl Into<PathBuf>) -> Self {
        Self {
            job_type: job_type.into(),
            input: input.into(),
            options: serde_json::Value::Null,
            priority: 0,
        }
    }

    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Status query response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatusView {
    pub job_id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub attempts: u32,
    pub error: Option<JobError>,
    pub result: Option<PathBuf>,
}

/// Terminal update applied by `JobStore::finalize`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finalization {
    Succeeded { result: PathBuf },
    Failed { error: JobError },
}

/// Acknowledgement of a cancellation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelAck {
    pub job_id: Uuid,
    /// Status after the request; `cancelled` or the job's earlier terminal status
    pub status: JobStatus,
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total_jobs: usize,
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_type_parsing() {
        assert_eq!("rasterize".parse::<JobType>().unwrap(), JobType::Rasterize);
        assert_eq!(" OCR ".parse::<JobType>().unwrap(), JobType::Ocr);
        let err = "thumbnail".parse::<JobType>().unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_status_round_trip_and_terminal() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_permanence() {
        assert!(JobError::validation("corrupt pdf").is_permanent());
        assert!(!JobError::tool("exit 1").is_permanent());
        assert!(JobError::tool("unknown encoder").permanent().is_permanent());
        assert!(!JobError::timeout("5s").is_permanent());
    }
}
