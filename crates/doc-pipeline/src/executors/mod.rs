//! Executor adapters: one per job type, each wrapping an external tool
//!
//! An adapter checks the input artifact, builds the tool invocation from the
//! job's options, runs it in a private staging directory and classifies the
//! result. Outputs are published atomically under the artifact root.

mod artifacts;
mod compress;
mod ocr;
mod rasterize;
mod tool;
mod transcode;

pub use artifacts::{ArtifactLayout, StagingDir};
pub use compress::CompressExecutor;
pub use ocr::OcrExecutor;
pub use rasterize::RasterizeExecutor;
pub use tool::{run_tool, ErrorPatterns, ToolOutput};
pub use transcode::TranscodeExecutor;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;

use crate::config::ToolsConfig;
use crate::error::Result;
use crate::types::{Job, JobError, JobType, Outcome};

/// Performs the processing of one job type
#[async_trait]
pub trait Executor: Send + Sync {
    /// Job type handled by this executor
    fn job_type(&self) -> JobType;

    /// Run one attempt of `job`. Never panics on bad input; every failure is
    /// reported as [`Outcome::Failure`].
    async fn execute(&self, job: &Job, artifacts: &ArtifactLayout) -> Outcome;
}

/// Executors by job type
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<JobType, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the four tool-backed executors
    pub fn with_defaults(tools: &ToolsConfig) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(RasterizeExecutor::new(&tools.pdftoppm)?));
        registry.register(Arc::new(CompressExecutor::new(&tools.magick)?));
        registry.register(Arc::new(OcrExecutor::new(&tools.tesseract)?));
        registry.register(Arc::new(TranscodeExecutor::new(&tools.ffmpeg)?));
        Ok(registry)
    }

    /// Register an executor, replacing any previous one for its type
    pub fn register(&mut self, executor: Arc<dyn Executor>) -> &mut Self {
        self.executors.insert(executor.job_type(), executor);
        self
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn Executor>> {
        self.executors.get(&job_type).cloned()
    }

    pub fn job_types(&self) -> Vec<JobType> {
        JobType::ALL
            .into_iter()
            .filter(|t| self.executors.contains_key(t))
            .collect()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl From<std::result::Result<PathBuf, JobError>> for Outcome {
    fn from(result: std::result::Result<PathBuf, JobError>) -> Self {
        match result {
            Ok(path) => Outcome::success(path),
            Err(error) => Outcome::failure(error),
        }
    }
}

/// Read up to `len` leading bytes of the input artifact.
///
/// A missing or unreadable input is a permanent validation failure.
pub(crate) async fn read_input_header(path: &Path, len: usize) -> std::result::Result<Vec<u8>, JobError> {
    let metadata = tokio::fs::metadata(path).await.map_err(|e| {
        JobError::validation(format!("input artifact {} is not accessible: {}", path.display(), e))
    })?;
    if !metadata.is_file() {
        return Err(JobError::validation(format!(
            "input artifact {} is not a regular file",
            path.display()
        )));
    }

    let file = tokio::fs::File::open(path).await.map_err(|e| {
        JobError::validation(format!("input artifact {} cannot be opened: {}", path.display(), e))
    })?;

    let mut header = Vec::with_capacity(len);
    file.take(len as u64)
        .read_to_end(&mut header)
        .await
        .map_err(|e| JobError::transient(format!("failed reading {}: {}", path.display(), e)))?;

    Ok(header)
}

/// Bytes needed by [`image_kind`]
pub(crate) const IMAGE_HEADER_LEN: usize = 12;

/// Identify a raster image by its magic bytes; returns its usual extension
pub(crate) fn image_kind(header: &[u8]) -> Option<&'static str> {
    if header.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("png")
    } else if header.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("jpg")
    } else if header.starts_with(b"GIF87a") || header.starts_with(b"GIF89a") {
        Some("gif")
    } else if header.starts_with(b"II*\0") || header.starts_with(b"MM\0*") {
        Some("tif")
    } else if header.len() >= 12 && &header[0..4] == b"RIFF" && &header[8..12] == b"WEBP" {
        Some("webp")
    } else if header.starts_with(b"BM") {
        Some("bmp")
    } else {
        None
    }
}

/// Validate an image input shared by the compress and OCR adapters
pub(crate) async fn require_image(path: &Path) -> std::result::Result<&'static str, JobError> {
    let header = read_input_header(path, IMAGE_HEADER_LEN).await?;
    image_kind(&header).ok_or_else(|| {
        JobError::validation(format!("input artifact {} is not a supported image", path.display()))
    })
}

/// Options of the wrong variant reached an executor
pub(crate) fn mismatched_options(job: &Job, expected: JobType) -> JobError {
    JobError::validation(format!(
        "job {} carries {} options but was routed to the {} executor",
        job.id,
        job.options.job_type(),
        expected
    ))
}

/// Staging I/O failure; the attempt may succeed on another try
pub(crate) fn staging_error(e: std::io::Error) -> JobError {
    JobError::transient(format!("artifact staging failed: {}", e))
}

/// Files directly inside `dir`, sorted
pub(crate) fn staged_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    Ok(files)
}
