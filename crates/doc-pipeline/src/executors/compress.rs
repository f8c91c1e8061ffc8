//! Image recompression via ImageMagick

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use super::artifacts::ArtifactLayout;
use super::tool::{run_tool, ErrorPatterns};
use super::{mismatched_options, require_image, staging_error, Executor};
use crate::error::Result;
use crate::types::{CompressOptions, ErrorKind, Job, JobError, JobOptions, JobType, Outcome};

const PATTERNS: &[(&str, ErrorKind, bool)] = &[
    (
        r"improper image header|corrupt image|insufficient image data|not a jpeg file|premature end of|no decode delegate",
        ErrorKind::Validation,
        true,
    ),
    (r"no encode delegate|unable to open module", ErrorKind::ToolExecution, true),
    (
        r"cache resources exhausted|memory allocation failed|resource limit|no space left on device",
        ErrorKind::Transient,
        false,
    ),
];

/// Re-encodes an image at a target quality, optionally resized
pub struct CompressExecutor {
    program: PathBuf,
    patterns: ErrorPatterns,
}

impl CompressExecutor {
    pub fn new(program: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            program: program.into(),
            patterns: ErrorPatterns::new(PATTERNS)?,
        })
    }

    fn args(options: &CompressOptions, input: &Path, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![input.into()];
        if options.strip_metadata {
            args.push("-strip".into());
        }
        let geometry = match (options.max_width, options.max_height) {
            (Some(w), Some(h)) => Some(format!("{}x{}>", w, h)),
            (Some(w), None) => Some(format!("{}>", w)),
            (None, Some(h)) => Some(format!("x{}>", h)),
            (None, None) => None,
        };
        if let Some(geometry) = geometry {
            args.push("-resize".into());
            args.push(geometry.into());
        }
        args.push("-quality".into());
        args.push(options.quality.to_string().into());
        args.push(output.into());
        args
    }

    async fn run(&self, job: &Job, artifacts: &ArtifactLayout) -> std::result::Result<PathBuf, JobError> {
        let options = match &job.options {
            JobOptions::Compress(options) => options,
            _ => return Err(mismatched_options(job, JobType::Compress)),
        };

        let input_kind = require_image(&job.input).await?;
        let extension = options.format.map_or(input_kind, |f| f.extension());

        let staging = artifacts.stage(job).map_err(staging_error)?;
        let output_path = staging.path().join(format!("compressed.{}", extension));
        let args = Self::args(options, &job.input, &output_path);

        let output = run_tool(&self.program, &args).await?;
        if !output.status.success() {
            return Err(self.patterns.classify("magick", output.status, &output.stderr));
        }

        let size = std::fs::metadata(&output_path).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            return Err(JobError::tool("magick exited successfully but wrote no image"));
        }

        tracing::info!("Compressed image for job {} to {} bytes", job.id, size);
        staging.publish().map_err(staging_error)
    }
}

#[async_trait]
impl Executor for CompressExecutor {
    fn job_type(&self) -> JobType {
        JobType::Compress
    }

    async fn execute(&self, job: &Job, artifacts: &ArtifactLayout) -> Outcome {
        self.run(job, artifacts).await.into()
    }
}
