//! Text extraction via `tesseract`

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use super::artifacts::ArtifactLayout;
use super::tool::{run_tool, ErrorPatterns};
use super::{mismatched_options, require_image, staging_error, Executor};
use crate::error::Result;
use crate::types::{ErrorKind, Job, JobError, JobOptions, JobType, OcrOptions, Outcome};

const PATTERNS: &[(&str, ErrorKind, bool)] = &[
    // Missing traineddata is an installation problem, not a property of the input
    (r"failed loading language|error opening data file", ErrorKind::ToolExecution, true),
    (
        r"image too (small|large)|unsupported image type|error in pixreadstream|cannot be read",
        ErrorKind::Validation,
        true,
    ),
    (r"cannot allocate memory|out of memory", ErrorKind::Transient, false),
];

/// Recognizes text in an image
pub struct OcrExecutor {
    program: PathBuf,
    patterns: ErrorPatterns,
}

impl OcrExecutor {
    pub fn new(program: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            program: program.into(),
            patterns: ErrorPatterns::new(PATTERNS)?,
        })
    }

    fn args(options: &OcrOptions, input: &Path, out_base: &Path) -> Vec<OsString> {
        let (config, _) = options.output.tesseract_config();
        vec![
            input.into(),
            out_base.into(),
            "-l".into(),
            options.language.clone().into(),
            "--psm".into(),
            options.psm.to_string().into(),
            config.into(),
        ]
    }

    async fn run(&self, job: &Job, artifacts: &ArtifactLayout) -> std::result::Result<PathBuf, JobError> {
        let options = match &job.options {
            JobOptions::Ocr(options) => options,
            _ => return Err(mismatched_options(job, JobType::Ocr)),
        };

        require_image(&job.input).await?;

        let staging = artifacts.stage(job).map_err(staging_error)?;
        let out_base = staging.path().join("text");
        let args = Self::args(options, &job.input, &out_base);

        let output = run_tool(&self.program, &args).await?;
        if !output.status.success() {
            return Err(self.patterns.classify("tesseract", output.status, &output.stderr));
        }

        let (_, extension) = options.output.tesseract_config();
        let produced = out_base.with_extension(extension);
        if !produced.is_file() {
            return Err(JobError::tool(format!(
                "tesseract exited successfully but {} is missing",
                produced.display()
            )));
        }

        tracing::info!("OCR finished for job {} ({})", job.id, options.language);
        staging.publish().map_err(staging_error)
    }
}

#[async_trait]
impl Executor for OcrExecutor {
    fn job_type(&self) -> JobType {
        JobType::Ocr
    }

    async fn execute(&self, job: &Job, artifacts: &ArtifactLayout) -> Outcome {
        self.run(job, artifacts).await.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OcrOutput;
    use std::time::Duration;

    #[test]
    fn test_args() {
        let options = OcrOptions {
            language: "eng+deu".to_string(),
            psm: 6,
            output: OcrOutput::Hocr,
        };
        let args: Vec<String> = OcrExecutor::args(&options, Path::new("/in/scan.tif"), Path::new("/st/text"))
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec!["/in/scan.tif", "/st/text", "-l", "eng+deu", "--psm", "6", "hocr"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_language_pack_is_permanent() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("scan.png");
        std::fs::write(&input, b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR").unwrap();

        let tool = dir.path().join("fake-tesseract");
        std::fs::write(
            &tool,
            "#!/bin/sh\necho \"Error opening data file /usr/share/tessdata/xyz.traineddata\" >&2\n\
             echo \"Failed loading language 'xyz'\" >&2\nexit 1\n",
        )
        .unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let executor = OcrExecutor::new(&tool).unwrap();
        let job = Job::pending(
            JobType::Ocr,
            input,
            JobOptions::defaults(JobType::Ocr),
            0,
            3,
            Duration::from_secs(5),
        );

        match executor.execute(&job, &ArtifactLayout::new(dir.path().join("a"))).await {
            Outcome::Failure(err) => {
                assert_eq!(err.kind, ErrorKind::ToolExecution);
                assert!(err.permanent);
                assert!(err.message.contains("Failed loading language"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_output_is_tool_error() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("scan.jpg");
        std::fs::write(&input, [0xFF, 0xD8, 0xFF, 0xE0, 0, 0x10]).unwrap();

        let tool = dir.path().join("fake-tesseract");
        std::fs::write(&tool, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let executor = OcrExecutor::new(&tool).unwrap();
        let job = Job::pending(
            JobType::Ocr,
            input,
            JobOptions::defaults(JobType::Ocr),
            0,
            3,
            Duration::from_secs(5),
        );

        match executor.execute(&job, &ArtifactLayout::new(dir.path().join("a"))).await {
            Outcome::Failure(err) => {
                assert_eq!(err.kind, ErrorKind::ToolExecution);
                assert!(!err.is_permanent());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
