//! PDF rasterization via poppler's `pdftoppm`

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use super::artifacts::ArtifactLayout;
use super::tool::{run_tool, ErrorPatterns};
use super::{mismatched_options, read_input_header, staged_files, staging_error, Executor};
use crate::error::Result;
use crate::types::{ErrorKind, Job, JobError, JobOptions, JobType, Outcome, RasterizeOptions};

const PDF_MAGIC: &[u8] = b"%PDF-";

const PATTERNS: &[(&str, ErrorKind, bool)] = &[
    (
        r"syntax error|couldn't find trailer|couldn't read xref|may not be a pdf file|pdf file is damaged",
        ErrorKind::Validation,
        true,
    ),
    (r"incorrect password", ErrorKind::Validation, true),
    (r"wrong page range", ErrorKind::Validation, true),
    (r"cannot allocate memory|out of memory|no space left on device", ErrorKind::Transient, false),
];

/// Renders each PDF page to an image file
pub struct RasterizeExecutor {
    program: PathBuf,
    patterns: ErrorPatterns,
}

impl RasterizeExecutor {
    pub fn new(program: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            program: program.into(),
            patterns: ErrorPatterns::new(PATTERNS)?,
        })
    }

    fn args(options: &RasterizeOptions, input: &Path, out_prefix: &Path) -> Vec<OsString> {
        let (flag, _) = options.format.pdftoppm_flag();
        let mut args: Vec<OsString> = vec![flag.into(), "-r".into(), options.dpi.to_string().into()];
        if let Some(first) = options.first_page {
            args.push("-f".into());
            args.push(first.to_string().into());
        }
        if let Some(last) = options.last_page {
            args.push("-l".into());
            args.push(last.to_string().into());
        }
        args.push(input.into());
        args.push(out_prefix.into());
        args
    }

    async fn run(&self, job: &Job, artifacts: &ArtifactLayout) -> std::result::Result<PathBuf, JobError> {
        let options = match &job.options {
            JobOptions::Rasterize(options) => options,
            _ => return Err(mismatched_options(job, JobType::Rasterize)),
        };

        let header = read_input_header(&job.input, PDF_MAGIC.len()).await?;
        if header != PDF_MAGIC {
            return Err(JobError::validation(format!(
                "input artifact {} is not a PDF",
                job.input.display()
            )));
        }

        let staging = artifacts.stage(job).map_err(staging_error)?;
        let args = Self::args(options, &job.input, &staging.path().join("page"));

        let output = run_tool(&self.program, &args).await?;
        if !output.status.success() {
            return Err(self.patterns.classify("pdftoppm", output.status, &output.stderr));
        }

        let pages = staged_files(staging.path()).map_err(staging_error)?;
        if pages.is_empty() {
            return Err(JobError::tool("pdftoppm exited successfully but produced no images"));
        }

        tracing::info!("Rasterized {} page(s) for job {}", pages.len(), job.id);
        staging.publish().map_err(staging_error)
    }
}

#[async_trait]
impl Executor for RasterizeExecutor {
    fn job_type(&self) -> JobType {
        JobType::Rasterize
    }

    async fn execute(&self, job: &Job, artifacts: &ArtifactLayout) -> Outcome {
        self.run(job, artifacts).await.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RasterFormat;
    use std::time::Duration;

    fn job(input: PathBuf, options: JobOptions) -> Job {
        let mut job = Job::pending(JobType::Rasterize, input, options, 0, 3, Duration::from_secs(30));
        job.claim_token = 1;
        job
    }

    #[test]
    fn test_args_include_page_range() {
        let options = RasterizeOptions {
            dpi: 300,
            format: RasterFormat::Jpeg,
            first_page: Some(2),
            last_page: Some(4),
        };
        let args = RasterizeExecutor::args(&options, Path::new("/in/a.pdf"), Path::new("/st/page"));
        let args: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec!["-jpeg", "-r", "300", "-f", "2", "-l", "4", "/in/a.pdf", "/st/page"]
        );
    }

    #[tokio::test]
    async fn test_non_pdf_input_is_validation_failure() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("fake.pdf");
        std::fs::write(&input, b"PK\x03\x04 not a pdf").unwrap();

        let executor = RasterizeExecutor::new("pdftoppm").unwrap();
        let layout = ArtifactLayout::new(dir.path().join("artifacts"));
        let outcome = executor
            .execute(&job(input, JobOptions::defaults(JobType::Rasterize)), &layout)
            .await;

        match outcome {
            Outcome::Failure(err) => {
                assert_eq!(err.kind, ErrorKind::Validation);
                assert!(err.is_permanent());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wrong_options_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let executor = RasterizeExecutor::new("pdftoppm").unwrap();
        let layout = ArtifactLayout::new(dir.path());
        let outcome = executor
            .execute(
                &job(dir.path().join("a.pdf"), JobOptions::defaults(JobType::Ocr)),
                &layout,
            )
            .await;
        assert!(matches!(outcome, Outcome::Failure(ref e) if e.kind == ErrorKind::Validation));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tool_stderr_classified_and_staging_removed() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("broken.pdf");
        std::fs::write(&input, b"%PDF-1.4 garbage").unwrap();

        // Stand-in tool that writes a partial page, then fails like pdftoppm on a corrupt file
        let tool = dir.path().join("fake-pdftoppm");
        std::fs::write(
            &tool,
            "#!/bin/sh\nfor last; do :; done\necho partial > \"$last-1.png\"\n\
             echo \"Syntax Error: Couldn't find trailer dictionary\" >&2\nexit 1\n",
        )
        .unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let executor = RasterizeExecutor::new(&tool).unwrap();
        let layout = ArtifactLayout::new(dir.path().join("artifacts"));
        let job = job(input, JobOptions::defaults(JobType::Rasterize));
        let outcome = executor.execute(&job, &layout).await;

        match outcome {
            Outcome::Failure(err) => {
                assert_eq!(err.kind, ErrorKind::Validation);
                assert!(err.permanent);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(!layout.result_dir(job.id, job.claim_token).exists());
        assert_eq!(std::fs::read_dir(layout.staging_root()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_success_publishes_pages() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("doc.pdf");
        std::fs::write(&input, b"%PDF-1.7\n...").unwrap();

        let tool = dir.path().join("fake-pdftoppm");
        std::fs::write(
            &tool,
            "#!/bin/sh\nfor last; do :; done\necho p1 > \"$last-1.png\"\necho p2 > \"$last-2.png\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let executor = RasterizeExecutor::new(&tool).unwrap();
        let layout = ArtifactLayout::new(dir.path().join("artifacts"));
        let job = job(input, JobOptions::defaults(JobType::Rasterize));

        match executor.execute(&job, &layout).await {
            Outcome::Success { result } => {
                assert_eq!(result, layout.result_dir(job.id, 1));
                assert_eq!(staged_files(&result).unwrap().len(), 2);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
