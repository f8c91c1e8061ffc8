//! Video transcoding via `ffmpeg`

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use super::artifacts::ArtifactLayout;
use super::tool::{run_tool, ErrorPatterns};
use super::{mismatched_options, read_input_header, staging_error, Executor};
use crate::error::Result;
use crate::types::{Container, ErrorKind, Job, JobError, JobOptions, JobType, Outcome, TranscodeOptions};

/// MPEG-TS packets are 188 bytes; two sync bytes identify the stream
const TS_PACKET: usize = 188;

const PATTERNS: &[(&str, ErrorKind, bool)] = &[
    (
        r"invalid data found when processing input|moov atom not found|could not find codec parameters|ebml header parsing failed",
        ErrorKind::Validation,
        true,
    ),
    (r"unknown encoder|encoder \S+ not found", ErrorKind::ToolExecution, true),
    (
        r"resource temporarily unavailable|cannot allocate memory|no space left on device|device or resource busy",
        ErrorKind::Transient,
        false,
    ),
];

/// Identify a video container by its leading bytes
fn container_kind(header: &[u8]) -> Option<&'static str> {
    if header.len() >= 8 && &header[4..8] == b"ftyp" {
        Some("mp4")
    } else if header.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        Some("matroska")
    } else if header.len() >= 12 && &header[0..4] == b"RIFF" && &header[8..12] == b"AVI " {
        Some("avi")
    } else if header.starts_with(b"OggS") {
        Some("ogg")
    } else if header.starts_with(b"FLV") {
        Some("flv")
    } else if header.starts_with(&[0x00, 0x00, 0x01, 0xBA]) {
        Some("mpeg-ps")
    } else if header.len() > TS_PACKET && header[0] == 0x47 && header[TS_PACKET] == 0x47 {
        Some("mpeg-ts")
    } else {
        None
    }
}

/// Re-encodes a video into the requested container and codec
pub struct TranscodeExecutor {
    program: PathBuf,
    patterns: ErrorPatterns,
}

impl TranscodeExecutor {
    pub fn new(program: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            program: program.into(),
            patterns: ErrorPatterns::new(PATTERNS)?,
        })
    }

    fn args(options: &TranscodeOptions, input: &Path, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-y".into(),
            "-i".into(),
            input.into(),
            "-c:v".into(),
            options.video_codec.encoder().into(),
            "-crf".into(),
            options.crf.to_string().into(),
        ];

        if options.video_codec.supports_preset() {
            args.push("-preset".into());
            args.push(options.preset.clone().into());
        } else {
            // Constant-quality mode for libvpx/libaom
            args.push("-b:v".into());
            args.push("0".into());
        }

        if let Some(height) = options.max_height {
            args.push("-vf".into());
            args.push(format!("scale=-2:min(ih\\,{})", height).into());
        }

        if options.audio {
            let audio_codec = match options.container {
                Container::Webm => "libopus",
                Container::Mp4 | Container::Mkv => "aac",
            };
            args.push("-c:a".into());
            args.push(audio_codec.into());
        } else {
            args.push("-an".into());
        }

        args.push(output.into());
        args
    }

    async fn run(&self, job: &Job, artifacts: &ArtifactLayout) -> std::result::Result<PathBuf, JobError> {
        let options = match &job.options {
            JobOptions::Transcode(options) => options,
            _ => return Err(mismatched_options(job, JobType::Transcode)),
        };

        let header = read_input_header(&job.input, TS_PACKET + 1).await?;
        let source = container_kind(&header).ok_or_else(|| {
            JobError::validation(format!(
                "input artifact {} is not a recognised video container",
                job.input.display()
            ))
        })?;

        let staging = artifacts.stage(job).map_err(staging_error)?;
        let output_path = staging
            .path()
            .join(format!("video.{}", options.container.extension()));
        let args = Self::args(options, &job.input, &output_path);

        tracing::info!(
            "Transcoding {} input for job {} with {}",
            source,
            job.id,
            options.video_codec.encoder()
        );

        let output = run_tool(&self.program, &args).await?;
        if !output.status.success() {
            return Err(self.patterns.classify("ffmpeg", output.status, &output.stderr));
        }

        if !output_path.is_file() {
            return Err(JobError::tool("ffmpeg exited successfully but wrote no output"));
        }

        staging.publish().map_err(staging_error)
    }
}

#[async_trait]
impl Executor for TranscodeExecutor {
    fn job_type(&self) -> JobType {
        JobType::Transcode
    }

    async fn execute(&self, job: &Job, artifacts: &ArtifactLayout) -> Outcome {
        self.run(job, artifacts).await.into()
    }
}
