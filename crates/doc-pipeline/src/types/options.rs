//! Per-type option schemas
//!
//! Options arrive as a JSON map at submission, are checked against the
//! schema of the job type, and are persisted in their typed form.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::job::JobType;
use crate::error::{Error, Result};

/// Output image format for rasterization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RasterFormat {
    Png,
    Jpeg,
    Tiff,
}

impl RasterFormat {
    /// pdftoppm flag and produced file extension
    pub fn pdftoppm_flag(&self) -> (&'static str, &'static str) {
        match self {
            RasterFormat::Png => ("-png", "png"),
            RasterFormat::Jpeg => ("-jpeg", "jpg"),
            RasterFormat::Tiff => ("-tiff", "tif"),
        }
    }
}

/// Options for `rasterize` jobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RasterizeOptions {
    /// Render resolution (36-1200, default 150)
    pub dpi: u32,
    pub format: RasterFormat,
    pub first_page: Option<u32>,
    pub last_page: Option<u32>,
}

impl Default for RasterizeOptions {
    fn default() -> Self {
        Self {
            dpi: 150,
            format: RasterFormat::Png,
            first_page: None,
            last_page: None,
        }
    }
}

impl RasterizeOptions {
    fn validate(&self) -> Result<()> {
        if !(36..=1200).contains(&self.dpi) {
            return Err(Error::validation(format!("dpi {} outside 36..=1200", self.dpi)));
        }
        if self.first_page == Some(0) || self.last_page == Some(0) {
            return Err(Error::validation("page numbers start at 1"));
        }
        if let (Some(first), Some(last)) = (self.first_page, self.last_page) {
            if first > last {
                return Err(Error::validation(format!(
                    "first_page {} is after last_page {}",
                    first, last
                )));
            }
        }
        Ok(())
    }
}

/// Target encoding for compression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
    Webp,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
            ImageFormat::Webp => "webp",
        }
    }
}

/// Options for `compress` jobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompressOptions {
    /// Encoder quality (1-100, default 75)
    pub quality: u8,
    /// Re-encode to this format; keeps the input format when unset
    pub format: Option<ImageFormat>,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub strip_metadata: bool,
}

impl Default for CompressOptions {
    fn default() -> Self {
        Self {
            quality: 75,
            format: None,
            max_width: None,
            max_height: None,
            strip_metadata: true,
        }
    }
}

impl CompressOptions {
    fn validate(&self) -> Result<()> {
        if !(1..=100).contains(&self.quality) {
            return Err(Error::validation(format!("quality {} outside 1..=100", self.quality)));
        }
        if self.max_width == Some(0) || self.max_height == Some(0) {
            return Err(Error::validation("max_width/max_height must be at least 1"));
        }
        Ok(())
    }
}

/// Rendering of recognized text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcrOutput {
    Text,
    Hocr,
    Pdf,
}

impl OcrOutput {
    /// tesseract config name and produced file extension
    pub fn tesseract_config(&self) -> (&'static str, &'static str) {
        match self {
            OcrOutput::Text => ("txt", "txt"),
            OcrOutput::Hocr => ("hocr", "hocr"),
            OcrOutput::Pdf => ("pdf", "pdf"),
        }
    }
}

/// Options for `ocr` jobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OcrOptions {
    /// tesseract language codes joined by '+', e.g. "eng+deu"
    pub language: String,
    /// Page segmentation mode (0-13, default 3)
    pub psm: u8,
    pub output: OcrOutput,
}

impl Default for OcrOptions {
    fn default() -> Self {
        Self {
            language: "eng".to_string(),
            psm: 3,
            output: OcrOutput::Text,
        }
    }
}

impl OcrOptions {
    fn validate(&self) -> Result<()> {
        let valid_language = !self.language.is_empty()
            && self.language.split('+').all(|code| {
                code.len() >= 3 && code.chars().all(|c| c.is_ascii_lowercase() || c == '_')
            });
        if !valid_language {
            return Err(Error::validation(format!("invalid OCR language '{}'", self.language)));
        }
        if self.psm > 13 {
            return Err(Error::validation(format!("psm {} outside 0..=13", self.psm)));
        }
        Ok(())
    }
}

/// Output container for transcoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Mp4,
    Webm,
    Mkv,
}

impl Container {
    pub fn extension(&self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Webm => "webm",
            Container::Mkv => "mkv",
        }
    }
}

/// Video codec for transcoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    H265,
    Vp9,
    Av1,
}

impl VideoCodec {
    /// ffmpeg encoder name
    pub fn encoder(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "libx264",
            VideoCodec::H265 => "libx265",
            VideoCodec::Vp9 => "libvpx-vp9",
            VideoCodec::Av1 => "libaom-av1",
        }
    }

    /// Whether the encoder understands x264-style `-preset`
    pub fn supports_preset(&self) -> bool {
        matches!(self, VideoCodec::H264 | VideoCodec::H265)
    }
}

const PRESETS: &[&str] = &[
    "ultrafast", "superfast", "veryfast", "faster", "fast", "medium", "slow", "slower", "veryslow",
];

/// Options for `transcode` jobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TranscodeOptions {
    pub container: Container,
    pub video_codec: VideoCodec,
    /// Constant rate factor (0-63, default 23)
    pub crf: u8,
    pub preset: String,
    /// Downscale to this height, keeping aspect ratio
    pub max_height: Option<u32>,
    /// Keep the audio track
    pub audio: bool,
}

impl Default for TranscodeOptions {
    fn default() -> Self {
        Self {
            container: Container::Mp4,
            video_codec: VideoCodec::H264,
            crf: 23,
            preset: "medium".to_string(),
            max_height: None,
            audio: true,
        }
    }
}

impl TranscodeOptions {
    fn validate(&self) -> Result<()> {
        if self.crf > 63 {
            return Err(Error::validation(format!("crf {} outside 0..=63", self.crf)));
        }
        if matches!(self.video_codec, VideoCodec::H264 | VideoCodec::H265) && self.crf > 51 {
            return Err(Error::validation(format!(
                "crf {} outside 0..=51 for {:?}",
                self.crf, self.video_codec
            )));
        }
        if !PRESETS.contains(&self.preset.as_str()) {
            return Err(Error::validation(format!("unknown preset '{}'", self.preset)));
        }
        if self.max_height.is_some_and(|h| h < 2 || h % 2 != 0) {
            return Err(Error::validation("max_height must be an even number >= 2"));
        }
        if self.container == Container::Webm
            && !matches!(self.video_codec, VideoCodec::Vp9 | VideoCodec::Av1)
        {
            return Err(Error::validation("webm requires vp9 or av1"));
        }
        Ok(())
    }
}

/// Validated options of a job, one variant per job type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "options", rename_all = "lowercase")]
pub enum JobOptions {
    Rasterize(RasterizeOptions),
    Compress(CompressOptions),
    Ocr(OcrOptions),
    Transcode(TranscodeOptions),
}

impl JobOptions {
    /// Parse and validate a submitted options map against the schema of `job_type`.
    ///
    /// `null` selects the defaults; anything other than an object is rejected,
    /// as are unknown keys.
    pub fn parse(job_type: JobType, value: &Value) -> Result<Self> {
        let value = match value {
            Value::Null => Value::Object(Default::default()),
            Value::Object(_) => value.clone(),
            other => {
                return Err(Error::validation(format!(
                    "options for {} must be an object, got {}",
                    job_type, other
                )))
            }
        };

        let invalid = |e: serde_json::Error| {
            Error::validation(format!("invalid {} options: {}", job_type, e))
        };

        let options = match job_type {
            JobType::Rasterize => {
                let o: RasterizeOptions = serde_json::from_value(value).map_err(invalid)?;
                o.validate()?;
                JobOptions::Rasterize(o)
            }
            JobType::Compress => {
                let o: CompressOptions = serde_json::from_value(value).map_err(invalid)?;
                o.validate()?;
                JobOptions::Compress(o)
            }
            JobType::Ocr => {
                let o: OcrOptions = serde_json::from_value(value).map_err(invalid)?;
                o.validate()?;
                JobOptions::Ocr(o)
            }
            JobType::Transcode => {
                let o: TranscodeOptions = serde_json::from_value(value).map_err(invalid)?;
                o.validate()?;
                JobOptions::Transcode(o)
            }
        };

        Ok(options)
    }

    /// Defaults for a job type
    pub fn defaults(job_type: JobType) -> Self {
        match job_type {
            JobType::Rasterize => JobOptions::Rasterize(RasterizeOptions::default()),
            JobType::Compress => JobOptions::Compress(CompressOptions::default()),
            JobType::Ocr => JobOptions::Ocr(OcrOptions::default()),
            JobType::Transcode => JobOptions::Transcode(TranscodeOptions::default()),
        }
    }

    pub fn job_type(&self) -> JobType {
        match self {
            JobOptions::Rasterize(_) => JobType::Rasterize,
            JobOptions::Compress(_) => JobType::Compress,
            JobOptions::Ocr(_) => JobType::Ocr,
            JobOptions::Transcode(_) => JobType::Transcode,
        }
    }
}
