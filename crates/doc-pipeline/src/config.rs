//! Configuration for the job pipeline
//!
//! The pipeline only consumes a [`PipelineConfig`] value; where it comes from
//! is up to the embedding application. A TOML reader is provided for the
//! worker binary.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::processing::RetryPolicy;
use crate::types::JobType;

/// Main pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Concurrent execution slots (default: CPU count, max 8)
    pub pool_size: Option<usize>,
    /// Submissions are rejected once this many jobs are pending
    pub max_pending: usize,
    /// Idle dispatcher poll interval when no new-job notification arrives
    pub poll_interval_ms: u64,
    /// How often expired leases are reclaimed
    pub reaper_interval_secs: u64,
    /// Extra time past a job's timeout before its claim counts as abandoned
    pub lease_grace_secs: u64,
    /// How often a running job's store row is checked for external cancellation
    pub cancel_poll_interval_ms: u64,
    /// Worker identity recorded in `claimed_by` (default: generated)
    pub worker_id: Option<String>,
    /// Store and artifact locations
    pub storage: StorageConfig,
    /// External tool binaries
    pub tools: ToolsConfig,
    /// Per-type retry and timeout settings
    pub job_types: JobTypesConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pool_size: None, // Auto-detect from CPU count
            max_pending: 10_000,
            poll_interval_ms: 250,
            reaper_interval_secs: 30,
            lease_grace_secs: 30,
            cancel_poll_interval_ms: 500,
            worker_id: None,
            storage: StorageConfig::default(),
            tools: ToolsConfig::default(),
            job_types: JobTypesConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == Some(0) {
            return Err(Error::config("pool_size must be at least 1"));
        }
        if self.max_pending == 0 {
            return Err(Error::config("max_pending must be at least 1"));
        }
        if self.poll_interval_ms == 0 || self.cancel_poll_interval_ms == 0 {
            return Err(Error::config("poll intervals must be non-zero"));
        }
        if self.reaper_interval_secs == 0 {
            return Err(Error::config("reaper_interval_secs must be non-zero"));
        }
        if self.storage.artifact_root.to_str().is_none() {
            return Err(Error::config(format!(
                "artifact_root {} is not valid UTF-8",
                self.storage.artifact_root.display()
            )));
        }
        for job_type in JobType::ALL {
            self.job_types.get(job_type).validate(job_type)?;
        }
        Ok(())
    }

    /// Effective number of execution slots
    pub fn pool_size(&self) -> usize {
        self.pool_size.unwrap_or_else(|| num_cpus::get().clamp(1, 8))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn lease_grace(&self) -> Duration {
        Duration::from_secs(self.lease_grace_secs)
    }

    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_interval_ms)
    }
}

/// Store and artifact locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding job records
    pub database_path: PathBuf,
    /// Root under which staging and result artifacts are addressed by job id
    pub artifact_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = dirs::data_local_dir()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
            .join("doc-pipeline");

        Self {
            database_path: base.join("jobs.db"),
            artifact_root: base.join("artifacts"),
        }
    }
}

/// External tool binaries, resolved through PATH unless absolute
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// poppler-utils PDF rasterizer
    pub pdftoppm: PathBuf,
    /// ImageMagick 7 entry point
    pub magick: PathBuf,
    pub tesseract: PathBuf,
    pub ffmpeg: PathBuf,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            pdftoppm: PathBuf::from("pdftoppm"),
            magick: PathBuf::from("magick"),
            tesseract: PathBuf::from("tesseract"),
            ffmpeg: PathBuf::from("ffmpeg"),
        }
    }
}

/// Retry and timeout settings for one job type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTypeConfig {
    /// Executions allowed before the job fails permanently
    pub max_attempts: u32,
    /// Hard wall-clock limit per execution
    pub timeout_secs: u64,
    /// First retry delay; doubles per failed attempt
    pub backoff_base_ms: u64,
    /// Upper bound for the retry delay
    pub backoff_cap_ms: u64,
}

impl JobTypeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_cap_ms),
            self.max_attempts,
        )
    }

    fn validate(&self, job_type: JobType) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::config(format!("{}: max_attempts must be at least 1", job_type)));
        }
        if self.timeout_secs == 0 {
            return Err(Error::config(format!("{}: timeout_secs must be non-zero", job_type)));
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(Error::config(format!(
                "{}: backoff_cap_ms ({}) is below backoff_base_ms ({})",
                job_type, self.backoff_cap_ms, self.backoff_base_ms
            )));
        }
        Ok(())
    }
}

/// Per-type settings
///
/// Each `[job_types.<type>]` table may set any subset of fields; the rest
/// keep that type's defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "JobTypesFile")]
pub struct JobTypesConfig {
    pub rasterize: JobTypeConfig,
    pub compress: JobTypeConfig,
    pub ocr: JobTypeConfig,
    pub transcode: JobTypeConfig,
}

/// On-disk form of [`JobTypesConfig`]
#[derive(Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct JobTypesFile {
    rasterize: JobTypeOverrides,
    compress: JobTypeOverrides,
    ocr: JobTypeOverrides,
    transcode: JobTypeOverrides,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct JobTypeOverrides {
    max_attempts: Option<u32>,
    timeout_secs: Option<u64>,
    backoff_base_ms: Option<u64>,
    backoff_cap_ms: Option<u64>,
}

impl JobTypeOverrides {
    fn apply(self, base: JobTypeConfig) -> JobTypeConfig {
        JobTypeConfig {
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
            timeout_secs: self.timeout_secs.unwrap_or(base.timeout_secs),
            backoff_base_ms: self.backoff_base_ms.unwrap_or(base.backoff_base_ms),
            backoff_cap_ms: self.backoff_cap_ms.unwrap_or(base.backoff_cap_ms),
        }
    }
}

impl From<JobTypesFile> for JobTypesConfig {
    fn from(file: JobTypesFile) -> Self {
        Self {
            rasterize: file.rasterize.apply(default_rasterize()),
            compress: file.compress.apply(default_compress()),
            ocr: file.ocr.apply(default_ocr()),
            transcode: file.transcode.apply(default_transcode()),
        }
    }
}

fn default_rasterize() -> JobTypeConfig {
    JobTypeConfig { max_attempts: 3, timeout_secs: 300, backoff_base_ms: 2_000, backoff_cap_ms: 60_000 }
}
fn default_compress() -> JobTypeConfig {
    JobTypeConfig { max_attempts: 3, timeout_secs: 120, backoff_base_ms: 1_000, backoff_cap_ms: 30_000 }
}
fn default_ocr() -> JobTypeConfig {
    JobTypeConfig { max_attempts: 3, timeout_secs: 600, backoff_base_ms: 5_000, backoff_cap_ms: 120_000 }
}
fn default_transcode() -> JobTypeConfig {
    // Long-running; fewer attempts
    JobTypeConfig { max_attempts: 2, timeout_secs: 3_600, backoff_base_ms: 30_000, backoff_cap_ms: 600_000 }
}

impl Default for JobTypesConfig {
    fn default() -> Self {
        Self {
            rasterize: default_rasterize(),
            compress: default_compress(),
            ocr: default_ocr(),
            transcode: default_transcode(),
        }
    }
}

impl JobTypesConfig {
    pub fn get(&self, job_type: JobType) -> &JobTypeConfig {
        match job_type {
            JobType::Rasterize => &self.rasterize,
            JobType::Compress => &self.compress,
            JobType::Ocr => &self.ocr,
            JobType::Transcode => &self.transcode,
        }
    }

    /// Apply the same settings to every type
    pub fn uniform(config: JobTypeConfig) -> Self {
        Self {
            rasterize: config.clone(),
            compress: config.clone(),
            ocr: config.clone(),
            transcode: config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert!(config.pool_size() >= 1 && config.pool_size() <= 8);
        assert_eq!(config.job_types.get(JobType::Transcode).max_attempts, 2);
    }

    #[test]
    fn test_partial_toml() {
        let config = PipelineConfig::from_toml_str(
            r#"
            pool_size = 4
            max_pending = 50

            [storage]
            database_path = "/var/lib/docpipe/jobs.db"

            [job_types.ocr]
            max_attempts = 5
            timeout_secs = 90
            backoff_base_ms = 100
            backoff_cap_ms = 1000
            "#,
        )
        .unwrap();

        assert_eq!(config.pool_size(), 4);
        assert_eq!(config.max_pending, 50);
        assert_eq!(config.storage.database_path, PathBuf::from("/var/lib/docpipe/jobs.db"));
        assert_eq!(config.job_types.ocr.max_attempts, 5);
        assert_eq!(config.job_types.ocr.timeout(), Duration::from_secs(90));
        // Untouched sections keep their defaults
        assert_eq!(config.job_types.rasterize, default_rasterize());
        assert_eq!(config.tools.ffmpeg, PathBuf::from("ffmpeg"));
    }

    #[test]
    fn test_invalid_settings_rejected() {
        assert!(matches!(
            PipelineConfig::from_toml_str("pool_size = 0"),
            Err(Error::Config(_))
        ));

        let bad_backoff = r#"
            [job_types.compress]
            max_attempts = 3
            timeout_secs = 10
            backoff_base_ms = 500
            backoff_cap_ms = 100
        "#;
        assert!(matches!(
            PipelineConfig::from_toml_str(bad_backoff),
            Err(Error::Config(_))
        ));

        assert!(matches!(
            PipelineConfig::from_toml_str("reaper_interval_secs = 0\npool_size = 1"),
            Err(Error::Config(_))
        ));

        assert!(matches!(
            PipelineConfig::from_toml_str("max_pending = \"lots\""),
            Err(Error::Toml(_))
        ));

        assert!(matches!(
            PipelineConfig::from_toml_str("[job_types.ocr]\nretries = 2"),
            Err(Error::Toml(_))
        ));
    }

    #[test]
    fn test_partial_job_type_table_keeps_type_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [job_types.ocr]
            max_attempts = 5

            [job_types.transcode]
            timeout_secs = 7200
            "#,
        )
        .unwrap();

        let ocr = &config.job_types.ocr;
        assert_eq!(ocr.max_attempts, 5);
        assert_eq!(ocr.timeout_secs, default_ocr().timeout_secs);
        assert_eq!(ocr.backoff_base_ms, default_ocr().backoff_base_ms);
        assert_eq!(ocr.backoff_cap_ms, default_ocr().backoff_cap_ms);

        let transcode = &config.job_types.transcode;
        assert_eq!(transcode.timeout(), Duration::from_secs(7200));
        assert_eq!(transcode.max_attempts, default_transcode().max_attempts);
        assert_eq!(config.job_types.compress, default_compress());
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_artifact_root_rejected() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let mut config = PipelineConfig::default();
        config.storage.artifact_root = PathBuf::from(OsStr::from_bytes(b"/srv/art\xFF"));
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
