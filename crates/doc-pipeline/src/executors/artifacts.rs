//! Artifact layout: staging and atomic publication of job outputs

use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use uuid::Uuid;

use crate::types::Job;

/// Addresses job artifacts under a configured root.
///
/// ```text
/// <root>/staging/<job_id>-XXXXXX/          in-progress output (removed on drop)
/// <root>/results/<job_id>/<claim_token>/   published output
/// ```
///
/// Staging and results share a filesystem, so publication is a single rename.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging_root(&self) -> PathBuf {
        self.root.join("staging")
    }

    /// Final location of the output of one claim of a job
    pub fn result_dir(&self, job_id: Uuid, claim_token: i64) -> PathBuf {
        self.root
            .join("results")
            .join(job_id.to_string())
            .join(claim_token.to_string())
    }

    /// Create a fresh staging directory for the current claim of `job`
    pub fn stage(&self, job: &Job) -> io::Result<StagingDir> {
        let staging_root = self.staging_root();
        std::fs::create_dir_all(&staging_root)?;

        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-", job.id))
            .tempdir_in(&staging_root)?;

        Ok(StagingDir {
            dir,
            target: self.result_dir(job.id, job.claim_token),
        })
    }
}

/// Private output directory of one execution.
///
/// Dropped without [`StagingDir::publish`], it is deleted with its contents,
/// so partial output never becomes visible.
#[derive(Debug)]
pub struct StagingDir {
    dir: TempDir,
    target: PathBuf,
}

impl StagingDir {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Move the staged output to its result location and return that path
    pub fn publish(self) -> io::Result<PathBuf> {
        if let Some(parent) = self.target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(self.dir.path(), &self.target)?;
        // The TempDir guard now points at a vanished path; its cleanup is a no-op
        drop(self.dir);
        Ok(self.target)
    }
}
