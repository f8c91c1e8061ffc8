//! Job store contract

use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{CancelAck, Finalization, Job, JobStatus, QueueStats};

/// Durable record of job state; the only shared mutable state of the pipeline.
///
/// Every mutation of a claimed job is conditioned on the claim token handed
/// out by [`JobStore::claim_next`]. A mismatch yields
/// [`crate::Error::StaleClaim`] and leaves the job untouched.
pub trait JobStore: Send + Sync {
    /// Persist a new pending job. Fails with `ResourceExhausted` when the
    /// store already holds its maximum of pending jobs.
    fn insert(&self, job: &Job) -> Result<Uuid>;

    /// Atomically claim the highest-priority eligible pending job for
    /// `worker_id`. Never blocks waiting for work.
    fn claim_next(&self, worker_id: &str, lease_grace: Duration) -> Result<Option<Job>>;

    /// Move a running job to a terminal status
    fn finalize(&self, job_id: Uuid, claim_token: i64, finalization: Finalization) -> Result<()>;

    /// Put a running job back to pending, claimable after `backoff_until`
    fn requeue_for_retry(
        &self,
        job_id: Uuid,
        claim_token: i64,
        backoff_until: DateTime<Utc>,
    ) -> Result<()>;

    /// Fetch a job
    fn get(&self, job_id: Uuid) -> Result<Job>;

    /// Cancel a pending or running job; no-op for terminal jobs
    fn cancel(&self, job_id: Uuid) -> Result<CancelAck>;

    /// Running jobs whose lease expired before `now`
    fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Most recent jobs first, optionally filtered by status
    fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>>;

    /// Counts per status
    fn stats(&self) -> Result<QueueStats>;
}
