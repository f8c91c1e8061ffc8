//! Submission-side facade over the job store

use std::sync::Arc;
use uuid::Uuid;

use super::dispatcher::Dispatcher;
use crate::config::JobTypesConfig;
use crate::error::{Error, Result};
use crate::storage::JobStore;
use crate::types::{
    CancelAck, Job, JobOptions, JobStatus, JobStatusView, JobType, NewJob, QueueStats,
};

/// Accepts work and answers status queries.
///
/// Submissions are validated, stamped with their type's retry and timeout
/// settings and persisted as pending; an attached [`Dispatcher`] is woken
/// so it can claim them.
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    job_types: JobTypesConfig,
    dispatcher: Option<Dispatcher>,
}

impl JobQueue {
    /// Create a queue over a store
    pub fn new(store: Arc<dyn JobStore>, job_types: JobTypesConfig) -> Self {
        Self {
            store,
            job_types,
            dispatcher: None,
        }
    }

    /// Wake `dispatcher` on submission and route cancellations through it
    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Submit a job. Fails with `Validation` for an unknown type, malformed
    /// options or an empty input reference, and with `ResourceExhausted` when
    /// the store is full.
    pub fn submit(&self, new_job: NewJob) -> Result<Uuid> {
        let job_type: JobType = new_job.job_type.parse()?;

        if new_job.input.as_os_str().is_empty() {
            return Err(Error::validation("input artifact reference is empty"));
        }
        if new_job.input.to_str().is_none() {
            return Err(Error::validation(format!(
                "input artifact reference {} is not valid UTF-8",
                new_job.input.display()
            )));
        }

        let options = JobOptions::parse(job_type, &new_job.options)?;
        let settings = self.job_types.get(job_type);

        let job = Job::pending(
            job_type,
            new_job.input,
            options,
            new_job.priority,
            settings.max_attempts,
            settings.timeout(),
        );

        let job_id = match self.store.insert(&job) {
            Ok(id) => id,
            Err(e @ Error::ResourceExhausted { .. }) => {
                tracing::warn!("Rejected {} submission: {}", job_type, e);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        tracing::info!(
            "Submitted job {} ({}, priority {}, input {})",
            job_id,
            job_type,
            job.priority,
            job.input.display()
        );

        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.notify();
        }

        Ok(job_id)
    }

    /// Read-only status projection
    pub fn status(&self, job_id: Uuid) -> Result<JobStatusView> {
        Ok(self.store.get(job_id)?.status_view())
    }

    /// Cancel a job; repeated calls return the same acknowledgement
    pub fn cancel(&self, job_id: Uuid) -> Result<CancelAck> {
        let ack = match &self.dispatcher {
            Some(dispatcher) => dispatcher.cancel(job_id)?,
            None => self.store.cancel(job_id)?,
        };
        tracing::info!("Cancel request for job {}: now {}", job_id, ack.status);
        Ok(ack)
    }

    /// Full job record
    pub fn get(&self, job_id: Uuid) -> Result<Job> {
        self.store.get(job_id)
    }

    /// Most recent jobs, optionally filtered by status
    pub fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        self.store.list(status, limit)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        self.store.stats()
    }
}
