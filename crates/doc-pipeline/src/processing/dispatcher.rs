//! Dispatcher: drives the claim → execute → finalize cycle
//!
//! The dispatcher claims work only while it holds a free pool slot, so the
//! number of jobs it keeps in `running` never exceeds the pool size. All state
//! shared with other dispatcher instances lives in the [`JobStore`]; every
//! write after a claim is conditioned on the claim token, so results of
//! executions that lost their claim (timeout reaping, cancellation) are
//! dropped instead of overwriting newer state.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use super::retry::RetryDecision;
use super::worker::{Slot, WorkerPool};
use crate::config::{JobTypesConfig, PipelineConfig};
use crate::error::{Error, Result};
use crate::executors::{ArtifactLayout, ExecutorRegistry};
use crate::storage::JobStore;
use crate::types::{CancelAck, Finalization, Job, JobError, JobStatus, Outcome};

/// Operator-visible state of a dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    /// Created, loop not yet running
    Starting,
    /// Claiming and executing
    Healthy,
    /// Stopped after a store failure
    Unhealthy(String),
}

/// Runs jobs from a [`JobStore`] on a [`WorkerPool`].
///
/// Cheap to clone; clones share the same loop state.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn JobStore>,
    pool: WorkerPool,
    registry: ExecutorRegistry,
    artifacts: ArtifactLayout,
    job_types: JobTypesConfig,
    worker_id: String,
    poll_interval: Duration,
    reaper_interval: Duration,
    lease_grace: Duration,
    cancel_poll_interval: Duration,
    notify: Notify,
    in_flight: DashMap<Uuid, Execution>,
    health: watch::Sender<Health>,
    shutdown: watch::Sender<bool>,
}

/// Cancel handle of a local execution, tied to the claim it runs under
struct Execution {
    claim_token: i64,
    cancel: watch::Sender<bool>,
}

impl Dispatcher {
    /// Create a dispatcher over `store` using the executors in `registry`
    pub fn new(store: Arc<dyn JobStore>, registry: ExecutorRegistry, config: &PipelineConfig) -> Self {
        let worker_id = config
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4()));
        let pool = WorkerPool::new(config.pool_size());

        tracing::info!(
            "Dispatcher {} configured: {} slots, job types {:?}",
            worker_id,
            pool.size(),
            registry.job_types()
        );

        Self {
            inner: Arc::new(Inner {
                store,
                pool,
                registry,
                artifacts: ArtifactLayout::new(&config.storage.artifact_root),
                job_types: config.job_types.clone(),
                worker_id,
                poll_interval: config.poll_interval(),
                reaper_interval: config.reaper_interval(),
                lease_grace: config.lease_grace(),
                cancel_poll_interval: config.cancel_poll_interval(),
                notify: Notify::new(),
                in_flight: DashMap::new(),
                health: watch::channel(Health::Starting).0,
                shutdown: watch::channel(false).0,
            }),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    /// Executions currently owned by this dispatcher
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    pub fn health(&self) -> Health {
        self.inner.health.borrow().clone()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<Health> {
        self.inner.health.subscribe()
    }

    /// Wake the loop after a submission
    pub fn notify(&self) {
        self.inner.notify.notify_one();
    }

    /// Cancel a job. A running execution owned by this dispatcher is
    /// terminated right away; one owned by another instance stops at its
    /// next claim check.
    pub fn cancel(&self, job_id: Uuid) -> Result<CancelAck> {
        let ack = self.inner.store.cancel(job_id)?;
        if ack.status == JobStatus::Cancelled && self.signal_cancel(job_id, None) {
            tracing::info!("Cancellation of job {} signalled to its execution", job_id);
        }
        Ok(ack)
    }

    /// Stop claiming; `run` returns after in-flight executions finish
    pub fn shutdown(&self) {
        tracing::info!("Shutdown requested for dispatcher {}", self.inner.worker_id);
        self.inner.shutdown.send_replace(true);
    }

    /// Run the dispatch loop until shutdown or a store failure.
    ///
    /// A store failure marks the dispatcher [`Health::Unhealthy`], stops the
    /// running executions without touching their store rows (their leases
    /// expire and another instance reclaims them) and is returned.
    pub async fn run(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.reaper_interval.is_zero() || inner.cancel_poll_interval.is_zero() {
            return Err(Error::config("reaper and cancel poll intervals must be non-zero"));
        }

        let mut shutdown = inner.shutdown.subscribe();
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<Error>();
        let mut tasks = JoinSet::new();
        let mut reaper = tokio::time::interval(inner.reaper_interval);
        reaper.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        inner.health.send_replace(Health::Healthy);
        tracing::info!("Dispatcher {} started", inner.worker_id);

        let result = loop {
            if *shutdown.borrow_and_update() {
                break Ok(());
            }

            tokio::select! {
                biased;

                _ = shutdown.changed() => {}
                Some(err) = fatal_rx.recv() => break Err(err),
                _ = reaper.tick() => {
                    if let Err(e) = self.reap_expired() {
                        break Err(e);
                    }
                }
                slot = inner.pool.acquire() => {
                    let Some(slot) = slot else { break Ok(()) };
                    match inner.store.claim_next(&inner.worker_id, inner.lease_grace) {
                        Ok(Some(job)) => {
                            tasks.spawn(self.clone().execute(slot, job, fatal_tx.clone()));
                        }
                        Ok(None) => {
                            drop(slot);
                            tracing::trace!("No claimable job, waiting");
                            tokio::select! {
                                _ = inner.notify.notified() => {}
                                _ = tokio::time::sleep(inner.poll_interval) => {}
                                _ = shutdown.changed() => {}
                            }
                        }
                        Err(e) => break Err(e),
                    }
                }
            }

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!("Execution task failed: {}", e);
                }
            }
        };

        match &result {
            Ok(()) => tracing::info!(
                "Dispatcher {} stopping, waiting for {} in-flight job(s)",
                inner.worker_id,
                tasks.len()
            ),
            Err(e) => {
                tracing::error!("Dispatcher {} halted by store failure: {}", inner.worker_id, e);
                inner.health.send_replace(Health::Unhealthy(e.to_string()));
                for entry in inner.in_flight.iter() {
                    entry.value().cancel.send_replace(true);
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Execution task failed: {}", e);
            }
        }

        result
    }

    /// Own one claimed job until its outcome is recorded; the slot is
    /// released when this returns
    async fn execute(self, slot: Slot, job: Job, fatal: mpsc::UnboundedSender<Error>) {
        let inner = &self.inner;
        let _slot = slot;

        tracing::info!(
            "Claimed job {} ({}) attempt {}/{} as {}",
            job.id,
            job.job_type,
            job.attempts + 1,
            job.max_attempts,
            inner.worker_id
        );

        let outcome = match inner.registry.get(job.job_type) {
            Some(executor) => {
                let cancel_rx = self.track(job.id, job.claim_token);
                let watcher = self.spawn_claim_watcher(job.id, job.claim_token);

                let outcome = inner
                    .pool
                    .run(job.clone(), executor, inner.artifacts.clone(), job.timeout, cancel_rx)
                    .await;

                watcher.abort();
                self.untrack(job.id, job.claim_token);
                outcome
            }
            None => Outcome::failure(
                JobError::validation(format!("no executor registered for {}", job.job_type)).permanent(),
            ),
        };

        match self.settle(&job, outcome) {
            Ok(()) => {}
            Err(e) if e.is_stale_claim() => {
                tracing::debug!("Dropping result of job {}: claim {} is stale", job.id, job.claim_token);
            }
            Err(Error::JobNotFound(id)) => {
                tracing::warn!("Job {} vanished from the store before its result was recorded", id);
            }
            Err(e) => {
                tracing::error!("Failed to record outcome of job {}: {}", job.id, e);
                let _ = fatal.send(e);
            }
        }
    }

    /// Record an outcome against the claim it was produced under
    fn settle(&self, job: &Job, outcome: Outcome) -> Result<()> {
        match outcome {
            Outcome::Success { result } => {
                self.inner
                    .store
                    .finalize(job.id, job.claim_token, Finalization::Succeeded { result: result.clone() })?;
                tracing::info!("Job {} succeeded: {}", job.id, result.display());
                Ok(())
            }
            Outcome::Failure(error) => self.fail(job, error),
            // Stopped on request; the store already reflects why
            Outcome::Cancelled => Ok(()),
        }
    }

    /// Apply the retry policy to a failed attempt of `job`
    fn fail(&self, job: &Job, error: JobError) -> Result<()> {
        let mut policy = self.inner.job_types.get(job.job_type).retry_policy();
        policy.max_attempts = job.max_attempts;
        let attempt = job.attempts + 1;

        match policy.decide(&error, attempt) {
            RetryDecision::Retry { delay } => {
                tracing::warn!(
                    "Job {} attempt {}/{} failed ({}); retrying in {:.1}s",
                    job.id,
                    attempt,
                    job.max_attempts,
                    error,
                    delay.as_secs_f64()
                );
                self.inner
                    .store
                    .requeue_for_retry(job.id, job.claim_token, backoff_deadline(delay))
            }
            RetryDecision::Fail => {
                tracing::error!("Job {} failed after {} attempt(s): {}", job.id, attempt, error);
                self.inner
                    .store
                    .finalize(job.id, job.claim_token, Finalization::Failed { error })
            }
        }
    }

    /// Treat running jobs with expired leases as timed-out attempts
    fn reap_expired(&self) -> Result<()> {
        let expired = self.inner.store.list_expired(Utc::now())?;

        for job in expired {
            if self.is_tracked(job.id, job.claim_token) {
                continue;
            }

            let holder = job.claimed_by.clone().unwrap_or_default();
            tracing::warn!("Reclaiming job {} from {}: lease expired", job.id, holder);

            let error = JobError::timeout(format!("lease held by {} expired", holder));
            match self.fail(&job, error) {
                Ok(()) => {}
                Err(e) if e.is_stale_claim() => {
                    tracing::debug!("Job {} was settled before it could be reclaimed", job.id);
                }
                Err(Error::JobNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Poll the store while a job runs and stop the execution once this
    /// claim is no longer current
    fn spawn_claim_watcher(&self, job_id: Uuid, claim_token: i64) -> JoinHandle<()> {
        let this = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.inner.cancel_poll_interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match this.inner.store.get(job_id) {
                    Ok(job) if job.status == JobStatus::Running && job.claim_token == claim_token => {}
                    Ok(job) => {
                        tracing::info!(
                            "Job {} is now {} (claim {} superseded), stopping execution",
                            job_id,
                            job.status,
                            claim_token
                        );
                        this.signal_cancel(job_id, Some(claim_token));
                        break;
                    }
                    Err(Error::JobNotFound(_)) => {
                        this.signal_cancel(job_id, Some(claim_token));
                        break;
                    }
                    Err(e) => tracing::warn!("Claim check for job {} failed: {}", job_id, e),
                }
            }
        })
    }

    /// Register a local execution of `job_id` under `claim_token`
    fn track(&self, job_id: Uuid, claim_token: i64) -> watch::Receiver<bool> {
        let (cancel, cancel_rx) = watch::channel(false);
        self.inner.in_flight.insert(job_id, Execution { claim_token, cancel });
        cancel_rx
    }

    /// Drop the entry for `job_id` unless a newer claim has replaced it
    fn untrack(&self, job_id: Uuid, claim_token: i64) {
        self.inner
            .in_flight
            .remove_if(&job_id, |_, execution| execution.claim_token == claim_token);
    }

    fn is_tracked(&self, job_id: Uuid, claim_token: i64) -> bool {
        self.inner
            .in_flight
            .get(&job_id)
            .is_some_and(|execution| execution.claim_token == claim_token)
    }

    /// Stop the local execution of `job_id`. With a token, only the
    /// execution running under that claim is stopped.
    fn signal_cancel(&self, job_id: Uuid, claim_token: Option<i64>) -> bool {
        match self.inner.in_flight.get(&job_id) {
            Some(execution) if claim_token.map_or(true, |token| token == execution.claim_token) => {
                execution.cancel.send_replace(true);
                true
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("worker_id", &self.inner.worker_id)
            .field("pool_size", &self.inner.pool.size())
            .field("in_flight", &self.inner.in_flight.len())
            .field("health", &*self.inner.health.borrow())
            .finish()
    }
}

fn backoff_deadline(delay: Duration) -> DateTime<Utc> {
    let millis = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    let now = Utc::now();
    now.checked_add_signed(chrono::Duration::milliseconds(millis))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
