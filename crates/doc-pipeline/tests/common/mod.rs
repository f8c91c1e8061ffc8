//! Shared fixtures for pipeline integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use doc_pipeline::config::{JobTypeConfig, JobTypesConfig, PipelineConfig};
use doc_pipeline::{
    ArtifactLayout, Dispatcher, Executor, ExecutorRegistry, Job, JobError, JobQueue, JobStore,
    JobType, Outcome, SqliteJobStore,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use uuid::Uuid;

/// What a scripted execution does
#[derive(Debug, Clone)]
pub enum Step {
    /// Publish a small output file
    Succeed,
    /// Sleep, then publish
    SucceedAfter(Duration),
    Fail(JobError),
    /// Never finish on its own
    Hang,
}

type Script = dyn Fn(&Job) -> Step + Send + Sync;

/// Executor driven by a closure, recording every call
pub struct ScriptedExecutor {
    job_type: JobType,
    script: Box<Script>,
    calls: Mutex<HashMap<Uuid, Vec<Instant>>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    terminated: AtomicUsize,
}

struct RunningGuard<'a> {
    executor: &'a ScriptedExecutor,
    finished: bool,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.executor.running.fetch_sub(1, Ordering::SeqCst);
        if !self.finished {
            self.executor.terminated.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl ScriptedExecutor {
    pub fn new(job_type: JobType, script: impl Fn(&Job) -> Step + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            job_type,
            script: Box::new(script),
            calls: Mutex::new(HashMap::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            terminated: AtomicUsize::new(0),
        })
    }

    pub fn always(job_type: JobType, step: Step) -> Arc<Self> {
        Self::new(job_type, move |_| step.clone())
    }

    /// Start instants of each execution of `job_id`
    pub fn calls(&self, job_id: Uuid) -> Vec<Instant> {
        self.calls.lock().get(&job_id).cloned().unwrap_or_default()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().map(Vec::len).sum()
    }

    pub fn calls_per_job(&self) -> HashMap<Uuid, usize> {
        self.calls.lock().iter().map(|(id, c)| (*id, c.len())).collect()
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// Executions dropped before completing (timeout or cancellation)
    pub fn terminated(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    fn job_type(&self) -> JobType {
        self.job_type
    }

    async fn execute(&self, job: &Job, artifacts: &ArtifactLayout) -> Outcome {
        self.calls.lock().entry(job.id).or_default().push(Instant::now());
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now_running, Ordering::SeqCst);
        let mut guard = RunningGuard {
            executor: self,
            finished: false,
        };

        let outcome = match (self.script)(job) {
            Step::Succeed => publish(job, artifacts),
            Step::SucceedAfter(delay) => {
                tokio::time::sleep(delay).await;
                publish(job, artifacts)
            }
            Step::Fail(error) => Outcome::failure(error),
            Step::Hang => {
                std::future::pending::<()>().await;
                Outcome::failure(JobError::tool("unreachable"))
            }
        };

        guard.finished = true;
        outcome
    }
}

fn publish(job: &Job, artifacts: &ArtifactLayout) -> Outcome {
    let staged = artifacts.stage(job).and_then(|staging| {
        std::fs::write(staging.path().join("output.txt"), job.id.to_string())?;
        staging.publish()
    });
    match staged {
        Ok(path) => Outcome::success(path),
        Err(e) => Outcome::failure(JobError::transient(e.to_string())),
    }
}

/// Pipeline config tuned for fast tests
pub fn test_config(root: &Path, pool_size: usize, job_type: JobTypeConfig) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.pool_size = Some(pool_size);
    config.max_pending = 10_000;
    config.poll_interval_ms = 10;
    config.reaper_interval_secs = 1;
    config.lease_grace_secs = 1;
    config.cancel_poll_interval_ms = 20;
    config.storage.database_path = root.join("jobs.db");
    config.storage.artifact_root = root.join("artifacts");
    config.job_types = JobTypesConfig::uniform(job_type);
    config
}

pub fn job_type_config(max_attempts: u32, timeout_secs: u64, base_ms: u64, cap_ms: u64) -> JobTypeConfig {
    JobTypeConfig {
        max_attempts,
        timeout_secs,
        backoff_base_ms: base_ms,
        backoff_cap_ms: cap_ms,
    }
}

/// A store, dispatcher and queue wired together
pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<SqliteJobStore>,
    pub dispatcher: Dispatcher,
    pub queue: JobQueue,
    pub config: PipelineConfig,
}

impl Harness {
    pub fn new(pool_size: usize, job_type: JobTypeConfig, executors: Vec<Arc<dyn Executor>>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), pool_size, job_type);
        let store = Arc::new(SqliteJobStore::in_memory(config.max_pending).unwrap());

        let mut registry = ExecutorRegistry::new();
        for executor in executors {
            registry.register(executor);
        }

        let dispatcher = Dispatcher::new(store.clone(), registry, &config);
        let queue = JobQueue::new(store.clone(), config.job_types.clone()).with_dispatcher(dispatcher.clone());

        Self {
            dir,
            store,
            dispatcher,
            queue,
            config,
        }
    }

    /// Start the dispatch loop on the runtime
    pub fn start(&self) -> tokio::task::JoinHandle<doc_pipeline::Result<()>> {
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move { dispatcher.run().await })
    }

    /// Insert a job directly, bypassing per-type settings
    pub fn insert(&self, job: &Job) -> Uuid {
        let id = self.store.insert(job).unwrap();
        self.dispatcher.notify();
        id
    }
}

/// Poll `check` until it holds or `limit` elapses
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
