//! Worker pool: bounded execution slots and timeout-enforced execution

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

use crate::executors::{ArtifactLayout, Executor};
use crate::types::{Job, JobError, Outcome};

/// Fixed-size set of execution slots.
///
/// A [`Slot`] is held for the whole claim → execute → report cycle of one
/// job and released when dropped, whatever path the execution took.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

/// One occupied execution slot
#[derive(Debug)]
pub struct Slot {
    _permit: OwnedSemaphorePermit,
}

impl WorkerPool {
    /// Create a pool with `size` slots (at least one)
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Total number of slots
    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots currently free
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a free slot. Returns `None` once the pool is closed.
    pub async fn acquire(&self) -> Option<Slot> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .ok()
            .map(|permit| Slot { _permit: permit })
    }

    /// Take a free slot without waiting
    pub fn try_acquire(&self) -> Option<Slot> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| Slot { _permit: permit })
    }

    /// Stop handing out slots; pending `acquire` calls return `None`
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Execute `job` with `executor` under a hard wall-clock `timeout`.
    ///
    /// The executor runs on its own task. On timeout or when `cancel` flips
    /// to `true` that task is aborted, which drops the child process handle
    /// and kills the external tool; the task is awaited before returning so
    /// the process is gone once this resolves. A panicking executor becomes a
    /// `tool_execution` failure.
    pub async fn run(
        &self,
        job: Job,
        executor: Arc<dyn Executor>,
        artifacts: ArtifactLayout,
        timeout: Duration,
        mut cancel: watch::Receiver<bool>,
    ) -> Outcome {
        let job_id = job.id;
        let job_type = job.job_type;

        let mut handle = tokio::spawn(async move { executor.execute(&job, &artifacts).await });

        let outcome = tokio::select! {
            joined = &mut handle => {
                return match joined {
                    Ok(outcome) => outcome,
                    Err(e) if e.is_panic() => {
                        tracing::error!("Executor for job {} panicked", job_id);
                        Outcome::failure(JobError::tool(format!("{} executor panicked", job_type)))
                    }
                    Err(e) => Outcome::failure(JobError::tool(format!("executor task failed: {}", e))),
                };
            }
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(
                    "TIMEOUT: job {} ({}) exceeded {:.1}s, terminating",
                    job_id,
                    job_type,
                    timeout.as_secs_f64()
                );
                Outcome::failure(JobError::timeout(format!(
                    "{} execution exceeded its {:.1}s timeout",
                    job_type,
                    timeout.as_secs_f64()
                )))
            }
            _ = cancelled(&mut cancel) => {
                tracing::info!("Job {} cancelled, terminating execution", job_id);
                Outcome::Cancelled
            }
        };

        handle.abort();
        // Wait for the aborted task to drop its state (and kill the child)
        let _ = handle.await;
        outcome
    }
}

/// Resolves once the flag is set; never resolves if the sender goes away
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|flag| *flag).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ErrorKind, JobOptions, JobType};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    enum Behavior {
        Succeed,
        Hang,
        Panic,
    }

    struct ScriptedExecutor {
        behavior: Behavior,
        dropped: Arc<AtomicBool>,
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Executor for ScriptedExecutor {
        fn job_type(&self) -> JobType {
            JobType::Ocr
        }

        async fn execute(&self, _job: &Job, _artifacts: &ArtifactLayout) -> Outcome {
            let _guard = DropFlag(self.dropped.clone());
            match self.behavior {
                Behavior::Succeed => Outcome::success("/results/x"),
                Behavior::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                Behavior::Panic => panic!("boom"),
            }
        }
    }

    fn executor(behavior: Behavior) -> (Arc<dyn Executor>, Arc<AtomicBool>) {
        let dropped = Arc::new(AtomicBool::new(false));
        (
            Arc::new(ScriptedExecutor {
                behavior,
                dropped: dropped.clone(),
            }),
            dropped,
        )
    }

    fn job() -> Job {
        Job::pending(
            JobType::Ocr,
            PathBuf::from("/in/scan.png"),
            JobOptions::defaults(JobType::Ocr),
            0,
            3,
            Duration::from_secs(1),
        )
    }

    fn never_cancelled() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn test_slots_bound_and_release() {
        let pool = WorkerPool::new(2);
        let a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        assert_eq!(pool.available(), 0);
        assert!(pool.try_acquire().is_none());

        drop(a);
        assert_eq!(pool.available(), 1);
        assert!(pool.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let pool = WorkerPool::new(1);
        let _held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.is_none() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.close();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let pool = WorkerPool::new(1);
        let (exec, _) = executor(Behavior::Succeed);
        let outcome = pool
            .run(job(), exec, ArtifactLayout::new("/tmp"), Duration::from_secs(5), never_cancelled())
            .await;
        assert_eq!(outcome, Outcome::success("/results/x"));
    }

    #[tokio::test]
    async fn test_timeout_terminates_execution() {
        let pool = WorkerPool::new(1);
        let (exec, dropped) = executor(Behavior::Hang);
        let started = Instant::now();
        let outcome = pool
            .run(job(), exec, ArtifactLayout::new("/tmp"), Duration::from_millis(100), never_cancelled())
            .await;

        assert!(matches!(outcome, Outcome::Failure(ref e) if e.kind == ErrorKind::Timeout));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(dropped.load(Ordering::SeqCst), "executor future was not dropped");
    }

    #[tokio::test]
    async fn test_cancel_terminates_execution() {
        let pool = WorkerPool::new(1);
        let (exec, dropped) = executor(Behavior::Hang);
        let (tx, rx) = watch::channel(false);

        let run = tokio::spawn({
            let pool = pool.clone();
            async move {
                pool.run(job(), exec, ArtifactLayout::new("/tmp"), Duration::from_secs(60), rx)
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(2), run).await.unwrap().unwrap();
        assert_eq!(outcome, Outcome::Cancelled);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_panic_becomes_tool_failure() {
        let pool = WorkerPool::new(1);
        let (exec, _) = executor(Behavior::Panic);
        let outcome = pool
            .run(job(), exec, ArtifactLayout::new("/tmp"), Duration::from_secs(5), never_cancelled())
            .await;
        match outcome {
            Outcome::Failure(err) => {
                assert_eq!(err.kind, ErrorKind::ToolExecution);
                assert!(!err.is_permanent());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_external_process() {
        use crate::executors::run_tool;
        use std::ffi::OsString;

        struct SleepExecutor {
            pid_file: PathBuf,
        }

        #[async_trait]
        impl Executor for SleepExecutor {
            fn job_type(&self) -> JobType {
                JobType::Transcode
            }

            async fn execute(&self, _job: &Job, _artifacts: &ArtifactLayout) -> Outcome {
                let script = format!("echo $$ > {}; exec sleep 30", self.pid_file.display());
                let args: Vec<OsString> = vec!["-c".into(), script.into()];
                match run_tool(std::path::Path::new("sh"), &args).await {
                    Ok(_) => Outcome::success("/never"),
                    Err(e) => Outcome::failure(e),
                }
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let pool = WorkerPool::new(1);
        let exec: Arc<dyn Executor> = Arc::new(SleepExecutor {
            pid_file: pid_file.clone(),
        });

        let outcome = pool
            .run(job(), exec, ArtifactLayout::new(dir.path()), Duration::from_millis(500), never_cancelled())
            .await;
        assert!(matches!(outcome, Outcome::Failure(ref e) if e.kind == ErrorKind::Timeout));

        let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
        // Killed processes are reaped in the background; a zombie counts as gone
        let stat = PathBuf::from(format!("/proc/{}/stat", pid));
        let mut alive = true;
        for _ in 0..50 {
            let state = std::fs::read_to_string(&stat)
                .ok()
                .and_then(|s| s.rsplit_once(')').map(|(_, rest)| rest.trim_start().to_string()));
            match state {
                Some(rest) if !rest.starts_with('Z') => {}
                _ => {
                    alive = false;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive, "sleep process {} survived the timeout", pid);
    }
}
