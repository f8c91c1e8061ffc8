//! SQLite job store
//!
//! Claims and token-conditioned updates are single statements, so they
//! are atomic across connections: several store handles (in one process or
//! many) can share one database file.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::store::JobStore;
use crate::error::{Error, Result};
use crate::types::{
    CancelAck, ErrorKind, Finalization, Job, JobError, JobOptions, JobStatus, JobType, QueueStats,
};

/// Column list shared by every query that materializes a [`Job`]
const JOB_COLUMNS: &str = "id, job_type, status, priority, input_path, options_json, attempts, \
    max_attempts, timeout_ms, claimed_by, claim_token, backoff_until, lease_expires_at, \
    result_path, error_kind, error_message, error_permanent, created_at, updated_at";

/// SQLite-based job store
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
    max_pending: usize,
}

impl SqliteJobStore {
    /// Create or open the database at the given path
    pub fn open<P: AsRef<Path>>(path: P, max_pending: usize) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path.as_ref())
            .map_err(|e| Error::store(format!("Failed to open database: {}", e)))?;

        Self::with_connection(conn, max_pending)
    }

    /// Create an in-memory database (tests and single-process embedding)
    pub fn in_memory(max_pending: usize) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::store(format!("Failed to open in-memory database: {}", e)))?;

        Self::with_connection(conn, max_pending)
    }

    fn with_connection(conn: Connection, max_pending: usize) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| Error::store(format!("Failed to set busy timeout: {}", e)))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            max_pending,
        };

        store.migrate()?;
        Ok(store)
    }

    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
        "#,
        )
        .map_err(|e| Error::store(format!("Failed to set pragmas: {}", e)))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                input_path TEXT NOT NULL,
                options_json TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                timeout_ms INTEGER NOT NULL,
                claimed_by TEXT,
                claim_token INTEGER NOT NULL DEFAULT 0,
                backoff_until INTEGER,
                lease_expires_at INTEGER,
                result_path TEXT,
                error_kind TEXT,
                error_message TEXT,
                error_permanent INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK (attempts <= max_attempts),
                CHECK ((claimed_by IS NOT NULL) = (status = 'running')),
                CHECK ((result_path IS NOT NULL) = (status = 'succeeded')),
                CHECK ((error_kind IS NOT NULL) = (status = 'failed'))
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(status, priority DESC, seq);
            CREATE INDEX IF NOT EXISTS idx_jobs_lease ON jobs(status, lease_expires_at);
        "#,
        )
        .map_err(|e| Error::store(format!("Failed to run migrations: {}", e)))?;

        tracing::debug!("Job store migrations complete");
        Ok(())
    }

    /// Distinguish a stale claim from an unknown job after a conditional
    /// update matched no row
    fn stale_or_missing(conn: &Connection, job_id: Uuid, claim_token: i64) -> Error {
        let exists = conn
            .query_row(
                "SELECT 1 FROM jobs WHERE id = ?1",
                params![job_id.to_string()],
                |_| Ok(()),
            )
            .optional();

        match exists {
            Ok(Some(())) => Error::StaleClaim {
                job_id,
                claim_token,
            },
            Ok(None) => Error::JobNotFound(job_id),
            Err(e) => Error::from(e),
        }
    }

    fn pending_count(conn: &Connection) -> Result<usize> {
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM jobs WHERE status = 'pending'", [], |row| {
                row.get(0)
            })
            .map_err(|e| Error::store(format!("Failed to count pending jobs: {}", e)))?;
        Ok(count as usize)
    }
}

impl JobStore for SqliteJobStore {
    fn insert(&self, job: &Job) -> Result<Uuid> {
        if job.status != JobStatus::Pending {
            return Err(Error::validation(format!(
                "cannot insert job {} with status {}",
                job.id, job.status
            )));
        }

        let input = path_str(&job.input)?;
        let options_json = serde_json::to_string(&job.options)?;
        let now = Utc::now();
        let conn = self.conn.lock();

        let inserted = conn
            .execute(
                r#"
                INSERT INTO jobs (
                    id, job_type, status, priority, input_path, options_json,
                    attempts, max_attempts, timeout_ms, claim_token, created_at, updated_at
                )
                SELECT ?1, ?2, 'pending', ?3, ?4, ?5, 0, ?6, ?7, 0, ?8, ?9
                WHERE (SELECT COUNT(*) FROM jobs WHERE status = 'pending') < ?10
                "#,
                params![
                    job.id.to_string(),
                    job.job_type.as_str(),
                    job.priority,
                    input,
                    options_json,
                    job.max_attempts as i64,
                    job.timeout.as_millis() as i64,
                    job.created_at.to_rfc3339(),
                    now.to_rfc3339(),
                    self.max_pending as i64,
                ],
            )
            .map_err(|e| Error::store(format!("Failed to insert job: {}", e)))?;

        if inserted == 0 {
            return Err(Error::ResourceExhausted {
                pending: Self::pending_count(&conn)?,
                limit: self.max_pending,
            });
        }

        Ok(job.id)
    }

    fn claim_next(&self, worker_id: &str, lease_grace: Duration) -> Result<Option<Job>> {
        let now = Utc::now();
        let sql = format!(
            r#"
            UPDATE jobs SET
                status = 'running',
                claimed_by = ?1,
                claim_token = claim_token + 1,
                backoff_until = NULL,
                lease_expires_at = ?2 + timeout_ms + ?3,
                updated_at = ?4
            WHERE seq = (
                SELECT seq FROM jobs
                WHERE status = 'pending' AND (backoff_until IS NULL OR backoff_until <= ?2)
                ORDER BY priority DESC, seq ASC
                LIMIT 1
            ) AND status = 'pending'
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let conn = self.conn.lock();
        let job = conn
            .query_row(
                &sql,
                params![
                    worker_id,
                    now.timestamp_millis(),
                    lease_grace.as_millis() as i64,
                    now.to_rfc3339(),
                ],
                row_to_job,
            )
            .optional()
            .map_err(|e| Error::store(format!("Failed to claim job: {}", e)))?;

        Ok(job)
    }

    fn finalize(&self, job_id: Uuid, claim_token: i64, finalization: Finalization) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();

        let updated = match &finalization {
            Finalization::Succeeded { result } => {
                let result = path_str(result)?;
                conn.execute(
                    r#"
                    UPDATE jobs SET
                        status = 'succeeded',
                        result_path = ?3,
                        claimed_by = NULL,
                        lease_expires_at = NULL,
                        updated_at = ?4
                    WHERE id = ?1 AND claim_token = ?2 AND status = 'running'
                    "#,
                    params![job_id.to_string(), claim_token, result, now],
                )
            }
            Finalization::Failed { error } => conn.execute(
                r#"
                UPDATE jobs SET
                    status = 'failed',
                    attempts = MIN(attempts + 1, max_attempts),
                    error_kind = ?3,
                    error_message = ?4,
                    error_permanent = ?5,
                    claimed_by = NULL,
                    lease_expires_at = NULL,
                    updated_at = ?6
                WHERE id = ?1 AND claim_token = ?2 AND status = 'running'
                "#,
                params![
                    job_id.to_string(),
                    claim_token,
                    error.kind.as_str(),
                    error.message,
                    error.permanent,
                    now,
                ],
            ),
        }
        .map_err(|e| Error::store(format!("Failed to finalize job {}: {}", job_id, e)))?;

        if updated == 0 {
            return Err(Self::stale_or_missing(&conn, job_id, claim_token));
        }
        Ok(())
    }

    fn requeue_for_retry(
        &self,
        job_id: Uuid,
        claim_token: i64,
        backoff_until: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock();

        let updated = conn
            .execute(
                r#"
                UPDATE jobs SET
                    status = 'pending',
                    attempts = attempts + 1,
                    claimed_by = NULL,
                    lease_expires_at = NULL,
                    backoff_until = ?3,
                    updated_at = ?4
                WHERE id = ?1 AND claim_token = ?2 AND status = 'running'
                "#,
                params![
                    job_id.to_string(),
                    claim_token,
                    ceil_millis(backoff_until),
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| Error::store(format!("Failed to requeue job {}: {}", job_id, e)))?;

        if updated == 0 {
            return Err(Self::stale_or_missing(&conn, job_id, claim_token));
        }
        Ok(())
    }

    fn get(&self, job_id: Uuid) -> Result<Job> {
        let conn = self.conn.lock();

        conn.query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
            params![job_id.to_string()],
            row_to_job,
        )
        .optional()
        .map_err(|e| Error::store(format!("Failed to get job: {}", e)))?
        .ok_or(Error::JobNotFound(job_id))
    }

    fn cancel(&self, job_id: Uuid) -> Result<CancelAck> {
        let conn = self.conn.lock();

        let cancelled = conn
            .query_row(
                r#"
                UPDATE jobs SET
                    status = 'cancelled',
                    claimed_by = NULL,
                    lease_expires_at = NULL,
                    claim_token = claim_token + 1,
                    updated_at = ?2
                WHERE id = ?1 AND status IN ('pending', 'running')
                RETURNING id
                "#,
                params![job_id.to_string(), Utc::now().to_rfc3339()],
                |_| Ok(()),
            )
            .optional()
            .map_err(|e| Error::store(format!("Failed to cancel job {}: {}", job_id, e)))?;

        if cancelled.is_some() {
            return Ok(CancelAck {
                job_id,
                status: JobStatus::Cancelled,
            });
        }

        // Already terminal (or unknown): report what is there
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM jobs WHERE id = ?1",
                params![job_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::store(format!("Failed to get job status: {}", e)))?;

        let status = status.ok_or(Error::JobNotFound(job_id))?;
        let status = JobStatus::parse(&status)
            .ok_or_else(|| Error::store(format!("unknown status '{}' for job {}", status, job_id)))?;

        Ok(CancelAck { job_id, status })
    }

    fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let conn = self.conn.lock();

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM jobs WHERE status = 'running' AND lease_expires_at < ?1 \
                 ORDER BY lease_expires_at ASC",
                JOB_COLUMNS
            ))
            .map_err(|e| Error::store(format!("Failed to prepare query: {}", e)))?;

        let jobs = stmt
            .query_map(params![now.timestamp_millis()], row_to_job)
            .map_err(|e| Error::store(format!("Failed to list expired jobs: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::store(format!("Failed to read expired jobs: {}", e)))?;

        Ok(jobs)
    }

    fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        let conn = self.conn.lock();

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM jobs WHERE (?1 IS NULL OR status = ?1) ORDER BY seq DESC LIMIT ?2",
                JOB_COLUMNS
            ))
            .map_err(|e| Error::store(format!("Failed to prepare query: {}", e)))?;

        let jobs = stmt
            .query_map(
                params![status.map(|s| s.as_str()), limit as i64],
                row_to_job,
            )
            .map_err(|e| Error::store(format!("Failed to list jobs: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::store(format!("Failed to read jobs: {}", e)))?;

        Ok(jobs)
    }

    fn stats(&self) -> Result<QueueStats> {
        let conn = self.conn.lock();

        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")
            .map_err(|e| Error::store(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(|e| Error::store(format!("Failed to get stats: {}", e)))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let (status, count) =
                row.map_err(|e| Error::store(format!("Failed to read stats: {}", e)))?;
            let count = count as usize;
            stats.total_jobs += count;
            match JobStatus::parse(&status) {
                Some(JobStatus::Pending) => stats.pending = count,
                Some(JobStatus::Running) => stats.running = count,
                Some(JobStatus::Succeeded) => stats.succeeded = count,
                Some(JobStatus::Failed) => stats.failed = count,
                Some(JobStatus::Cancelled) => stats.cancelled = count,
                None => tracing::warn!("Ignoring jobs with unknown status '{}'", status),
            }
        }

        Ok(stats)
    }
}

/// Paths are stored as TEXT; one that is not valid UTF-8 cannot round-trip
fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::validation(format!("path {} is not valid UTF-8", path.display())))
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(Error::Store(message)))
}

fn parse_time(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp '{}': {}", s, e)))
}

/// Millisecond timestamp rounded up, so a stored deadline never precedes the requested one
fn ceil_millis(t: DateTime<Utc>) -> i64 {
    let partial = t.timestamp_subsec_nanos() % 1_000_000 != 0;
    t.timestamp_millis() + i64::from(partial)
}

fn millis_to_time(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(DateTime::from_timestamp_millis)
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    let id_str: String = row.get(0)?;
    let job_type_str: String = row.get(1)?;
    let status_str: String = row.get(2)?;
    let priority: i32 = row.get(3)?;
    let input_path: String = row.get(4)?;
    let options_json: String = row.get(5)?;
    let attempts: i64 = row.get(6)?;
    let max_attempts: i64 = row.get(7)?;
    let timeout_ms: i64 = row.get(8)?;
    let claimed_by: Option<String> = row.get(9)?;
    let claim_token: i64 = row.get(10)?;
    let backoff_until: Option<i64> = row.get(11)?;
    let lease_expires_at: Option<i64> = row.get(12)?;
    let result_path: Option<String> = row.get(13)?;
    let error_kind: Option<String> = row.get(14)?;
    let error_message: Option<String> = row.get(15)?;
    let error_permanent: bool = row.get(16)?;
    let created_at_str: String = row.get(17)?;
    let updated_at_str: String = row.get(18)?;

    let id = Uuid::parse_str(&id_str)
        .map_err(|e| conversion_error(0, format!("bad job id '{}': {}", id_str, e)))?;
    let job_type: JobType = job_type_str
        .parse()
        .map_err(|e: Error| conversion_error(1, e.to_string()))?;
    let status = JobStatus::parse(&status_str)
        .ok_or_else(|| conversion_error(2, format!("unknown status '{}'", status_str)))?;
    let options: JobOptions = serde_json::from_str(&options_json)
        .map_err(|e| conversion_error(5, format!("bad options for job {}: {}", id, e)))?;

    let error = match error_kind {
        Some(kind) => Some(JobError {
            kind: ErrorKind::parse(&kind)
                .ok_or_else(|| conversion_error(14, format!("unknown error kind '{}'", kind)))?,
            message: error_message.unwrap_or_default(),
            permanent: error_permanent,
        }),
        None => None,
    };

    Ok(Job {
        id,
        job_type,
        status,
        priority,
        input: PathBuf::from(input_path),
        options,
        attempts: attempts as u32,
        max_attempts: max_attempts as u32,
        timeout: Duration::from_millis(timeout_ms.max(0) as u64),
        created_at: parse_time(17, &created_at_str)?,
        updated_at: parse_time(18, &updated_at_str)?,
        claimed_by,
        claim_token,
        backoff_until: millis_to_time(backoff_until),
        lease_expires_at: millis_to_time(lease_expires_at),
        result: result_path.map(PathBuf::from),
        error,
    })
}
