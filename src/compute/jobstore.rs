//! Compute job persistence
//!
//! The job store is the single source of truth for job state. Each row keeps
//! the full job as JSON plus the columns the engine filters on. The stop flag
//! lives in its own column and is only ever raised, so a tick writing back a
//! job it loaded earlier cannot clear a stop requested in between.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

use super::models::ComputeJob;
use crate::error::{NodeError, NodeResult};

pub struct JobStore {
    conn: Mutex<Connection>,
}

const SELECT_JOB: &str = "SELECT body, stop_requested FROM jobs";

impl JobStore {
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir).context("creating data directory")?;
        let db_path = data_dir.join("compute.db");
        let conn = Connection::open(&db_path)
            .with_context(|| format!("opening database at {}", db_path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self::with_connection(conn)?;
        info!(path = %db_path.display(), "Compute job store initialized");
        Ok(store)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT PRIMARY KEY,
                cluster_hash TEXT NOT NULL,
                owner TEXT NOT NULL,
                agreement_id TEXT,
                status INTEGER NOT NULL,
                is_running INTEGER NOT NULL,
                stop_requested INTEGER NOT NULL DEFAULT 0,
                date_created INTEGER NOT NULL,
                date_finished INTEGER,
                body TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_running ON jobs(cluster_hash, is_running);",
        )
        .context("creating jobs table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> NodeResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| NodeError::Storage(format!("Lock poisoned: {}", e)))
    }

    /// Insert a new job. Fails if the id is already taken.
    pub fn new_job(&self, job: &ComputeJob) -> NodeResult<()> {
        let body = serde_json::to_string(job)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO jobs (job_id, cluster_hash, owner, agreement_id, status, is_running,
                stop_requested, date_created, date_finished, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                job.job_id,
                job.cluster_hash,
                job.owner,
                job.agreement_id,
                job.status.code(),
                job.is_running,
                job.stop_requested,
                job.date_created,
                job.date_finished,
                body
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation => {
                NodeError::Internal(format!("job id {} already exists", job.job_id))
            }
            other => other.into(),
        })?;
        Ok(())
    }

    /// Write back a job read earlier. The stop flag can be raised here but never cleared.
    pub fn update_job(&self, job: &ComputeJob) -> NodeResult<()> {
        let body = serde_json::to_string(job)?;
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE jobs SET status = ?2, is_running = ?3, date_finished = ?4,
                stop_requested = MAX(stop_requested, ?5), body = ?6
             WHERE job_id = ?1",
            params![
                job.job_id,
                job.status.code(),
                job.is_running,
                job.date_finished,
                job.stop_requested,
                body
            ],
        )?;
        if changed == 0 {
            return Err(NodeError::NotFound(format!("job {}", job.job_id)));
        }
        Ok(())
    }

    /// Flag a job for stopping. Returns false for unknown ids.
    pub fn request_stop(&self, job_id: &str) -> NodeResult<bool> {
        let conn = self.lock()?;
        Ok(conn.execute("UPDATE jobs SET stop_requested = 1 WHERE job_id = ?1", [job_id])? > 0)
    }

    pub fn get_job(&self, job_id: &str) -> NodeResult<Option<ComputeJob>> {
        let conn = self.lock()?;
        let job = conn
            .query_row(&format!("{} WHERE job_id = ?1", SELECT_JOB), [job_id], decode_row)
            .optional()?;
        job.transpose()
    }

    /// Jobs matching every filter given.
    pub fn get_jobs(
        &self,
        job_id: Option<&str>,
        agreement_id: Option<&str>,
        owner: Option<&str>,
    ) -> NodeResult<Vec<ComputeJob>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "{} WHERE (?1 IS NULL OR job_id = ?1)
               AND (?2 IS NULL OR agreement_id = ?2)
               AND (?3 IS NULL OR owner = ?3)
             ORDER BY date_created, job_id",
            SELECT_JOB
        ))?;
        let rows = stmt.query_map(params![job_id, agreement_id, owner], decode_row)?;
        collect_jobs(rows)
    }

    pub fn running_jobs(&self, cluster_hash: &str) -> NodeResult<Vec<ComputeJob>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "{} WHERE cluster_hash = ?1 AND is_running = 1 ORDER BY date_created, job_id",
            SELECT_JOB
        ))?;
        let rows = stmt.query_map([cluster_hash], decode_row)?;
        collect_jobs(rows)
    }

    /// Finished jobs of the cluster whose `date_finished` is before `cutoff`.
    pub fn finished_before(&self, cluster_hash: &str, cutoff: i64) -> NodeResult<Vec<ComputeJob>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "{} WHERE cluster_hash = ?1 AND is_running = 0
               AND date_finished IS NOT NULL AND date_finished < ?2",
            SELECT_JOB
        ))?;
        let rows = stmt.query_map(params![cluster_hash, cutoff], decode_row)?;
        collect_jobs(rows)
    }

    pub fn delete_job(&self, job_id: &str) -> NodeResult<bool> {
        let conn = self.lock()?;
        Ok(conn.execute("DELETE FROM jobs WHERE job_id = ?1", [job_id])? > 0)
    }
}

fn decode_row(row: &Row<'_>) -> rusqlite::Result<NodeResult<ComputeJob>> {
    let body: String = row.get(0)?;
    let stop_requested: bool = row.get(1)?;
    Ok(serde_json::from_str::<ComputeJob>(&body)
        .map(|mut job| {
            job.stop_requested |= stop_requested;
            job
        })
        .map_err(NodeError::from))
}

fn collect_jobs<I>(rows: I) -> NodeResult<Vec<ComputeJob>>
where
    I: Iterator<Item = rusqlite::Result<NodeResult<ComputeJob>>>,
{
    let mut jobs = Vec::new();
    for row in rows {
        jobs.push(row??);
    }
    Ok(jobs)
}
