// src/store.rs
//
// =============================================================================
// MINI-SLURM: PERSISTENT STORE (v 0.1)
// =============================================================================
//
// A single-file rusqlite database holding every Job row. Unlike a shared-HPC
// checkpoint file, this store lives on local disk next to one daemon, so we
// run WAL instead of DELETE journaling: concurrent readers (the CLI's
// `queue`/`show`/`stats` commands) never block the scheduler's writer, and
// the writer never blocks on a reader holding a long transaction open.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};

use crate::job::{Job, JobId, JobStatus, NewJob};

pub struct JobStore {
    path: PathBuf,
    conn: Connection,
}

impl JobStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).ok();
            }
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("failed to open job store at {:?}", path))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 10_000)?;

        let store = Self { path, conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS jobs (
                id                 INTEGER PRIMARY KEY AUTOINCREMENT,
                command            TEXT NOT NULL,
                cpus               INTEGER NOT NULL,
                mem_mb             INTEGER NOT NULL,
                priority           INTEGER NOT NULL,
                status             TEXT NOT NULL,
                submit_time_ms     INTEGER NOT NULL,
                start_time_ms      INTEGER,
                end_time_ms        INTEGER,
                return_code        INTEGER,
                user               TEXT NOT NULL,
                stdout_path        TEXT NOT NULL,
                stderr_path        TEXT NOT NULL,
                cpu_user_time      REAL,
                cpu_system_time    REAL,
                is_elastic         INTEGER NOT NULL DEFAULT 0,
                min_cpus           INTEGER,
                max_cpus           INTEGER,
                current_cpus       INTEGER,
                control_file       TEXT,
                nodes              TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_priority ON jobs(priority);
            ",
        )?;
        Ok(())
    }

    /// Inserts a new job in PENDING state. Returns its assigned id.
    pub fn submit(&self, new_job: &NewJob, stdout: &Path, stderr: &Path) -> Result<JobId> {
        let now = Utc::now().timestamp_millis();
        self.conn.execute(
            "INSERT INTO jobs (
                command, cpus, mem_mb, priority, status, submit_time_ms,
                user, stdout_path, stderr_path, is_elastic, min_cpus, max_cpus,
                current_cpus, nodes
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                new_job.command,
                new_job.cpus,
                new_job.mem_mb,
                new_job.priority,
                JobStatus::Pending.as_str(),
                now,
                new_job.user,
                stdout.to_string_lossy(),
                stderr.to_string_lossy(),
                new_job.is_elastic as i64,
                new_job.min_cpus,
                new_job.max_cpus,
                new_job.min_cpus,
                "",
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get(&self, id: JobId) -> Result<Option<Job>> {
        self.conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], row_to_job)
            .optional()
            .context("querying job by id")
    }

    pub fn list(&self) -> Result<Vec<Job>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM jobs ORDER BY priority DESC, submit_time_ms ASC, id ASC")?;
        let rows = stmt
            .query_map([], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM jobs WHERE status = ?1 ORDER BY priority DESC, submit_time_ms ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![status.as_str()], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn mark_running(
        &self,
        id: JobId,
        current_cpus: Option<u32>,
        control_file: Option<&Path>,
        nodes: &[String],
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        self.conn.execute(
            "UPDATE jobs SET status = ?1, start_time_ms = ?2, current_cpus = ?3,
             control_file = ?4, nodes = ?5 WHERE id = ?6",
            params![
                JobStatus::Running.as_str(),
                now,
                current_cpus,
                control_file.map(|p| p.to_string_lossy().to_string()),
                nodes.join(","),
                id,
            ],
        )?;
        Ok(())
    }

    pub fn mark_finished(
        &self,
        id: JobId,
        status: JobStatus,
        return_code: Option<i32>,
        cpu_user_time: Option<f64>,
        cpu_system_time: Option<f64>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        self.conn.execute(
            "UPDATE jobs SET status = ?1, end_time_ms = ?2, return_code = ?3,
             cpu_user_time = ?4, cpu_system_time = ?5 WHERE id = ?6",
            params![
                status.as_str(),
                now,
                return_code,
                cpu_user_time,
                cpu_system_time,
                id,
            ],
        )?;
        Ok(())
    }

    /// Log paths embed the job id (`job_<id>.out`/`.err`, spec.md §6), so
    /// they can only be finalized after `submit` hands back the assigned id.
    pub fn set_log_paths(&self, id: JobId, stdout: &Path, stderr: &Path) -> Result<()> {
        self.conn.execute(
            "UPDATE jobs SET stdout_path = ?1, stderr_path = ?2 WHERE id = ?3",
            params![
                stdout.to_string_lossy(),
                stderr.to_string_lossy(),
                id,
            ],
        )?;
        Ok(())
    }

    pub fn update_current_cpus(&self, id: JobId, current_cpus: u32) -> Result<()> {
        self.conn.execute(
            "UPDATE jobs SET current_cpus = ?1 WHERE id = ?2",
            params![current_cpus, id],
        )?;
        Ok(())
    }

    /// Cancels a job only if it is still PENDING (spec.md §4.1: the
    /// conditional update is "only from PENDING"; §8 lists CANCELLED-only-
    /// from-PENDING as an invariant, not just a caller-side check). Returns
    /// true if the cancellation was applied.
    pub fn cancel(&self, id: JobId) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let n = self.conn.execute(
            "UPDATE jobs SET status = ?1, end_time_ms = ?2 WHERE id = ?3 AND status = ?4",
            params![
                JobStatus::Cancelled.as_str(),
                now,
                id,
                JobStatus::Pending.as_str(),
            ],
        )?;
        Ok(n > 0)
    }

    /// Called once at daemon startup. Any job left RUNNING from a previous
    /// process (the daemon crashed or was killed) can no longer be backed by
    /// a live child, since process ownership does not survive across daemon
    /// restarts; it is swept to FAILED so it stops occupying resources.
    /// `return_code` is set to the sentinel -9999 (spec.md §7: "marked
    /// FAILED with a sentinel return code") so it's distinguishable from a
    /// real exit/signal code on inspection.
    pub fn reconcile_orphans(&self) -> Result<usize> {
        const ORPHAN_SENTINEL_RC: i32 = -9999;
        let now = Utc::now().timestamp_millis();
        let n = self.conn.execute(
            "UPDATE jobs SET status = ?1, end_time_ms = ?2, return_code = ?3
             WHERE status = ?4",
            params![
                JobStatus::Failed.as_str(),
                now,
                ORPHAN_SENTINEL_RC,
                JobStatus::Running.as_str(),
            ],
        )?;
        Ok(n)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
    let submit_time_ms: i64 = row.get("submit_time_ms")?;
    let start_time_ms: Option<i64> = row.get("start_time_ms")?;
    let end_time_ms: Option<i64> = row.get("end_time_ms")?;
    let status: String = row.get("status")?;
    let nodes: String = row.get("nodes")?;
    let control_file: Option<String> = row.get("control_file")?;

    Ok(Job {
        id: row.get("id")?,
        command: row.get("command")?,
        cpus: row.get("cpus")?,
        mem_mb: row.get("mem_mb")?,
        priority: row.get("priority")?,
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
        submit_time: ms_to_utc(submit_time_ms),
        start_time: start_time_ms.map(ms_to_utc),
        end_time: end_time_ms.map(ms_to_utc),
        return_code: row.get("return_code")?,
        user: row.get("user")?,
        stdout_path: PathBuf::from(row.get::<_, String>("stdout_path")?),
        stderr_path: PathBuf::from(row.get::<_, String>("stderr_path")?),
        cpu_user_time: row.get("cpu_user_time")?,
        cpu_system_time: row.get("cpu_system_time")?,
        is_elastic: row.get::<_, i64>("is_elastic")? != 0,
        min_cpus: row.get("min_cpus")?,
        max_cpus: row.get("max_cpus")?,
        current_cpus: row.get("current_cpus")?,
        control_file: control_file.map(PathBuf::from),
        nodes: if nodes.is_empty() {
            Vec::new()
        } else {
            nodes.split(',').map(|s| s.to_string()).collect()
        },
    })
}

fn ms_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}
