// src/job.rs
//
// =============================================================================
// MINI-SLURM: JOB SCHEMA (v 0.1)
// =============================================================================
//
// The single persistent entity in the system. Every other module either
// produces a Job (CLI submit), reads Jobs (placement, CLI queries), or
// mutates one in place as it moves through the state machine below.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Primary key. Assigned monotonically by the store at submission time.
pub type JobId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobStatus::Pending),
            "RUNNING" => Some(JobStatus::Running),
            "COMPLETED" => Some(JobStatus::Completed),
            "FAILED" => Some(JobStatus::Failed),
            "CANCELLED" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

/// The full record. Mirrors the `jobs` table column-for-column: every field
/// here is a store column, not a blob, since placement/admission need to
/// filter and sort on most of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub cpus: u32,
    pub mem_mb: u64,
    pub priority: i64,
    pub status: JobStatus,

    pub submit_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,

    pub return_code: Option<i32>,
    pub user: String,

    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,

    pub cpu_user_time: Option<f64>,
    pub cpu_system_time: Option<f64>,

    pub is_elastic: bool,
    pub min_cpus: Option<u32>,
    pub max_cpus: Option<u32>,
    pub current_cpus: Option<u32>,
    pub control_file: Option<PathBuf>,

    pub nodes: Vec<String>,
}

impl Job {
    /// Seconds between submission and start. `None` until the job starts.
    pub fn wait_time(&self) -> Option<f64> {
        let start = self.start_time?;
        Some((start - self.submit_time).num_milliseconds() as f64 / 1000.0)
    }

    /// Seconds between start and end. `None` until the job finishes.
    pub fn runtime(&self) -> Option<f64> {
        let start = self.start_time?;
        let end = self.end_time?;
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }

    /// CPUs currently reserved for this job: `current_cpus` for elastic jobs,
    /// the flat request otherwise.
    pub fn reserved_cpus(&self) -> u32 {
        if self.is_elastic {
            self.current_cpus.unwrap_or(self.cpus)
        } else {
            self.cpus
        }
    }

    pub fn nodes_csv(&self) -> String {
        self.nodes.join(",")
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub command: String,
    pub cpus: u32,
    pub mem_mb: u64,
    pub priority: i64,
    pub user: String,
    pub is_elastic: bool,
    pub min_cpus: Option<u32>,
    pub max_cpus: Option<u32>,
}

impl NewJob {
    /// Validates the submission fields per spec.md §7 (rejected at the
    /// client, before any store mutation).
    pub fn validate(&self) -> Result<(), String> {
        if self.command.trim().is_empty() {
            return Err("command must not be empty".into());
        }
        if self.cpus < 1 {
            return Err("cpus must be >= 1".into());
        }
        if self.mem_mb < 1 {
            return Err("mem_mb must be >= 1".into());
        }
        if self.is_elastic {
            let min = self
                .min_cpus
                .ok_or_else(|| "elastic job requires --min-cpus".to_string())?;
            let max = self
                .max_cpus
                .ok_or_else(|| "elastic job requires --max-cpus".to_string())?;
            if min < 1 {
                return Err("min_cpus must be >= 1".into());
            }
            if min > max {
                return Err("min_cpus must be <= max_cpus".into());
            }
            if !(min..=max).contains(&self.cpus) {
                return Err("cpus must be within [min_cpus, max_cpus]".into());
            }
        }
        Ok(())
    }
}
