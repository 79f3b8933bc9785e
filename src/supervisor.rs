// src/supervisor.rs
//
// =============================================================================
// MINI-SLURM: PROCESS SUPERVISOR (v 0.1)
// =============================================================================
//
// Spawns one job per running slot with `std::process::Command`, synchronous
// rather than `tokio::process`: the scheduler loop is single-threaded and
// cooperative (see scheduler.rs), so there is no async benefit to gain from
// an async child handle, only extra bookkeeping.
//
// Each child is placed in its own process group so the whole tree can be
// signaled at once (elastic scale-up/down, cancellation), pinned to the
// core ids the resource model reserved for it, and capped on address space
// via RLIMIT_AS. CPU time accounting comes from `wait4`, which gives us the
// child's `rusage` in the same reap that collects its exit status.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setpgid, Pid};
use wait4::Wait4;

use crate::job::JobId;

pub struct RunningJob {
    pub job_id: JobId,
    pub child: Child,
    pub pgid: i32,
    pub core_ids: Vec<usize>,
    pub control_file: Option<PathBuf>,
}

pub struct ExitReport {
    pub return_code: Option<i32>,
    pub signal: Option<i32>,
    pub cpu_user_time: f64,
    pub cpu_system_time: f64,
}

/// Elastic-only metadata surfaced to the child process per spec.md §6. Only
/// present when `Job::is_elastic`; non-elastic children receive none of
/// these variables.
pub struct ElasticEnv {
    pub min_cpus: u32,
    pub max_cpus: u32,
    pub control_file: PathBuf,
}

/// Spawns `command` under a shell, placing it in a fresh process group and
/// applying the core pinning / memory cap the resource model handed out.
/// stdout/stderr are redirected to the given paths (truncated on open, one
/// file per job, matching the teacher's one-workspace-per-job convention).
#[allow(clippy::too_many_arguments)]
pub fn spawn(
    job_id: JobId,
    command: &str,
    core_ids: &[usize],
    mem_limit_mb: Option<u64>,
    stdout_path: &Path,
    stderr_path: &Path,
    control_file: Option<PathBuf>,
    elastic: Option<ElasticEnv>,
) -> Result<RunningJob> {
    let stdout = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(stdout_path)
        .with_context(|| format!("opening stdout file {:?}", stdout_path))?;
    let stderr = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(stderr_path)
        .with_context(|| format!("opening stderr file {:?}", stderr_path))?;

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));

    // Expose the pinned core set to jobs that respect common thread-count
    // env vars, matching the pattern used elsewhere in this crate family for
    // handing resource grants down to subprocesses. Every child gets the
    // thread-count trio (spec.md §6); only elastic children additionally get
    // the MINI_SLURM_ELASTIC* block.
    cmd.env("MINI_SLURM_JOB_ID", job_id.to_string());
    cmd.env("MINI_SLURM_CPUS", core_ids.len().to_string());
    let thread_count = core_ids.len().max(1).to_string();
    cmd.env("OMP_NUM_THREADS", &thread_count);
    cmd.env("MKL_NUM_THREADS", &thread_count);
    cmd.env("NUMEXPR_NUM_THREADS", &thread_count);

    if let Some(elastic) = &elastic {
        cmd.env("MINI_SLURM_ELASTIC", "1");
        cmd.env("MINI_SLURM_CURRENT_CPUS", core_ids.len().to_string());
        cmd.env("MINI_SLURM_MIN_CPUS", elastic.min_cpus.to_string());
        cmd.env("MINI_SLURM_MAX_CPUS", elastic.max_cpus.to_string());
        cmd.env(
            "MINI_SLURM_CONTROL_FILE",
            elastic.control_file.to_string_lossy().to_string(),
        );
    }

    let affinity_ids = core_ids.to_vec();
    unsafe {
        cmd.pre_exec(move || {
            // New process group rooted at the child so the whole subtree
            // (shell + whatever it execs) can be signaled together.
            setpgid(Pid::from_raw(0), Pid::from_raw(0))
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;

            if let Some(limit_mb) = mem_limit_mb {
                let bytes = limit_mb.saturating_mul(1024 * 1024);
                setrlimit(Resource::RLIMIT_AS, bytes, bytes)
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            }

            apply_affinity(&affinity_ids);
            Ok(())
        });
    }

    let child = cmd.spawn().context("spawning job process")?;
    let pgid = child.id() as i32;

    Ok(RunningJob {
        job_id,
        child,
        pgid,
        core_ids: core_ids.to_vec(),
        control_file,
    })
}

#[cfg(target_os = "linux")]
fn apply_affinity(core_ids: &[usize]) {
    if core_ids.is_empty() {
        return;
    }
    let mut set = nix::sched::CpuSet::new();
    for &c in core_ids {
        let _ = set.set(c);
    }
    let _ = nix::sched::sched_setaffinity(Pid::from_raw(0), &set);
}

#[cfg(not(target_os = "linux"))]
fn apply_affinity(_core_ids: &[usize]) {
    // sched_setaffinity has no portable equivalent outside Linux; the
    // OMP_NUM_THREADS env var set above is the fallback signal to the child.
}

/// Non-blocking poll: returns `Some(report)` once the child has exited,
/// harvesting exit status and `rusage` together via `wait4` so CPU time
/// accounting never requires a second syscall round trip after reaping.
pub fn try_reap(running: &mut RunningJob) -> Result<Option<ExitReport>> {
    match running.child.try_wait()? {
        Some(_) => {
            let (status, rusage) = running
                .child
                .wait4()
                .context("wait4 after try_wait reported exit")?;
            Ok(Some(ExitReport {
                return_code: status.code(),
                signal: status.signal(),
                cpu_user_time: rusage.utime.as_secs_f64(),
                cpu_system_time: rusage.stime.as_secs_f64(),
            }))
        }
        None => Ok(None),
    }
}

/// Delivers `signal` to the job's whole process group.
pub fn signal_group(pgid: i32, signal: Signal) -> Result<()> {
    killpg(Pid::from_raw(pgid), signal).context("signaling job process group")?;
    Ok(())
}

/// Writes `content` to `path` via write-temp-then-rename so a reader never
/// observes a partially written control file, even if the writer is
/// interrupted mid-write.
pub fn write_control_file(path: &Path, content: &str) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut f = File::create(&tmp_path)
            .with_context(|| format!("creating control file temp {:?}", tmp_path))?;
        f.write_all(content.as_bytes())?;
        f.sync_all().ok();
    }
    fs::rename(&tmp_path, path)
        .with_context(|| format!("publishing control file {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn spawn_and_reap_true_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.log");
        let err = dir.path().join("err.log");
        let mut running = spawn(1, "true", &[], None, &out, &err, None, None).unwrap();

        let mut report = None;
        for _ in 0..50 {
            if let Some(r) = try_reap(&mut running).unwrap() {
                report = Some(r);
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        let report = report.expect("child did not exit in time");
        assert_eq!(report.return_code, Some(0));
        assert!(report.signal.is_none());
    }

    #[test]
    fn spawn_and_reap_false_reports_nonzero() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.log");
        let err = dir.path().join("err.log");
        let mut running = spawn(2, "false", &[], None, &out, &err, None, None).unwrap();

        let mut report = None;
        for _ in 0..50 {
            if let Some(r) = try_reap(&mut running).unwrap() {
                report = Some(r);
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        let report = report.expect("child did not exit in time");
        assert_eq!(report.return_code, Some(1));
    }

    #[test]
    fn control_file_write_is_atomic_and_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.json");
        write_control_file(&path, "{\"cpus\":4}").unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "{\"cpus\":4}");
    }
}
