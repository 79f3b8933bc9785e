// src/main.rs
//
// =============================================================================
// MINI-SLURM: CLIENT & DAEMON ENTRY POINT (v 0.1)
// =============================================================================
//
// The CLI is the external collaborator spec.md §1 treats as out of scope for
// detailed design, but §6 pins down the exact command surface it must
// expose: `submit`/`queue`/`show`/`cancel`/`stats` talk to the job store
// directly; `scheduler` boots the daemon loop. No styled table crate, no
// interactive prompts — plain columns, matching what's needed to drive and
// observe the core.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mini_slurm::config::parse_mem_mb;
use mini_slurm::job::{Job, JobStatus, NewJob};
use mini_slurm::{Config, JobStore, Scheduler, SchedulerError};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "mini-slurm", version, about = "Single-node batch job scheduler")]
struct Cli {
    /// Path to the job store (default ~/.mini_slurm.db).
    #[arg(long)]
    db: Option<PathBuf>,

    /// Directory for stdout/stderr/control files (default ~/.mini_slurm_logs).
    #[arg(long = "log-dir")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a new job.
    Submit {
        #[arg(long)]
        cpus: u32,
        #[arg(long)]
        mem: String,
        #[arg(long, default_value_t = 0)]
        priority: i64,
        /// Mark the job elastic; requires --min-cpus and --max-cpus.
        #[arg(long)]
        elastic: bool,
        #[arg(long = "min-cpus")]
        min_cpus: Option<u32>,
        #[arg(long = "max-cpus")]
        max_cpus: Option<u32>,
        /// Shell command to run. Everything after the flags is joined as one string.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// List jobs, optionally filtered by status.
    Queue {
        #[arg(long)]
        status: Option<String>,
        /// Emit the job list as JSON instead of a plain column table.
        #[arg(long)]
        json: bool,
    },
    /// Show the full record for one job.
    Show {
        id: i64,
        /// Emit the job record as JSON instead of plain fields.
        #[arg(long)]
        json: bool,
    },
    /// Cancel a job (only effective while it is still PENDING).
    Cancel { id: i64 },
    /// Print aggregate counts and timing stats.
    Stats,
    /// Run the scheduling daemon.
    Scheduler {
        #[arg(long = "total-cpus")]
        total_cpus: Option<u32>,
        #[arg(long = "total-mem")]
        total_mem: Option<String>,
        #[arg(long = "poll-interval")]
        poll_interval_secs: Option<f64>,
        #[arg(long = "elastic-threshold")]
        elastic_threshold: Option<f64>,
        #[arg(long = "disable-elastic")]
        disable_elastic: bool,
        #[arg(long = "topology-config")]
        topology_config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = Config::default();
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    if let Some(log_dir) = cli.log_dir {
        config.log_dir = log_dir;
    }

    match cli.command {
        Commands::Submit {
            cpus,
            mem,
            priority,
            elastic,
            min_cpus,
            max_cpus,
            command,
        } => cmd_submit(&config, cpus, mem, priority, elastic, min_cpus, max_cpus, command),
        Commands::Queue { status, json } => cmd_queue(&config, status, json),
        Commands::Show { id, json } => cmd_show(&config, id, json),
        Commands::Cancel { id } => cmd_cancel(&config, id),
        Commands::Stats => cmd_stats(&config),
        Commands::Scheduler {
            total_cpus,
            total_mem,
            poll_interval_secs,
            elastic_threshold,
            disable_elastic,
            topology_config,
        } => {
            cmd_scheduler(
                config,
                total_cpus,
                total_mem,
                poll_interval_secs,
                elastic_threshold,
                disable_elastic,
                topology_config,
            )
            .await
        }
    }
}

fn open_store(config: &Config) -> Result<JobStore> {
    JobStore::open(&config.db_path).context("opening job store")
}

/// §7: invalid submission fields are rejected here, at the client, before
/// any store mutation.
#[allow(clippy::too_many_arguments)]
fn cmd_submit(
    config: &Config,
    cpus: u32,
    mem: String,
    priority: i64,
    elastic: bool,
    min_cpus: Option<u32>,
    max_cpus: Option<u32>,
    command_words: Vec<String>,
) -> Result<ExitCode> {
    let mem_mb = match parse_mem_mb(&mem) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("error: {e}");
            return Ok(ExitCode::from(1));
        }
    };

    let new_job = NewJob {
        command: command_words.join(" "),
        cpus,
        mem_mb,
        priority,
        user: std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
        is_elastic: elastic,
        min_cpus,
        max_cpus,
    };
    if let Err(e) = new_job.validate() {
        eprintln!("error: {e}");
        return Ok(ExitCode::from(1));
    }

    std::fs::create_dir_all(&config.log_dir).context("creating log directory")?;
    let store = open_store(config)?;

    // stdout/stderr paths embed the job id, which only exists after insert;
    // submit with a placeholder, then finalize the real paths.
    let placeholder = config.log_dir.join(".pending");
    let id = store.submit(&new_job, &placeholder, &placeholder)?;
    let stdout = config.log_dir.join(format!("job_{id}.out"));
    let stderr = config.log_dir.join(format!("job_{id}.err"));
    store.set_log_paths(id, &stdout, &stderr)?;

    println!("submitted job {id}");
    Ok(ExitCode::SUCCESS)
}

fn cmd_queue(config: &Config, status: Option<String>, json: bool) -> Result<ExitCode> {
    let store = open_store(config)?;
    let jobs = match status {
        None => store.list()?,
        Some(s) => match JobStatus::parse(&s.to_ascii_uppercase()) {
            Some(st) => store.list_by_status(st)?,
            None => {
                eprintln!("error: unknown status {s:?}");
                return Ok(ExitCode::from(1));
            }
        },
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&jobs).context("serializing job list")?);
    } else {
        print_queue_table(&jobs);
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_show(config: &Config, id: i64, json: bool) -> Result<ExitCode> {
    let store = open_store(config)?;
    let Some(job) = store.get(id)? else {
        eprintln!("error: {}", SchedulerError::JobNotFound(id));
        return Ok(ExitCode::from(1));
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&job).context("serializing job")?);
    } else {
        print_job_detail(&job);
    }
    Ok(ExitCode::SUCCESS)
}

/// §4.4 state machine: CANCELLED is reachable only from PENDING. §8
/// idempotence: cancelling an already-terminal job is a no-op that still
/// exits 0, with a warning rather than an error.
fn cmd_cancel(config: &Config, id: i64) -> Result<ExitCode> {
    let store = open_store(config)?;
    let Some(job) = store.get(id)? else {
        eprintln!("error: {}", SchedulerError::JobNotFound(id));
        return Ok(ExitCode::from(1));
    };
    if job.status.is_terminal() {
        println!(
            "warning: job {id} is already {} (no-op)",
            job.status.as_str()
        );
        return Ok(ExitCode::SUCCESS);
    }
    if job.status == JobStatus::Running {
        eprintln!("error: {}", SchedulerError::NotCancellable(id));
        return Ok(ExitCode::from(1));
    }
    if !store.cancel(id)? {
        // The store's own `status = PENDING` guard is the actual
        // enforcement point (spec.md §4.1); this only fires on a race
        // between the two reads above and the store layer's check.
        eprintln!("error: {}", SchedulerError::NotCancellable(id));
        return Ok(ExitCode::from(1));
    }
    println!("cancelled job {id}");
    Ok(ExitCode::SUCCESS)
}

fn cmd_stats(config: &Config) -> Result<ExitCode> {
    let store = open_store(config)?;
    let jobs = store.list()?;

    println!("total jobs: {}", jobs.len());
    for status in [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ] {
        let n = jobs.iter().filter(|j| j.status == status).count();
        println!("  {:<10} {}", status.as_str(), n);
    }

    let completed: Vec<&Job> = jobs
        .iter()
        .filter(|j| j.status == JobStatus::Completed)
        .collect();
    if !completed.is_empty() {
        let waits: Vec<f64> = completed.iter().filter_map(|j| j.wait_time()).collect();
        let runtimes: Vec<f64> = completed.iter().filter_map(|j| j.runtime()).collect();
        if !waits.is_empty() {
            println!(
                "avg wait time (completed): {:.2}s",
                waits.iter().sum::<f64>() / waits.len() as f64
            );
        }
        if !runtimes.is_empty() {
            println!(
                "avg runtime (completed):   {:.2}s",
                runtimes.iter().sum::<f64>() / runtimes.len() as f64
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[allow(clippy::too_many_arguments)]
async fn cmd_scheduler(
    mut config: Config,
    total_cpus: Option<u32>,
    total_mem: Option<String>,
    poll_interval_secs: Option<f64>,
    elastic_threshold: Option<f64>,
    disable_elastic: bool,
    topology_config: Option<PathBuf>,
) -> Result<ExitCode> {
    if let Some(c) = total_cpus {
        config.total_cpus = Some(c);
    }
    if let Some(m) = total_mem {
        config.total_mem_mb = Some(parse_mem_mb(&m)?);
    }
    if let Some(p) = poll_interval_secs {
        config.tick_interval_ms = (p * 1000.0).max(1.0) as u64;
    }
    if let Some(t) = elastic_threshold {
        config.elastic_threshold_pct = t;
    }
    if disable_elastic {
        config.elastic_enabled = false;
    }
    if let Some(tc) = topology_config {
        config.topology_file = tc;
    }

    std::fs::create_dir_all(&config.log_dir).context("creating log directory")?;
    let store = open_store(&config)?;
    let scheduler = Scheduler::new(config, store)?;
    scheduler.run().await?;
    Ok(ExitCode::SUCCESS)
}

fn print_queue_table(jobs: &[Job]) {
    println!(
        "{:<6} {:<10} {:>5} {:>8} {:>4} {:<40}",
        "ID", "STATUS", "CPUS", "MEM_MB", "PRI", "COMMAND"
    );
    for j in jobs {
        println!(
            "{:<6} {:<10} {:>5} {:>8} {:>4} {:<40}",
            j.id,
            j.status.as_str(),
            j.reserved_cpus(),
            j.mem_mb,
            j.priority,
            truncate(&j.command, 40),
        );
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}...", &s[..max.saturating_sub(3)])
    }
}

fn print_job_detail(job: &Job) {
    println!("id:              {}", job.id);
    println!("command:         {}", job.command);
    println!("status:          {}", job.status.as_str());
    println!("cpus:            {}", job.cpus);
    println!("mem_mb:          {}", job.mem_mb);
    println!("priority:        {}", job.priority);
    println!("user:            {}", job.user);
    println!("submit_time:     {}", job.submit_time.to_rfc3339());
    if let Some(t) = job.start_time {
        println!("start_time:      {}", t.to_rfc3339());
    }
    if let Some(t) = job.end_time {
        println!("end_time:        {}", t.to_rfc3339());
    }
    if let Some(w) = job.wait_time() {
        println!("wait_time:       {w:.3}s");
    }
    if let Some(r) = job.runtime() {
        println!("runtime:         {r:.3}s");
    }
    if let Some(rc) = job.return_code {
        println!("return_code:     {rc}");
    }
    println!("stdout:          {}", job.stdout_path.display());
    println!("stderr:          {}", job.stderr_path.display());
    if job.is_elastic {
        println!("elastic:         yes");
        println!(
            "cpus (min/cur/max): {}/{}/{}",
            job.min_cpus.unwrap_or(0),
            job.current_cpus.unwrap_or(job.cpus),
            job.max_cpus.unwrap_or(0)
        );
        if let Some(cf) = &job.control_file {
            println!("control_file:    {}", cf.display());
        }
    }
    if !job.nodes.is_empty() {
        println!("nodes:           {}", job.nodes_csv());
    }
}
