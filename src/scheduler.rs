// src/scheduler.rs
//
// =============================================================================
// MINI-SLURM: SCHEDULER LOOP (v 0.1)
// =============================================================================
//
// The daemon's only control flow: a single-threaded, cooperative tick loop.
// Each tick reaps finished jobs, rebalances elastic grants, admits pending
// work, then sleeps. `tokio::time::sleep` is the loop's only suspension
// point and `tokio::signal::ctrl_c` races against it so a Ctrl-C lands
// within one tick interval instead of waiting out a blocking sleep.
//
// Everything inside a tick is synchronous std:: code: there's no concurrency
// to exploit within a single tick, so reaching for async process handles
// here would only add bookkeeping without shortening any critical path.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::time::Duration;

use crate::config::Config;
use crate::elastic::{self, ElasticSlot};
use crate::job::{JobId, JobStatus};
use crate::placement;
use crate::resources::{Allocation, ResourceModel};
use crate::store::JobStore;
use crate::supervisor::{self, ElasticEnv, RunningJob};
use crate::topology::Topology;

struct Slot {
    running: RunningJob,
    alloc: Allocation,
}

pub struct Scheduler {
    store: JobStore,
    resources: ResourceModel,
    config: Config,
    slots: HashMap<JobId, Slot>,
    tick_count: u64,
}

impl Scheduler {
    pub fn new(config: Config, store: JobStore) -> Result<Self> {
        // spec.md §4.3/§7: a topology file that exists but is malformed
        // refuses startup; one that's simply absent falls back to the
        // synthesized default rather than being treated as an error.
        let default_cpus = config.total_cpus.unwrap_or_else(|| num_cpus::get() as u32);
        let topology = if config.topology_file.exists() {
            let text = std::fs::read_to_string(&config.topology_file).with_context(|| {
                format!("reading topology file {:?}", config.topology_file)
            })?;
            Topology::parse(&text).map_err(anyhow::Error::new)?
        } else {
            Topology::synthesize_default(default_cpus)
        };

        let resources = ResourceModel::detect(topology, config.total_cpus, config.total_mem_mb)?;

        let n = store.reconcile_orphans()?;
        if n > 0 {
            warn!("reconciled {n} orphaned job(s) left RUNNING by a prior daemon instance");
        }

        Ok(Self {
            store,
            resources,
            config,
            slots: HashMap::new(),
            tick_count: 0,
        })
    }

    pub async fn run(mut self) -> Result<()> {
        info!(
            "mini-slurm scheduler starting on {} ({} cpus, {} MB)",
            self.resources.hostname, self.resources.total_cpus, self.resources.total_mem_mb
        );

        loop {
            let sleep = tokio::time::sleep(Duration::from_millis(self.config.tick_interval_ms));
            tokio::select! {
                _ = sleep => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("received ctrl-c, shutting down");
                    break;
                }
            }

            if let Err(e) = self.tick() {
                warn!("tick failed: {e:#}");
            }
        }

        self.shutdown();
        Ok(())
    }

    /// One reap -> elastic -> admit pass. Public so integration tests can
    /// drive the loop deterministically instead of waiting out real sleeps;
    /// `run` is just this in a loop with a poll-interval sleep between calls.
    pub fn tick(&mut self) -> Result<()> {
        self.reap_finished()?;

        if self.config.elastic_enabled {
            self.rebalance_elastic()?;
        }

        self.admit_pending()?;
        self.tick_count += 1;
        Ok(())
    }

    fn reap_finished(&mut self) -> Result<()> {
        let mut finished = Vec::new();
        for (id, slot) in self.slots.iter_mut() {
            if let Some(report) = supervisor::try_reap(&mut slot.running)? {
                finished.push((*id, report));
            }
        }

        for (id, report) in finished {
            if let Some(slot) = self.slots.remove(&id) {
                self.resources.free(&slot.alloc);
                if let Some(cf) = &slot.running.control_file {
                    elastic::remove_control_file(cf);
                }
            }
            let status = match (report.return_code, report.signal) {
                (Some(0), _) => JobStatus::Completed,
                _ => JobStatus::Failed,
            };
            // spec.md §3: return_code is the exit status, or -signal when
            // the child was killed by a signal. `ExitStatus::code()` is
            // `None` on a signalled exit, so `report.return_code` alone
            // would persist NULL instead of the negative signal number.
            let persisted_rc = match report.signal {
                Some(sig) => Some(-sig),
                None => report.return_code,
            };
            self.store.mark_finished(
                id,
                status,
                persisted_rc,
                Some(report.cpu_user_time),
                Some(report.cpu_system_time),
            )?;
            debug!(
                "job {id} finished: status={:?} rc={:?} signal={:?}",
                status, report.return_code, report.signal
            );
        }
        Ok(())
    }

    /// §4.6: scale-down ("pressure relief") runs first, then scale-up. Both
    /// passes only touch elastic jobs this daemon is actually supervising
    /// (i.e. present in `self.slots`).
    fn rebalance_elastic(&mut self) -> Result<()> {
        let running_jobs = self.store.list_by_status(JobStatus::Running)?;
        let job_by_id: HashMap<JobId, _> = running_jobs
            .iter()
            .filter(|j| j.is_elastic)
            .map(|j| (j.id, j.clone()))
            .collect();
        if job_by_id.is_empty() {
            return Ok(());
        }

        let pending = self.store.list_by_status(JobStatus::Pending)?;

        let mut slots = Vec::new();
        for (id, job) in &job_by_id {
            if let Some(slot) = self.slots.get_mut(id) {
                slots.push(ElasticSlot {
                    job,
                    pgid: slot.running.pgid,
                    alloc: &mut slot.alloc,
                });
            }
        }
        let shrunk = elastic::pressure_relief(&mut self.resources, slots, &pending);

        let mut slots = Vec::new();
        for (id, job) in &job_by_id {
            if let Some(slot) = self.slots.get_mut(id) {
                slots.push(ElasticSlot {
                    job,
                    pgid: slot.running.pgid,
                    alloc: &mut slot.alloc,
                });
            }
        }
        let grown = elastic::scale_up(&mut self.resources, slots, self.config.elastic_threshold_pct);

        for id in shrunk.into_iter().chain(grown) {
            if let Some(slot) = self.slots.get(&id) {
                self.store
                    .update_current_cpus(id, slot.alloc.core_ids.len() as u32)?;
            }
        }
        Ok(())
    }

    fn admit_pending(&mut self) -> Result<()> {
        let pending = self.store.list_by_status(JobStatus::Pending)?;
        let ordered = placement::admission_order(pending);

        for job in ordered {
            let alloc = match self.resources.try_allocate(job.cpus, job.mem_mb) {
                Ok(alloc) => alloc,
                // §4.4: infeasible or unplaceable is not an error, the job
                // just stays PENDING and later jobs may still pass it.
                Err(e) => {
                    debug!("job {} not admitted this tick: {e}", job.id);
                    continue;
                }
            };

            let current_cpus = alloc.core_ids.len() as u32;
            let control_file = if job.is_elastic {
                Some(self.config.log_dir.join(format!("job_{}.control", job.id)))
            } else {
                None
            };
            let elastic_env = if job.is_elastic {
                let min_cpus = job.min_cpus.unwrap_or(current_cpus);
                let max_cpus = job.max_cpus.unwrap_or(current_cpus);
                if let Some(cf) = &control_file {
                    if let Err(e) = elastic::write_initial_control_file(
                        cf,
                        job.mem_mb,
                        min_cpus,
                        max_cpus,
                        current_cpus,
                    ) {
                        warn!("failed to write initial control file for job {}: {e:#}", job.id);
                    }
                }
                control_file.clone().map(|cf| ElasticEnv {
                    min_cpus,
                    max_cpus,
                    control_file: cf,
                })
            } else {
                None
            };

            match supervisor::spawn(
                job.id,
                &job.command,
                &alloc.core_ids,
                Some(job.mem_mb),
                &job.stdout_path,
                &job.stderr_path,
                control_file.clone(),
                elastic_env,
            ) {
                Ok(running) => {
                    self.store.mark_running(
                        job.id,
                        Some(alloc.core_ids.len() as u32),
                        control_file.as_deref(),
                        &alloc.nodes,
                    )?;
                    self.slots.insert(job.id, Slot { running, alloc });
                }
                Err(e) => {
                    warn!("failed to spawn job {}: {e:#}", job.id);
                    self.resources.free(&alloc);
                    let _ = std::fs::write(&job.stderr_path, format!("{e:#}\n"));
                    self.store
                        .mark_finished(job.id, JobStatus::Failed, Some(-1), None, None)?;
                }
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        for (id, slot) in self.slots.iter() {
            if let Err(e) = supervisor::signal_group(slot.running.pgid, nix::sys::signal::Signal::SIGTERM) {
                warn!("failed to signal job {id} during shutdown: {e:#}");
            }
        }
    }
}
