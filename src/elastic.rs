// src/elastic.rs
//
// =============================================================================
// MINI-SLURM: ELASTIC CONTROLLER (v 0.1)
// =============================================================================
//
// Runs once per tick, between reap and admission (spec.md §4.6/§4.7):
//
//   1. Scale-down ("pressure relief"): if a PENDING job outranks every
//      RUNNING elastic job on priority and still doesn't fit, shrink elastic
//      jobs one CPU at a time (lowest priority, most CPUs held, first) until
//      it fits or nothing more can be shrunk.
//   2. Scale-up: while overall utilization stays below the configured
//      threshold and some elastic job has headroom below its max, grow the
//      highest-priority, most-CPU-starved elastic job one CPU at a time.
//
// Both passes persist the new grant to the job's control file (write-temp +
// rename, spec.md §6) and notify the child's process group with SIGUSR1 —
// best-effort; the control file is the authoritative source the job reads.

use chrono::Utc;
use nix::sys::signal::Signal;

use crate::job::{Job, JobId};
use crate::resources::{Allocation, ResourceModel};
use crate::supervisor::{signal_group, write_control_file};
use std::path::Path;

/// One running elastic job as seen by the controller.
pub struct ElasticSlot<'a> {
    pub job: &'a Job,
    pub pgid: i32,
    pub alloc: &'a mut Allocation,
}

/// Renders the control file exactly per spec.md §6: one `KEY=VALUE` line per
/// field, trailing newline.
fn render_control_file(mem_mb: u64, min_cpus: u32, max_cpus: u32, current_cpus: u32) -> String {
    format!(
        "CPUS={}\nMEM_MB={}\nMIN_CPUS={}\nMAX_CPUS={}\nSTATUS=RUNNING\nSCALE_EVENT={:.6}\n",
        current_cpus,
        mem_mb,
        min_cpus,
        max_cpus,
        Utc::now().timestamp_millis() as f64 / 1000.0,
    )
}

/// Writes the initial control file at admission time (spec.md §4.4 step 3),
/// before the job has been assigned a `control_file` field in the store.
pub fn write_initial_control_file(
    path: &Path,
    mem_mb: u64,
    min_cpus: u32,
    max_cpus: u32,
    current_cpus: u32,
) -> anyhow::Result<()> {
    let text = render_control_file(mem_mb, min_cpus, max_cpus, current_cpus);
    write_control_file(path, &text)
}

fn publish(slot: &ElasticSlot, notify: bool) {
    if let Some(cf) = &slot.job.control_file {
        let text = render_control_file(
            slot.job.mem_mb,
            slot.job.min_cpus.unwrap_or(slot.alloc.core_ids.len() as u32),
            slot.job.max_cpus.unwrap_or(slot.alloc.core_ids.len() as u32),
            slot.alloc.core_ids.len() as u32,
        );
        let _ = write_control_file(cf, &text);
    }
    if notify {
        let _ = signal_group(slot.pgid, Signal::SIGUSR1);
    }
}

/// Orders running elastic jobs for growth: highest priority first, then
/// fewest CPUs currently held (so scale-up spreads rather than piling onto
/// an already-large job).
fn scale_up_order(jobs: &[ElasticSlot]) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..jobs.len()).collect();
    idx.sort_by(|&a, &b| {
        jobs[b]
            .job
            .priority
            .cmp(&jobs[a].job.priority)
            .then(jobs[a].alloc.core_ids.len().cmp(&jobs[b].alloc.core_ids.len()))
    });
    idx
}

/// Opposite ordering for shrink: lowest priority first, then most CPUs held.
fn scale_down_order(jobs: &[ElasticSlot]) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..jobs.len()).collect();
    idx.sort_by(|&a, &b| {
        jobs[a]
            .job
            .priority
            .cmp(&jobs[b].job.priority)
            .then(jobs[b].alloc.core_ids.len().cmp(&jobs[a].alloc.core_ids.len()))
    });
    idx
}

/// §4.6 scale-down pass. Triggered only when some PENDING job outranks every
/// running elastic job on priority and does not currently fit; shrinks
/// elastic jobs one CPU at a time (never below `min_cpus`) until that job
/// fits in the resulting `avail_*` or no further reduction is possible.
/// Returns the ids of jobs whose grant changed.
pub fn pressure_relief(
    resources: &mut ResourceModel,
    mut slots: Vec<ElasticSlot>,
    pending: &[Job],
) -> Vec<JobId> {
    let mut changed = Vec::new();
    if slots.is_empty() || pending.is_empty() {
        return changed;
    }

    let max_elastic_priority = slots.iter().map(|s| s.job.priority).max().unwrap();
    let Some(blocker) = pending
        .iter()
        .filter(|p| p.priority > max_elastic_priority)
        .filter(|p| resources.free_cpus() < p.cpus || resources.free_mem_mb() < p.mem_mb)
        .max_by_key(|p| p.priority)
    else {
        return changed;
    };

    loop {
        let fits = resources.free_cpus() >= blocker.cpus && resources.free_mem_mb() >= blocker.mem_mb;
        if fits {
            break;
        }
        let order = scale_down_order(&slots);
        let mut shrank = false;
        for i in order {
            let slot = &mut slots[i];
            let min = slot.job.min_cpus.unwrap_or(slot.job.cpus);
            let current = slot.alloc.core_ids.len() as u32;
            if current <= min {
                continue;
            }
            if resources.try_resize(slot.alloc, current - 1) {
                changed.push(slot.job.id);
                shrank = true;
                break;
            }
        }
        if !shrank {
            break;
        }
    }

    for slot in &slots {
        publish(slot, changed.contains(&slot.job.id));
    }
    changed
}

/// §4.6 scale-up pass. While overall utilization (max of CPU/mem fraction,
/// as a percent) stays below `threshold_pct` and some elastic job still has
/// headroom below its `max_cpus`, grants the highest-priority,
/// fewest-CPUs-held job one more CPU. Returns the ids of jobs whose grant
/// changed.
pub fn scale_up(
    resources: &mut ResourceModel,
    mut slots: Vec<ElasticSlot>,
    threshold_pct: f64,
) -> Vec<JobId> {
    let mut changed = Vec::new();
    if slots.is_empty() {
        return changed;
    }

    loop {
        let used_cpus = (resources.total_cpus - resources.free_cpus()) as f64;
        let used_mem = (resources.total_mem_mb - resources.free_mem_mb()) as f64;
        let util = (used_cpus / resources.total_cpus.max(1) as f64)
            .max(used_mem / resources.total_mem_mb.max(1) as f64)
            * 100.0;
        if util >= threshold_pct || resources.free_cpus() == 0 {
            break;
        }

        let order = scale_up_order(&slots);
        let mut grew = false;
        for i in order {
            let slot = &mut slots[i];
            let max = slot.job.max_cpus.unwrap_or(slot.job.cpus);
            let current = slot.alloc.core_ids.len() as u32;
            if current >= max {
                continue;
            }
            if resources.try_resize(slot.alloc, current + 1) {
                changed.push(slot.job.id);
                grew = true;
                break;
            }
        }
        if !grew {
            break;
        }
    }

    for slot in &slots {
        publish(slot, changed.contains(&slot.job.id));
    }
    changed
}

/// Removes the control file for a job that just finished; spec.md §6
/// removes the file on termination rather than leaving a stale grant.
pub fn remove_control_file(path: &Path) {
    let _ = std::fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use crate::topology::Topology;
    use chrono::Utc;
    use std::path::PathBuf;

    fn elastic_job(id: i64, priority: i64, min: u32, max: u32, mem_mb: u64) -> Job {
        Job {
            id,
            command: "true".into(),
            cpus: min,
            mem_mb,
            priority,
            status: JobStatus::Running,
            submit_time: Utc::now(),
            start_time: Some(Utc::now()),
            end_time: None,
            return_code: None,
            user: "u".into(),
            stdout_path: PathBuf::from("/tmp/out"),
            stderr_path: PathBuf::from("/tmp/err"),
            cpu_user_time: None,
            cpu_system_time: None,
            is_elastic: true,
            min_cpus: Some(min),
            max_cpus: Some(max),
            current_cpus: Some(min),
            control_file: None,
            nodes: Vec::new(),
        }
    }

    fn pending_job(id: i64, priority: i64, cpus: u32, mem_mb: u64) -> Job {
        let mut j = elastic_job(id, priority, cpus, cpus, mem_mb);
        j.is_elastic = false;
        j.min_cpus = None;
        j.max_cpus = None;
        j.current_cpus = None;
        j.status = JobStatus::Pending;
        j.start_time = None;
        j
    }

    #[test]
    fn scale_up_grows_higher_priority_job_first() {
        let mut resources =
            ResourceModel::new("h".into(), 4, 4096, Topology::synthesize_default(1));
        let low = elastic_job(1, 1, 1, 4, 1);
        let high = elastic_job(2, 10, 1, 4, 1);
        let mut alloc_low = resources.try_allocate(1, 1).unwrap();
        let mut alloc_high = resources.try_allocate(1, 1).unwrap();

        let slots = vec![
            ElasticSlot { job: &low, pgid: 1, alloc: &mut alloc_low },
            ElasticSlot { job: &high, pgid: 2, alloc: &mut alloc_high },
        ];
        let changed = scale_up(&mut resources, slots, 50.0);
        assert!(changed.contains(&2));
    }

    #[test]
    fn scale_up_stops_at_threshold() {
        let mut resources =
            ResourceModel::new("h".into(), 10, 10240, Topology::synthesize_default(1));
        let job = elastic_job(1, 1, 1, 10, 1);
        let mut alloc = resources.try_allocate(1, 1).unwrap();
        let slots = vec![ElasticSlot { job: &job, pgid: 1, alloc: &mut alloc }];
        scale_up(&mut resources, slots, 50.0);
        // utilization crosses 50% once current_cpus reaches 5 of 10.
        assert!(alloc.core_ids.len() <= 5);
    }

    #[test]
    fn scale_up_stops_at_max_cpus() {
        let mut resources =
            ResourceModel::new("h".into(), 8, 8192, Topology::synthesize_default(1));
        let job = elastic_job(1, 1, 2, 3, 1);
        let mut alloc = resources.try_allocate(2, 1).unwrap();
        let slots = vec![ElasticSlot { job: &job, pgid: 1, alloc: &mut alloc }];
        scale_up(&mut resources, slots, 100.0);
        assert_eq!(alloc.core_ids.len(), 3);
    }

    #[test]
    fn pressure_relief_shrinks_lowest_priority_elastic_job_to_fit_blocker() {
        let mut resources =
            ResourceModel::new("h".into(), 4, 4096, Topology::synthesize_default(1));
        let elastic = elastic_job(1, 1, 1, 4, 1);
        let mut alloc = resources.try_allocate(4, 4).unwrap();
        let pending = vec![pending_job(2, 10, 2, 2)];

        let slots = vec![ElasticSlot { job: &elastic, pgid: 1, alloc: &mut alloc }];
        let changed = pressure_relief(&mut resources, slots, &pending);
        assert!(changed.contains(&1));
        assert_eq!(alloc.core_ids.len(), 2);
        assert!(resources.free_cpus() >= 2);
    }

    #[test]
    fn pressure_relief_stops_at_min_cpus_even_if_blocker_still_unfit() {
        let mut resources =
            ResourceModel::new("h".into(), 4, 4096, Topology::synthesize_default(1));
        let elastic = elastic_job(1, 1, 3, 4, 1);
        let mut alloc = resources.try_allocate(4, 4).unwrap();
        let pending = vec![pending_job(2, 10, 4, 4)];

        let slots = vec![ElasticSlot { job: &elastic, pgid: 1, alloc: &mut alloc }];
        let changed = pressure_relief(&mut resources, slots, &pending);
        assert!(changed.contains(&1));
        assert_eq!(alloc.core_ids.len(), 3, "must not shrink below min_cpus");
    }

    #[test]
    fn pressure_relief_ignores_lower_priority_pending_jobs() {
        let mut resources =
            ResourceModel::new("h".into(), 4, 4096, Topology::synthesize_default(1));
        let elastic = elastic_job(1, 5, 1, 4, 1);
        let mut alloc = resources.try_allocate(4, 4).unwrap();
        let pending = vec![pending_job(2, 1, 2, 2)];

        let slots = vec![ElasticSlot { job: &elastic, pgid: 1, alloc: &mut alloc }];
        let changed = pressure_relief(&mut resources, slots, &pending);
        assert!(changed.is_empty());
        assert_eq!(alloc.core_ids.len(), 4);
    }
}
