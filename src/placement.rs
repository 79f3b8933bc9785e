// src/placement.rs
//
// =============================================================================
// MINI-SLURM: PLACEMENT & ADMISSION (v 0.1)
// =============================================================================
//
// Pure decision logic: given the pending queue and the current resource
// model, decide which jobs to admit this tick and in what order. No I/O
// happens here; the scheduler loop applies the decisions.

use crate::job::Job;

/// Orders pending jobs for admission consideration: higher priority first,
/// ties broken by earliest submission, then by id (spec.md §4.4/§8:
/// `(priority DESC, submit_time ASC, id ASC)`) so two jobs submitted within
/// the same millisecond still have a deterministic order. The actual
/// feasibility check and reservation (§4.4 steps 3-4) happen in
/// `Scheduler::admit_pending`, which walks this order against the live
/// `ResourceModel` and keeps each successful allocation for the job's
/// lifetime instead of releasing it back.
pub fn admission_order(mut pending: Vec<Job>) -> Vec<Job> {
    pending.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.submit_time.cmp(&b.submit_time))
            .then(a.id.cmp(&b.id))
    });
    pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use chrono::Utc;
    use std::path::PathBuf;

    fn job(id: i64, priority: i64, cpus: u32, mem_mb: u64, offset_secs: i64) -> Job {
        Job {
            id,
            command: "true".into(),
            cpus,
            mem_mb,
            priority,
            status: JobStatus::Pending,
            submit_time: Utc::now() + chrono::Duration::seconds(offset_secs),
            start_time: None,
            end_time: None,
            return_code: None,
            user: "u".into(),
            stdout_path: PathBuf::from("/tmp/out"),
            stderr_path: PathBuf::from("/tmp/err"),
            cpu_user_time: None,
            cpu_system_time: None,
            is_elastic: false,
            min_cpus: None,
            max_cpus: None,
            current_cpus: None,
            control_file: None,
            nodes: Vec::new(),
        }
    }

    #[test]
    fn higher_priority_goes_first() {
        let jobs = vec![job(1, 1, 1, 1, 0), job(2, 10, 1, 1, 1)];
        let ordered = admission_order(jobs);
        assert_eq!(ordered[0].id, 2);
    }

    #[test]
    fn ties_break_on_submit_time() {
        let jobs = vec![job(1, 5, 1, 1, 5), job(2, 5, 1, 1, 0)];
        let ordered = admission_order(jobs);
        assert_eq!(ordered[0].id, 2);
    }

    #[test]
    fn ties_on_priority_and_submit_time_break_on_id() {
        let jobs = vec![job(2, 5, 1, 1, 0), job(1, 5, 1, 1, 0)];
        let ordered = admission_order(jobs);
        assert_eq!(ordered[0].id, 1);
        assert_eq!(ordered[1].id, 2);
    }

    #[test]
    fn admission_order_lets_a_later_small_job_pass_an_earlier_unfittable_one() {
        // §4.4/§9: the order itself doesn't reserve anything, so a walker
        // using this order (like Scheduler::admit_pending) can skip job 1
        // (needs 4 cpus on a 2-cpu host) and still admit job 2 right after.
        let jobs = vec![job(1, 10, 4, 512, 0), job(2, 1, 1, 512, 1)];
        let ordered = admission_order(jobs);
        assert_eq!(ordered[0].id, 1);
        assert_eq!(ordered[1].id, 2);
    }
}
