// tests/end_to_end.rs
//
// Drives `JobStore` and `Scheduler` against a temp directory the way two
// real processes would: one handle submits/cancels/reads like the CLI
// would, a second handle is owned by the `Scheduler` the way the daemon
// owns it. Jobs are real child processes (`true`, `false`, `sleep`), not
// mocks, matching the teacher pack's own preference for exercising real
// subprocess behavior. Scenarios follow spec.md §8 literally.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use mini_slurm::config::Config;
use mini_slurm::job::{JobStatus, NewJob};
use mini_slurm::store::JobStore;
use mini_slurm::{Scheduler, Topology};

struct Harness {
    client: JobStore,
    config: Config,
    // held only to keep the temp directory alive for the harness's lifetime
    _dir: tempfile::TempDir,
}

impl Harness {
    fn new(total_cpus: u32, total_mem_mb: u64) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("jobs.db");
        let log_dir = dir.path().join("logs");
        std::fs::create_dir_all(&log_dir).unwrap();

        let mut config = Config::default();
        config.db_path = db_path.clone();
        config.log_dir = log_dir;
        config.topology_file = dir.path().join("topology.conf"); // absent -> synthesized default
        config.total_cpus = Some(total_cpus);
        config.total_mem_mb = Some(total_mem_mb);
        config.elastic_enabled = true;
        config.elastic_threshold_pct = 50.0;

        let client = JobStore::open(&config.db_path).unwrap();
        Harness { client, config, _dir: dir }
    }

    fn scheduler(&self) -> Scheduler {
        let store = JobStore::open(&self.config.db_path).unwrap();
        Scheduler::new(self.config.clone(), store).unwrap()
    }

    fn submit(&self, command: &str, cpus: u32, mem_mb: u64, priority: i64) -> i64 {
        self.submit_elastic(command, cpus, mem_mb, priority, None, None)
    }

    fn submit_elastic(
        &self,
        command: &str,
        cpus: u32,
        mem_mb: u64,
        priority: i64,
        min_cpus: Option<u32>,
        max_cpus: Option<u32>,
    ) -> i64 {
        let new_job = NewJob {
            command: command.to_string(),
            cpus,
            mem_mb,
            priority,
            user: "tester".to_string(),
            is_elastic: min_cpus.is_some(),
            min_cpus,
            max_cpus,
        };
        new_job.validate().unwrap();
        let placeholder = PathBuf::from("/dev/null");
        let id = self
            .client
            .submit(&new_job, &placeholder, &placeholder)
            .unwrap();
        let stdout = self.config.log_dir.join(format!("job_{id}.out"));
        let stderr = self.config.log_dir.join(format!("job_{id}.err"));
        self.client.set_log_paths(id, &stdout, &stderr).unwrap();
        id
    }

    /// Ticks the given scheduler until `pred` holds on the freshly re-read
    /// job, or `timeout` elapses.
    fn wait_for(&self, sched: &mut Scheduler, id: i64, timeout: Duration, pred: impl Fn(JobStatus) -> bool) -> JobStatus {
        let deadline = Instant::now() + timeout;
        loop {
            sched.tick().unwrap();
            let job = self.client.get(id).unwrap().unwrap();
            if pred(job.status) || Instant::now() >= deadline {
                return job.status;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

#[test]
fn simple_admission_runs_and_completes() {
    let h = Harness::new(4, 8192);
    let id = h.submit("true", 2, 1024, 0);
    let mut sched = h.scheduler();

    let status = h.wait_for(&mut sched, id, Duration::from_secs(3), |s| {
        s == JobStatus::Completed || s == JobStatus::Failed
    });
    assert_eq!(status, JobStatus::Completed);
    let job = h.client.get(id).unwrap().unwrap();
    assert_eq!(job.return_code, Some(0));
    assert!(job.start_time.is_some());
    assert!(job.end_time.is_some());
}

#[test]
fn priority_ordering_admits_highest_priority_first() {
    let h = Harness::new(4, 8192);
    let a = h.submit("true", 4, 1024, 0);
    let b = h.submit("true", 4, 1024, 10);
    let c = h.submit("true", 4, 1024, 5);
    let mut sched = h.scheduler();

    // Only one 4-cpu job can run at a time on a 4-cpu host. The first one
    // admitted must be B (highest priority); A and C stay PENDING until B
    // finishes and frees the machine.
    sched.tick().unwrap();
    let (sa, sb, sc) = (
        h.client.get(a).unwrap().unwrap().status,
        h.client.get(b).unwrap().unwrap().status,
        h.client.get(c).unwrap().unwrap().status,
    );
    assert_eq!(sb, JobStatus::Running, "highest-priority job must admit first");
    assert_eq!(sa, JobStatus::Pending);
    assert_eq!(sc, JobStatus::Pending);

    // Drain: B completes, then C (priority 5) admits before A (priority 0).
    h.wait_for(&mut sched, b, Duration::from_secs(3), |s| s == JobStatus::Completed);
    sched.tick().unwrap();
    assert_eq!(h.client.get(c).unwrap().unwrap().status, JobStatus::Running);
    assert_eq!(h.client.get(a).unwrap().unwrap().status, JobStatus::Pending);

    h.wait_for(&mut sched, c, Duration::from_secs(3), |s| s == JobStatus::Completed);
    sched.tick().unwrap();
    assert_eq!(h.client.get(a).unwrap().unwrap().status, JobStatus::Running);
}

#[test]
fn infeasible_job_stays_pending_and_is_cancellable() {
    let h = Harness::new(4, 8192);
    let id = h.submit("true", 100, 100 * 1024, 0);
    let mut sched = h.scheduler();

    for _ in 0..5 {
        sched.tick().unwrap();
    }
    assert_eq!(h.client.get(id).unwrap().unwrap().status, JobStatus::Pending);

    assert!(h.client.cancel(id).unwrap());
    assert_eq!(h.client.get(id).unwrap().unwrap().status, JobStatus::Cancelled);

    // cancelling an already-cancelled job is a no-op, not an error.
    assert!(!h.client.cancel(id).unwrap());
}

#[test]
fn elastic_job_scales_up_toward_max_when_idle() {
    // max_cpus (4) is reached well before the 50% utilization threshold
    // would bind on its own (50% of 8 cpus is 4, but mem share is kept
    // negligible here), so the binding constraint under test is §8's
    // "scale-up stops exactly at max_cpus", not the threshold.
    let h = Harness::new(8, 8192);
    let id = h.submit_elastic("sleep 2", 2, 512, 0, Some(2), Some(4));
    let mut sched = h.scheduler();

    sched.tick().unwrap(); // admits at current_cpus = requested cpus = 2
    let job = h.client.get(id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.current_cpus, Some(2));

    let mut last_cpus = 2;
    for _ in 0..10 {
        sched.tick().unwrap();
        last_cpus = h.client.get(id).unwrap().unwrap().current_cpus.unwrap();
        if last_cpus >= 4 {
            break;
        }
    }
    assert_eq!(last_cpus, 4, "scale-up must stop exactly at max_cpus");

    let control_file = h.client.get(id).unwrap().unwrap().control_file.unwrap();
    let text = std::fs::read_to_string(&control_file).unwrap();
    assert!(text.contains("CPUS=4"));
}

#[test]
fn elastic_job_scales_down_under_priority_pressure() {
    let h = Harness::new(8, 8192);
    // requested at 6 cpus directly (admission grants the request, not
    // min_cpus), leaving only 2 free on an 8-cpu host.
    let elastic_id = h.submit_elastic("sleep 3", 6, 512, 0, Some(2), Some(8));
    let mut sched = h.scheduler();

    sched.tick().unwrap();
    assert_eq!(h.client.get(elastic_id).unwrap().unwrap().current_cpus, Some(6));

    // a higher-priority job needing 4 cpus now arrives; only 2 are free, so
    // pressure relief must shrink the elastic job enough to let it in (down
    // to 4, not all the way to its minimum of 2, since 4 is sufficient).
    let urgent_id = h.submit("sleep 1", 4, 512, 10);
    sched.tick().unwrap();
    let elastic_cpus = h.client.get(elastic_id).unwrap().unwrap().current_cpus.unwrap();
    assert_eq!(elastic_cpus, 4, "elastic job must shrink to exactly the room the urgent job needs");
    assert_eq!(h.client.get(urgent_id).unwrap().unwrap().status, JobStatus::Running);

    h.wait_for(&mut sched, urgent_id, Duration::from_secs(3), |s| s == JobStatus::Completed);
}

#[test]
fn topology_placement_packs_a_single_leaf_switch() {
    let h = Harness::new(8, 8192);
    std::fs::write(
        &h.config.topology_file,
        "SwitchName=switch1 Nodes=node[1-4]\n\
         SwitchName=switch2 Nodes=node[5-8]\n\
         SwitchName=core Switches=switch1,switch2\n",
    )
    .unwrap();

    let id = h.submit("true", 4, 1024, 0);
    let mut sched = h.scheduler();
    sched.tick().unwrap();

    let job = h.client.get(id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.nodes, vec!["node1", "node2", "node3", "node4"]);
}

#[test]
fn topology_config_round_trips() {
    let text = "SwitchName=switch1 Nodes=node[1-4]\n\
                SwitchName=switch2 Nodes=node[5-8]\n\
                SwitchName=core Switches=switch1,switch2\n";
    let topo = Topology::parse(text).unwrap();
    let reemitted = topo.to_config_text();
    let reparsed = Topology::parse(&reemitted).unwrap();
    assert_eq!(topo.nodes().len(), reparsed.nodes().len());
    assert_eq!(topo.distance("node1", "node2"), reparsed.distance("node1", "node2"));
}
