// src/error.rs
//
// Typed errors at module seams (store, topology, supervisor). Callers above
// these modules wrap them in `anyhow::Result` with `.context(...)`, matching
// the split used throughout this crate: `thiserror` for the handful of
// variants a caller might want to match on, `anyhow` everywhere else.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job {0} not found")]
    JobNotFound(i64),

    #[error("job {0} is not in a cancellable state")]
    NotCancellable(i64),

    #[error("insufficient resources: requested {requested_cpus} cpus / {requested_mem_mb} MB, \
             free {free_cpus} cpus / {free_mem_mb} MB")]
    InsufficientResources {
        requested_cpus: u32,
        requested_mem_mb: u64,
        free_cpus: u32,
        free_mem_mb: u64,
    },

    #[error("topology config error at line {line}: {message}")]
    TopologyParse { line: usize, message: String },

    #[error("no nodes satisfy the request")]
    NoFeasiblePlacement,

    #[error("process spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
}
