//! # kr-solve
//!
//! Everything between a materialized [`kr_types::Simulation`] and its results
//! on disk: the artifact store, the solver boundary, a fixed-size worker pool
//! and the job scheduler that hands out batches and reports completions.

mod artifact;
mod executor;
mod pool;
mod scheduler;

pub use artifact::{ArtifactStore, SolverInput};
pub use executor::{
    ExecutionReport, ExternalSolver, FnSolver, SolverCommand, SolverExecutor, SolverRun,
    LAUNCH_FAILURE_CODE, MISSING_INPUT_CODE, PANIC_CODE,
};
pub use pool::{BatchId, CompletionEvent, PoolState, WorkItem, WorkItemId, WorkerPool};
pub use scheduler::{CompletionHandler, JobScheduler, SchedulerConfig, SubmittedBatch};
