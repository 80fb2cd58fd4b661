//! Fixed-size worker pool.
//!
//! Workers pull [`WorkItem`]s off a shared queue, run the solver on them,
//! store the [`ExecutionReport`] in a concurrent result store keyed by work
//! item and announce it with a [`CompletionEvent`]. The pool moves through
//! `Created -> Started -> ShutDown` exactly once.

use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use kr_types::{ArtifactRef, ExecutionError, KrResult};

use crate::executor::{ExecutionReport, SolverExecutor, SolverRun, PANIC_CODE};

/// Identifier of one submitted variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkItemId(pub u64);

/// Identifier of one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchId(pub u64);

#[derive(Debug, Clone)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub batch: BatchId,
    pub artifact: ArtifactRef,
}

/// Sent by a worker after the report for `work_id` is in the result store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEvent {
    pub batch: BatchId,
    pub work_id: WorkItemId,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Created,
    Started,
    ShutDown,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Started => f.write_str("started"),
            Self::ShutDown => f.write_str("shut down"),
        }
    }
}

pub struct WorkerPool {
    max_workers: usize,
    executor: Arc<dyn SolverExecutor>,
    state: Mutex<PoolState>,
    job_tx: Mutex<Option<Sender<WorkItem>>>,
    job_rx: Receiver<WorkItem>,
    results: Arc<DashMap<WorkItemId, ExecutionReport>>,
    in_progress: Arc<DashMap<WorkItemId, String>>,
    event_tx: Sender<CompletionEvent>,
    event_rx: Receiver<CompletionEvent>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(max_workers: usize, executor: Arc<dyn SolverExecutor>) -> Self {
        let (job_tx, job_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        Self {
            max_workers: max_workers.max(1),
            executor,
            state: Mutex::new(PoolState::Created),
            job_tx: Mutex::new(Some(job_tx)),
            job_rx,
            results: Arc::new(DashMap::new()),
            in_progress: Arc::new(DashMap::new()),
            event_tx,
            event_rx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// `available_parallelism - 1`, at least 1.
    pub fn default_worker_count() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1))
            .unwrap_or(1)
            .max(1)
    }

    pub fn state(&self) -> PoolState {
        *self.state.lock()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Spawn the workers. Starting an already started pool is a no-op.
    pub fn start(&self) -> KrResult<()> {
        let mut state = self.state.lock();
        match *state {
            PoolState::Started => return Ok(()),
            PoolState::ShutDown => {
                return Err(ExecutionError::PoolState {
                    state: state.to_string(),
                    action: "start".to_string(),
                }
                .into())
            }
            PoolState::Created => {}
        }

        let mut handles = self.handles.lock();
        for i in 0..self.max_workers {
            let name = format!("kr-worker-{i}");
            let rx = self.job_rx.clone();
            let executor = Arc::clone(&self.executor);
            let results = Arc::clone(&self.results);
            let in_progress = Arc::clone(&self.in_progress);
            let events = self.event_tx.clone();
            let worker_name = name.clone();
            let handle = std::thread::Builder::new().name(name).spawn(move || {
                while let Ok(item) = rx.recv() {
                    in_progress.insert(item.id, worker_name.clone());
                    let report = run_item(executor.as_ref(), &item, &worker_name);
                    let event = CompletionEvent {
                        batch: item.batch,
                        work_id: item.id,
                        success: report.is_success(),
                    };
                    results.insert(item.id, report);
                    in_progress.remove(&item.id);
                    // The receiver lives as long as the pool.
                    let _ = events.send(event);
                }
                debug!("{} exiting", worker_name);
            })?;
            handles.push(handle);
        }

        *state = PoolState::Started;
        info!(
            "Started worker pool with {} worker(s) using the {} solver",
            self.max_workers,
            self.executor.name()
        );
        Ok(())
    }

    pub fn dispatch(&self, item: WorkItem) -> KrResult<()> {
        let state = self.state();
        if state != PoolState::Started {
            return Err(ExecutionError::PoolState {
                state: state.to_string(),
                action: "dispatch work".to_string(),
            }
            .into());
        }
        let tx = self.job_tx.lock();
        let sender = tx.as_ref().ok_or_else(|| ExecutionError::PoolState {
            state: PoolState::ShutDown.to_string(),
            action: "dispatch work".to_string(),
        })?;
        sender
            .send(item)
            .map_err(|e| kr_types::internal_error!("Work queue closed: {}", e))
    }

    /// Close the queue and join the workers once they drain it. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if *state == PoolState::ShutDown {
                return;
            }
            *state = PoolState::ShutDown;
        }
        self.job_tx.lock().take();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("A worker thread panicked");
            }
        }
        info!("Worker pool shut down");
    }

    pub fn take_result(&self, id: WorkItemId) -> Option<ExecutionReport> {
        self.results.remove(&id).map(|(_, report)| report)
    }

    pub fn is_running(&self, id: WorkItemId) -> bool {
        self.in_progress.contains_key(&id)
    }

    pub fn completion_events(&self) -> Receiver<CompletionEvent> {
        self.event_rx.clone()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_item(executor: &dyn SolverExecutor, item: &WorkItem, worker: &str) -> ExecutionReport {
    let started = Instant::now();
    let run = catch_unwind(AssertUnwindSafe(|| executor.execute(&item.artifact)))
        .unwrap_or_else(|payload| {
            SolverRun::exception(
                PANIC_CODE,
                format!("{} solver panicked: {}", executor.name(), panic_message(payload)),
            )
        });
    let report = ExecutionReport {
        work_id: item.id,
        output_file: item.artifact.output.clone(),
        solver_output: run.solver_output,
        return_code: run.return_code,
        solver_errors: run.solver_errors,
        exception: run.exception,
        run_time: started.elapsed(),
        finished_at: chrono::Utc::now(),
        worker: worker.to_string(),
    };

    if let Some(exc) = &report.exception {
        error!("Work item {:?} raised: {}", item.id, exc);
    } else if !report.is_success() {
        warn!(
            "Solver failed on {} (return code {}, {} error term(s))",
            item.artifact.input.display(),
            report.return_code,
            report.solver_errors
        );
    } else {
        debug!("Work item {:?} finished in {:?}", item.id, report.run_time);
    }
    report
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    struct CountingSolver {
        calls: AtomicUsize,
    }

    impl SolverExecutor for CountingSolver {
        fn execute(&self, _artifact: &ArtifactRef) -> SolverRun {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            SolverRun {
                return_code: if n % 2 == 0 { 0 } else { 3 },
                solver_output: String::new(),
                solver_errors: 0,
                exception: None,
            }
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    fn item(id: u64) -> WorkItem {
        WorkItem {
            id: WorkItemId(id),
            batch: BatchId(1),
            artifact: ArtifactRef::in_dir(std::path::Path::new("/tmp"), Uuid::new_v4()),
        }
    }

    #[test]
    fn lifecycle_moves_forward_only() {
        let pool = WorkerPool::new(2, Arc::new(CountingSolver { calls: AtomicUsize::new(0) }));
        assert_eq!(pool.state(), PoolState::Created);
        assert!(pool.dispatch(item(0)).is_err());

        pool.start().unwrap();
        pool.start().unwrap();
        assert_eq!(pool.state(), PoolState::Started);

        pool.shutdown();
        pool.shutdown();
        assert_eq!(pool.state(), PoolState::ShutDown);
        assert!(pool.start().is_err());
        assert!(pool.dispatch(item(1)).is_err());
    }

    #[test]
    fn every_dispatched_item_reports_once() {
        let solver = Arc::new(CountingSolver { calls: AtomicUsize::new(0) });
        let pool = WorkerPool::new(3, solver.clone());
        pool.start().unwrap();
        let events = pool.completion_events();

        for id in 0..10 {
            pool.dispatch(item(id)).unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..10 {
            let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
            seen.push(event.work_id.0);
            assert!(pool.take_result(event.work_id).is_some());
        }
        seen.sort();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert_eq!(solver.calls.load(Ordering::SeqCst), 10);
        assert!(pool.take_result(WorkItemId(0)).is_none());
    }

    struct PanickingSolver;

    impl SolverExecutor for PanickingSolver {
        fn execute(&self, artifact: &ArtifactRef) -> SolverRun {
            panic!("solver crashed on {}", artifact.uuid);
        }

        fn name(&self) -> &str {
            "panicking"
        }
    }

    #[test]
    fn panicking_solver_still_reports_and_keeps_workers_alive() {
        let pool = WorkerPool::new(1, Arc::new(PanickingSolver));
        pool.start().unwrap();
        let events = pool.completion_events();

        for id in 0..3 {
            pool.dispatch(item(id)).unwrap();
        }
        for _ in 0..3 {
            let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
            assert!(!event.success);
            let report = pool.take_result(event.work_id).unwrap();
            assert_eq!(report.return_code, PANIC_CODE);
            assert!(report.exception.unwrap().contains("solver crashed"));
        }
        assert!(!pool.is_running(WorkItemId(2)));
        pool.shutdown();
    }

    #[test]
    fn default_worker_count_is_at_least_one() {
        assert!(WorkerPool::default_worker_count() >= 1);
    }
}
