//! Job scheduler: the single entry point for running variants.

use crossbeam_channel::RecvTimeoutError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use kr_types::{internal_error, ArtifactRef, KrError, KrResult, Simulation};

use crate::artifact::ArtifactStore;
use crate::executor::{ExecutionReport, ExternalSolver, SolverCommand, SolverExecutor};
use crate::pool::{BatchId, CompletionEvent, PoolState, WorkItem, WorkItemId, WorkerPool};

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub max_workers: usize,
    /// How often waiters look for finished work.
    pub polling_period_ms: u64,
    pub work_dir: PathBuf,
    pub solver: SolverCommand,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: WorkerPool::default_worker_count(),
            polling_period_ms: 500,
            work_dir: ArtifactStore::default_root(),
            solver: SolverCommand::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_workers(mut self, n: usize) -> Self {
        self.max_workers = n.max(1);
        self
    }

    pub fn with_polling_period(mut self, period: Duration) -> Self {
        self.polling_period_ms = period.as_millis().max(1) as u64;
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn with_solver(mut self, solver: SolverCommand) -> Self {
        self.solver = solver;
        self
    }

    pub fn polling_period(&self) -> Duration {
        Duration::from_millis(self.polling_period_ms)
    }
}

/// Handle returned by [`JobScheduler::submit`], in submission order.
#[derive(Debug, Clone)]
pub struct SubmittedBatch {
    pub batch_id: BatchId,
    pub work_ids: Vec<WorkItemId>,
    pub artifacts: Vec<ArtifactRef>,
}

impl SubmittedBatch {
    pub fn len(&self) -> usize {
        self.work_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.work_ids.is_empty()
    }
}

/// Consumer of completion events, driven by [`JobScheduler::drive`].
pub trait CompletionHandler {
    /// Called once per event. Events for work the handler does not own must
    /// be ignored.
    fn on_completion(&mut self, scheduler: &JobScheduler, event: CompletionEvent) -> KrResult<()>;

    /// Called when no event arrived within a polling period.
    fn poll(&mut self, _scheduler: &JobScheduler) -> KrResult<()> {
        Ok(())
    }

    fn is_complete(&self) -> bool;

    /// Work items still outstanding, for timeout reporting.
    fn pending(&self) -> usize {
        0
    }
}

/// Owns the artifact store and the one worker pool of a process.
pub struct JobScheduler {
    config: SchedulerConfig,
    store: ArtifactStore,
    pool: WorkerPool,
    next_batch: AtomicU64,
    next_work: AtomicU64,
}

impl JobScheduler {
    pub fn new(config: SchedulerConfig, executor: Arc<dyn SolverExecutor>) -> KrResult<Self> {
        let store = ArtifactStore::new(&config.work_dir)?;
        let pool = WorkerPool::new(config.max_workers, executor);
        Ok(Self {
            config,
            store,
            pool,
            next_batch: AtomicU64::new(0),
            next_work: AtomicU64::new(0),
        })
    }

    /// Scheduler running the external solver named in `config.solver`.
    pub fn with_external_solver(config: SchedulerConfig) -> KrResult<Self> {
        let solver = ExternalSolver::new(config.solver.clone())?;
        Self::new(config, Arc::new(solver))
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn polling_period(&self) -> Duration {
        self.config.polling_period()
    }

    pub fn pool_state(&self) -> PoolState {
        self.pool.state()
    }

    pub fn start(&self) -> KrResult<()> {
        self.pool.start()
    }

    pub fn shutdown(&self) {
        self.pool.shutdown()
    }

    /// Write input artifacts for `sims` and queue them, starting the pool
    /// if it has not been started yet.
    pub fn submit<'a>(&self, sims: impl IntoIterator<Item = &'a Simulation>) -> KrResult<SubmittedBatch> {
        if self.pool.state() == PoolState::Created {
            self.pool.start()?;
        }

        let batch_id = BatchId(self.next_batch.fetch_add(1, Ordering::Relaxed));
        let mut batch = SubmittedBatch {
            batch_id,
            work_ids: Vec::new(),
            artifacts: Vec::new(),
        };
        for sim in sims {
            let artifact = self.store.write_input(sim)?;
            let id = WorkItemId(self.next_work.fetch_add(1, Ordering::Relaxed));
            self.pool.dispatch(WorkItem {
                id,
                batch: batch_id,
                artifact: artifact.clone(),
            })?;
            batch.work_ids.push(id);
            batch.artifacts.push(artifact);
        }
        info!("Submitted batch {:?} with {} simulation(s)", batch_id, batch.len());
        Ok(batch)
    }

    /// Remove and return the report for `id`, if it has finished.
    pub fn take_result(&self, id: WorkItemId) -> Option<ExecutionReport> {
        self.pool.take_result(id)
    }

    pub fn is_running(&self, id: WorkItemId) -> bool {
        self.pool.is_running(id)
    }

    pub fn completion_events(&self) -> crossbeam_channel::Receiver<CompletionEvent> {
        self.pool.completion_events()
    }

    /// Feed completion events to `handler` until it reports completion.
    ///
    /// Work still in flight when `timeout` expires is left untouched and the
    /// call can be repeated.
    pub fn drive(&self, handler: &mut dyn CompletionHandler, timeout: Option<Duration>) -> KrResult<()> {
        let events = self.pool.completion_events();
        let started = Instant::now();
        let period = self.polling_period();

        while !handler.is_complete() {
            let wait = match timeout {
                Some(limit) => {
                    let elapsed = started.elapsed();
                    if elapsed >= limit {
                        return Err(KrError::Timeout {
                            waited_secs: elapsed.as_secs_f64(),
                            pending: handler.pending(),
                        });
                    }
                    period.min(limit - elapsed)
                }
                None => period,
            };

            match events.recv_timeout(wait) {
                Ok(event) => {
                    debug!("Completion of {:?} in batch {:?}", event.work_id, event.batch);
                    handler.on_completion(self, event)?;
                }
                Err(RecvTimeoutError::Timeout) => handler.poll(self)?,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(internal_error!("Completion channel closed"));
                }
            }
        }
        Ok(())
    }
}
