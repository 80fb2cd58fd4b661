//! Simulation groups: one center point, many diffs.
//!
//! A [`SimulationGroup`] owns the ordered diffs produced by a scan request
//! and materializes, submits and tracks one variant per diff. Variants are
//! addressed by their index; a released group can rebuild any of them from
//! its diff and the cached artifact location.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use kr_scan::{GroupType, ScanRequest};
use kr_solve::{ArtifactStore, CompletionEvent, CompletionHandler, ExecutionReport, JobScheduler, WorkItemId};
use kr_types::{
    config_error, ArtifactRef, DataTable, ExecutionError, KrError, KrResult, LookupError,
    OutputState, ParamPath, PerformanceMetric, RunStatus, Simulation, SimulationDiff,
    SimulationResults,
};

/// How a group is built and how it treats finished variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupOptions {
    /// Split into blocks of at most this many variants.
    pub max_block_size: Option<usize>,
    /// Delete artifacts and drop variants as soon as their metrics are stored.
    pub auto_delete_run_sims: bool,
    /// Keep outputs on disk and read them on access.
    pub lazy_loading: bool,
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self {
            max_block_size: None,
            auto_delete_run_sims: false,
            lazy_loading: true,
        }
    }
}

impl GroupOptions {
    pub fn with_max_block_size(mut self, size: usize) -> Self {
        self.max_block_size = Some(size);
        self
    }

    pub fn with_auto_delete(mut self, enabled: bool) -> Self {
        self.auto_delete_run_sims = enabled;
        self
    }

    pub fn with_lazy_loading(mut self, enabled: bool) -> Self {
        self.lazy_loading = enabled;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupStatus {
    Created,
    Running,
    Finished,
}

#[derive(Debug)]
pub struct SimulationGroup {
    name: String,
    group_type: GroupType,
    center_point: Arc<Simulation>,
    diffs: Vec<SimulationDiff>,
    scanned_paths: Vec<ParamPath>,
    metrics: Vec<PerformanceMetric>,
    options: GroupOptions,
    simulations: Vec<Option<Simulation>>,
    artifacts: Vec<Option<ArtifactRef>>,
    results: DataTable,
    sims_run: BTreeSet<usize>,
    failures: HashMap<usize, String>,
    /// Successful variants whose artifacts were auto-deleted.
    deleted: BTreeSet<usize>,
    pending: HashMap<WorkItemId, usize>,
    status: GroupStatus,
    run_start: Option<DateTime<Utc>>,
    run_stop: Option<DateTime<Utc>>,
}

impl SimulationGroup {
    /// Group over explicit diffs. Every diff path must address `center_point`.
    pub fn new(
        name: impl Into<String>,
        group_type: GroupType,
        center_point: Arc<Simulation>,
        diffs: Vec<SimulationDiff>,
        options: GroupOptions,
    ) -> KrResult<Self> {
        let mut scanned_paths: Vec<ParamPath> = Vec::new();
        for diff in &diffs {
            for entry in diff.iter() {
                if !scanned_paths.contains(&entry.path) {
                    entry.path.validate(&center_point.model)?;
                    scanned_paths.push(entry.path.clone());
                }
            }
        }
        scanned_paths.sort_by(|a, b| a.as_str().cmp(b.as_str()));

        let mut metrics = PerformanceMetric::standard_set(&center_point.model.product);
        metrics.sort_by_key(|m| m.label());

        let size = diffs.len();
        let mut group = Self {
            name: name.into(),
            group_type,
            center_point,
            diffs,
            scanned_paths,
            metrics,
            options,
            simulations: vec![None; size],
            artifacts: vec![None; size],
            results: DataTable::default(),
            sims_run: BTreeSet::new(),
            failures: HashMap::new(),
            deleted: BTreeSet::new(),
            pending: HashMap::new(),
            status: GroupStatus::Created,
            run_start: None,
            run_stop: None,
        };
        group.results = group.empty_results()?;
        Ok(group)
    }

    fn empty_results(&self) -> KrResult<DataTable> {
        let mut columns: Vec<String> = self.scanned_paths.iter().map(|p| p.to_string()).collect();
        columns.extend(self.metrics.iter().map(|m| m.label()));
        let mut table = DataTable::new(columns);
        for (i, diff) in self.diffs.iter().enumerate() {
            let mut row: Vec<f64> = self
                .scanned_paths
                .iter()
                .map(|p| diff.value_for(p).unwrap_or(f64::NAN))
                .collect();
            row.extend(std::iter::repeat(f64::NAN).take(self.metrics.len()));
            table.push_row(format!("Sim {i}"), row)?;
        }
        Ok(table)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group_type(&self) -> GroupType {
        self.group_type
    }

    pub fn center_point(&self) -> &Arc<Simulation> {
        &self.center_point
    }

    pub fn diffs(&self) -> &[SimulationDiff] {
        &self.diffs
    }

    pub fn scanned_paths(&self) -> &[ParamPath] {
        &self.scanned_paths
    }

    pub fn options(&self) -> &GroupOptions {
        &self.options
    }

    pub fn status(&self) -> GroupStatus {
        self.status
    }

    pub fn results_table(&self) -> &DataTable {
        &self.results
    }

    pub fn size(&self) -> usize {
        self.diffs.len()
    }

    pub fn size_run(&self) -> usize {
        self.sims_run.len()
    }

    pub fn has_run(&self) -> bool {
        !self.diffs.is_empty() && self.size_run() == self.size()
    }

    pub fn percent_run(&self) -> f64 {
        if self.diffs.is_empty() {
            return 0.0;
        }
        100.0 * self.size_run() as f64 / self.size() as f64
    }

    pub fn percent_run_label(&self) -> String {
        format!("{:.2} %", self.percent_run())
    }

    pub fn run_start(&self) -> Option<DateTime<Utc>> {
        self.run_start
    }

    pub fn run_stop(&self) -> Option<DateTime<Utc>> {
        self.run_stop
    }

    pub fn simulation_name(&self, index: usize) -> String {
        format!("Sim {}_{}", index, self.name)
    }

    pub fn simulation_names(&self) -> Vec<String> {
        (0..self.size()).map(|i| self.simulation_name(i)).collect()
    }

    /// Materialized variants, if any.
    pub fn simulations(&self) -> impl Iterator<Item = &Simulation> {
        self.simulations.iter().flatten()
    }

    fn check_index(&self, index: usize) -> KrResult<()> {
        if index >= self.size() {
            return Err(LookupError::Index {
                owner: self.name.clone(),
                index,
                size: self.size(),
            }
            .into());
        }
        Ok(())
    }

    fn finished_output(&self, artifact: &ArtifactRef) -> KrResult<OutputState> {
        if self.options.lazy_loading {
            Ok(OutputState::Unloaded(artifact.clone()))
        } else {
            Ok(OutputState::Loaded(Arc::new(artifact.read_output()?)))
        }
    }

    /// Rebuild variant `index` from its diff, reusing its cached identity.
    fn rebuild(&self, index: usize) -> KrResult<Simulation> {
        let mut sim = Simulation::build_from(
            &self.center_point,
            self.simulation_name(index),
            &self.diffs[index],
        )?;
        if let Some(artifact) = &self.artifacts[index] {
            sim.uuid = artifact.uuid;
            if let Some(reason) = self.failures.get(&index) {
                sim.mark_failed(reason.clone());
            } else if self.sims_run.contains(&index) {
                if self.deleted.contains(&index) {
                    sim.mark_success(OutputState::Deleted);
                } else if artifact.output_exists() {
                    sim.mark_success(self.finished_output(artifact)?);
                } else {
                    sim.mark_failed("no output artifact");
                }
            } else if self.pending.values().any(|i| *i == index) {
                sim.run_status = RunStatus::Submitted;
            }
        }
        Ok(sim)
    }

    /// (Re)build every variant. With `use_output_cache`, variants keep their
    /// cached identities and any output already on disk marks them as run.
    pub fn initialize_simulations(&mut self, use_output_cache: bool) -> KrResult<()> {
        if !use_output_cache {
            self.artifacts = vec![None; self.size()];
            self.sims_run.clear();
            self.failures.clear();
            self.deleted.clear();
            self.pending.clear();
            self.results = self.empty_results()?;
            self.status = GroupStatus::Created;
        }

        let mut simulations = Vec::with_capacity(self.size());
        for index in 0..self.size() {
            let mut sim = self.rebuild(index)?;
            if use_output_cache && !self.sims_run.contains(&index) {
                if let Some(artifact) = self.artifacts[index].clone() {
                    if artifact.output_exists() {
                        let output = self.finished_output(&artifact)?;
                        let results = match &output {
                            OutputState::Loaded(r) => Some(Arc::clone(r)),
                            _ => artifact.read_output().ok().map(Arc::new),
                        };
                        sim.mark_success(output);
                        self.store_metrics(index, results.as_deref())?;
                        self.sims_run.insert(index);
                    }
                }
            }
            simulations.push(Some(sim));
        }
        self.simulations = simulations;
        if self.has_run() {
            self.status = GroupStatus::Finished;
        }
        debug!(
            "Initialized {} simulation(s) in {} ({} already run)",
            self.size(),
            self.name,
            self.size_run()
        );
        Ok(())
    }

    /// Drop materialized variants. Diffs, cached identities and the results
    /// table survive.
    pub fn release(&mut self) {
        self.simulations = vec![None; self.size()];
    }

    /// Variant `index`, resident or rebuilt from its diff and cached identity.
    pub fn get_simulation(&self, index: usize) -> KrResult<Simulation> {
        self.check_index(index)?;
        match &self.simulations[index] {
            Some(sim) => Ok(sim.clone()),
            None => self.rebuild(index),
        }
    }

    /// Results of variant `index`, read from disk when not resident.
    pub fn output(&self, index: usize) -> KrResult<Option<Arc<SimulationResults>>> {
        self.check_index(index)?;
        if let Some(sim) = &self.simulations[index] {
            return sim.load();
        }
        match &self.artifacts[index] {
            Some(artifact)
                if self.sims_run.contains(&index)
                    && !self.failures.contains_key(&index)
                    && artifact.output_exists() =>
            {
                artifact.read_output().map(|r| Some(Arc::new(r)))
            }
            _ => Ok(None),
        }
    }

    /// Output of every variant, loaded on demand. `None` where the variant
    /// has no readable results.
    pub fn outputs(&self) -> Vec<Option<Arc<SimulationResults>>> {
        (0..self.size())
            .into_par_iter()
            .map(|index| match self.output(index) {
                Ok(results) => results,
                Err(e) => {
                    warn!("Could not load output of {}: {}", self.simulation_name(index), e);
                    None
                }
            })
            .collect()
    }

    /// Submit every variant that has not run yet.
    pub fn run(&mut self, scheduler: &JobScheduler) -> KrResult<()> {
        if self.status == GroupStatus::Running {
            return Err(config_error!("Group {} is already running", self.name));
        }
        if self.simulations.iter().all(Option::is_none) {
            self.initialize_simulations(false)?;
        }

        let to_run: Vec<usize> = (0..self.size())
            .filter(|i| !self.sims_run.contains(i))
            .collect();
        for &index in &to_run {
            if self.simulations[index].is_none() {
                self.simulations[index] = Some(self.rebuild(index)?);
            }
        }
        self.run_start = Some(Utc::now());
        if to_run.is_empty() {
            self.status = GroupStatus::Finished;
            self.run_stop = self.run_start;
            return Ok(());
        }

        let batch = {
            let sims = to_run.iter().filter_map(|&i| self.simulations[i].as_ref());
            scheduler.submit(sims)?
        };
        for ((&index, work_id), artifact) in to_run.iter().zip(batch.work_ids).zip(batch.artifacts) {
            if let Some(sim) = self.simulations[index].as_mut() {
                sim.run_status = RunStatus::Submitted;
            }
            self.artifacts[index] = Some(artifact);
            self.pending.insert(work_id, index);
        }
        self.status = GroupStatus::Running;
        info!("Running group {} ({} simulation(s))", self.name, to_run.len());
        Ok(())
    }

    fn store_metrics(&mut self, index: usize, results: Option<&SimulationResults>) -> KrResult<()> {
        for metric in &self.metrics {
            let value = results.map(|r| metric.extract(r)).unwrap_or(f64::NAN);
            self.results.set(index, &metric.label(), value)?;
        }
        Ok(())
    }

    /// Ingest a finished work item. Returns `false` if the item is not ours.
    ///
    /// A report for the wrong output file fails the variant and is returned
    /// as an error once the variant is accounted for.
    pub fn on_work_item_finished(&mut self, report: ExecutionReport) -> KrResult<bool> {
        let Some(&index) = self.pending.get(&report.work_id) else {
            return Ok(false);
        };
        let artifact = self.artifacts[index]
            .clone()
            .ok_or_else(|| kr_types::internal_error!("No artifact recorded for variant {}", index))?;
        self.pending.remove(&report.work_id);

        let mismatch = (report.output_file != artifact.output).then(|| ExecutionError::OutputMismatch {
            expected: artifact.output.display().to_string(),
            actual: report.output_file.display().to_string(),
        });
        let name = self.simulation_name(index);
        let outcome: Result<SimulationResults, String> = if let Some(err) = &mismatch {
            Err(err.to_string())
        } else if report.is_success() {
            artifact.read_output().map_err(|e| e.to_string())
        } else {
            Err(report.failure_reason().unwrap_or_default())
        };
        let succeeded = outcome.is_ok();

        match outcome {
            Ok(results) => {
                self.store_metrics(index, Some(&results))?;
                let output = if self.options.lazy_loading {
                    OutputState::Unloaded(artifact.clone())
                } else {
                    OutputState::Loaded(Arc::new(results))
                };
                if let Some(sim) = self.simulations[index].as_mut() {
                    sim.mark_success(output);
                }
            }
            Err(reason) => {
                warn!("{} failed: {}", name, reason);
                self.store_metrics(index, None)?;
                if let Some(sim) = self.simulations[index].as_mut() {
                    sim.mark_failed(reason.clone());
                }
                self.failures.insert(index, reason);
            }
        }
        self.sims_run.insert(index);

        if self.options.auto_delete_run_sims {
            match ArtifactStore::remove(&artifact) {
                Ok(()) if succeeded => {
                    self.deleted.insert(index);
                }
                Ok(()) => {}
                Err(e) => warn!("Could not delete artifacts of {}: {}", name, e),
            }
            self.simulations[index] = None;
        }

        if self.has_run() {
            self.status = GroupStatus::Finished;
            self.run_stop = Some(Utc::now());
            info!("Group {} finished running", self.name);
        }
        match mismatch {
            Some(err) => Err(err.into()),
            None => Ok(true),
        }
    }

    /// Pull every finished report of this group from the scheduler.
    pub fn collect_finished(&mut self, scheduler: &JobScheduler) -> KrResult<usize> {
        let ids: Vec<WorkItemId> = self.pending.keys().copied().collect();
        let mut collected = 0;
        for id in ids {
            if let Some(report) = scheduler.take_result(id) {
                self.on_work_item_finished(report)?;
                collected += 1;
            } else if scheduler.is_running(id) {
                if let Some(sim) = self.pending.get(&id).and_then(|&i| self.simulations[i].as_mut()) {
                    sim.run_status = RunStatus::Running;
                }
            }
        }
        Ok(collected)
    }

    /// Poll the scheduler until every submitted variant has reported.
    ///
    /// On timeout the work already ingested is kept and `wait` can be
    /// called again.
    pub fn wait(&mut self, scheduler: &JobScheduler, timeout: Option<Duration>) -> KrResult<()> {
        let started = Instant::now();
        loop {
            self.collect_finished(scheduler)?;
            if self.pending.is_empty() {
                return Ok(());
            }
            if let Some(limit) = timeout {
                if started.elapsed() >= limit {
                    return Err(KrError::Timeout {
                        waited_secs: started.elapsed().as_secs_f64(),
                        pending: self.pending.len(),
                    });
                }
            }
            std::thread::sleep(scheduler.polling_period());
        }
    }

    /// Split into contiguous blocks of at most `max_block_size` variants.
    pub fn split(self, max_block_size: usize) -> KrResult<Vec<SimulationGroup>> {
        if max_block_size == 0 {
            return Err(config_error!("Block size must be positive"));
        }
        if self.status != GroupStatus::Created {
            return Err(config_error!("Cannot split group {} after it ran", self.name));
        }
        if self.size() <= max_block_size {
            return Ok(vec![self]);
        }
        self.diffs
            .chunks(max_block_size)
            .enumerate()
            .map(|(i, chunk)| {
                SimulationGroup::new(
                    format!("Block_{}_{}", i, self.name),
                    self.group_type,
                    Arc::clone(&self.center_point),
                    chunk.to_vec(),
                    self.options.clone(),
                )
            })
            .collect()
    }

    /// Concatenate two not-yet-run groups over the same product.
    pub fn merge(self, other: SimulationGroup) -> KrResult<SimulationGroup> {
        let ours = &self.center_point.model.product;
        let theirs = &other.center_point.model.product;
        if ours.component_names != theirs.component_names {
            return Err(config_error!(
                "Cannot merge groups over products {} and {}",
                ours.name,
                theirs.name
            ));
        }
        if self.status != GroupStatus::Created || other.status != GroupStatus::Created {
            return Err(config_error!("Only groups that have not run can be merged"));
        }
        let mut diffs = self.diffs;
        diffs.extend(other.diffs);
        SimulationGroup::new(self.name, self.group_type, self.center_point, diffs, self.options)
    }
}

impl CompletionHandler for SimulationGroup {
    fn on_completion(&mut self, scheduler: &JobScheduler, event: CompletionEvent) -> KrResult<()> {
        if self.pending.contains_key(&event.work_id) {
            if let Some(report) = scheduler.take_result(event.work_id) {
                self.on_work_item_finished(report)?;
            }
        }
        Ok(())
    }

    fn poll(&mut self, scheduler: &JobScheduler) -> KrResult<()> {
        self.collect_finished(scheduler).map(|_| ())
    }

    fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Expand `request` around `center_point` into one group, or several blocks
/// when `options.max_block_size` is set.
pub fn build_groups(
    name: &str,
    request: &ScanRequest,
    center_point: Arc<Simulation>,
    options: GroupOptions,
) -> KrResult<Vec<SimulationGroup>> {
    request.validate_against(&center_point)?;
    let diffs = request.expand()?;
    let max_block_size = options.max_block_size;
    let group = SimulationGroup::new(name, request.group_type(), center_point, diffs, options)?;
    match max_block_size {
        Some(max) => group.split(max),
        None => Ok(vec![group]),
    }
}
