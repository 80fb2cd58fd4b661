//! Multi-step optimizers.
//!
//! A simple optimizer runs one grid step. A self-refining optimizer follows
//! that step with one refinement step per target component: each rescans
//! the component's binding parameters in a narrowed range around the best
//! values found so far, starting from a model that already carries every
//! component's current optimum.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use kr_scan::ParameterScan;
use kr_solve::{CompletionEvent, CompletionHandler, JobScheduler};
use kr_types::{
    config_error, internal_error, DataTable, Experiment, KrError, KrResult, PathSegment, Product,
    Simulation, SimulationDiff, SingleParamDiff,
};

use crate::constant_step::ConstantStepConfig;
use crate::cost::CostWeights;
use crate::refine::{refined_scan, RefiningConfig};
use crate::step::{OptimizerStep, StepConfig, StepStatus, ALL_COST_COL};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OptimizerKind {
    Simple,
    #[default]
    SelfRefining,
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple => f.write_str("Simple"),
            Self::SelfRefining => f.write_str("Self-refining"),
        }
    }
}

impl FromStr for OptimizerKind {
    type Err = KrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simple" => Ok(Self::Simple),
            "self-refining" | "self_refining" | "selfrefining" | "two-step" => Ok(Self::SelfRefining),
            other => Err(config_error!("Unsupported optimizer type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub name: String,
    pub kind: OptimizerKind,
    pub step: StepConfig,
    /// Scans used for step 0 when no explicit parameter list is given.
    pub constant_step: ConstantStepConfig,
    pub refining: RefiningConfig,
    pub num_optimal_simulations: usize,
    pub do_refine: bool,
    /// Components to fit; every product component when `None`.
    pub target_components: Option<Vec<String>>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            name: "Optimizer".to_string(),
            kind: OptimizerKind::SelfRefining,
            step: StepConfig::default(),
            constant_step: ConstantStepConfig::default(),
            refining: RefiningConfig::default(),
            num_optimal_simulations: 3,
            do_refine: true,
            target_components: None,
        }
    }
}

impl OptimizerConfig {
    pub fn new(name: impl Into<String>, kind: OptimizerKind) -> Self {
        Self {
            name: name.into(),
            kind,
            ..Default::default()
        }
    }

    pub fn with_step(mut self, step: StepConfig) -> Self {
        self.step = step;
        self
    }

    pub fn with_constant_step(mut self, constant_step: ConstantStepConfig) -> Self {
        self.constant_step = constant_step;
        self
    }

    pub fn with_refining(mut self, refining: RefiningConfig) -> Self {
        self.refining = refining;
        self
    }

    pub fn with_num_optimal_simulations(mut self, n: usize) -> Self {
        self.num_optimal_simulations = n;
        self
    }

    pub fn with_refinement(mut self, enabled: bool) -> Self {
        self.do_refine = enabled;
        self
    }

    pub fn with_target_components(mut self, components: Vec<String>) -> Self {
        self.target_components = Some(components);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerStatus {
    Created,
    Running,
    Finished,
    Failed,
}

#[derive(Debug)]
pub struct Optimizer {
    config: OptimizerConfig,
    product: Product,
    targets: Vec<Arc<Experiment>>,
    target_components: Vec<String>,
    /// Components still to be refined, one step each, in order.
    planned_refinements: Vec<String>,
    steps: Vec<OptimizerStep>,
    current_step: usize,
    status: OptimizerStatus,
    run_start: Option<DateTime<Utc>>,
    run_stop: Option<DateTime<Utc>>,
}

impl Optimizer {
    /// Optimizer fitting `targets` from `starting_points` (one per target).
    /// Without a `parameter_list`, step 0 scans the binding constants
    /// selected by `config.constant_step`.
    pub fn new(
        config: OptimizerConfig,
        targets: Vec<Arc<Experiment>>,
        starting_points: Vec<Arc<Simulation>>,
        parameter_list: Option<Vec<ParameterScan>>,
    ) -> KrResult<Self> {
        let product = targets
            .first()
            .map(|t| t.product.clone())
            .ok_or_else(|| config_error!("Optimizer {} needs at least one target", config.name))?;
        let target_components = config
            .target_components
            .clone()
            .unwrap_or_else(|| product.component_names.clone());
        let parameter_list = match parameter_list {
            Some(list) => list,
            None => config.constant_step.parameter_list(&product, &target_components)?,
        };

        let refines = config.kind == OptimizerKind::SelfRefining && config.do_refine;
        if refines {
            config.refining.validate()?;
            for scan in &parameter_list {
                let per_component = matches!(
                    scan.name().segments().last(),
                    Some(PathSegment::Index(_)) | Some(PathSegment::Slice { .. })
                );
                if !per_component {
                    return Err(config_error!(
                        "Cannot refine {}: refined parameters must be per-component arrays",
                        scan.name()
                    ));
                }
            }
        }

        let step0 = OptimizerStep::new(
            format!("{}: step 0", config.name),
            targets.clone(),
            starting_points,
            parameter_list,
            Some(target_components.clone()),
            config.step.clone(),
        )?;
        let planned_refinements = if refines {
            target_components.clone()
        } else {
            Vec::new()
        };

        Ok(Self {
            config,
            product,
            targets,
            target_components,
            planned_refinements,
            steps: vec![step0],
            current_step: 0,
            status: OptimizerStatus::Created,
            run_start: None,
            run_stop: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn kind(&self) -> OptimizerKind {
        self.config.kind
    }

    pub fn status(&self) -> OptimizerStatus {
        self.status
    }

    pub fn has_run(&self) -> bool {
        self.status == OptimizerStatus::Finished
    }

    pub fn targets(&self) -> &[Arc<Experiment>] {
        &self.targets
    }

    pub fn target_components(&self) -> &[String] {
        &self.target_components
    }

    /// Steps created so far; refinement steps appear as they are prepared.
    pub fn steps(&self) -> &[OptimizerStep] {
        &self.steps
    }

    pub fn run_start(&self) -> Option<DateTime<Utc>> {
        self.run_start
    }

    pub fn run_stop(&self) -> Option<DateTime<Utc>> {
        self.run_stop
    }

    pub fn set_num_optimal_simulations(&mut self, n: usize) {
        self.config.num_optimal_simulations = n;
    }

    pub fn set_refining(&mut self, refining: RefiningConfig) -> KrResult<()> {
        if self.status != OptimizerStatus::Created {
            return Err(config_error!(
                "Cannot change refinement of {} once it has started",
                self.config.name
            ));
        }
        refining.validate()?;
        self.config.refining = refining;
        Ok(())
    }

    fn total_steps(&self) -> usize {
        1 + self.planned_refinements.len()
    }

    /// Number of variants over all steps, including refinements not yet
    /// prepared.
    pub fn size(&self) -> usize {
        let refined_size = self
            .config
            .refining
            .num_values
            .pow(self.steps[0].parameter_list().len() as u32)
            * self.targets.len();
        (0..self.total_steps())
            .map(|i| match self.steps.get(i) {
                Some(step) => step.size(),
                None => refined_size,
            })
            .sum()
    }

    pub fn size_run(&self) -> usize {
        self.steps.iter().map(|s| s.size_run()).sum()
    }

    pub fn percent_run(&self) -> f64 {
        let size = self.size();
        if size == 0 {
            return 0.0;
        }
        100.0 * self.size_run() as f64 / size as f64
    }

    pub fn run_duration(&self) -> Option<Duration> {
        let (start, stop) = (self.run_start?, self.run_stop?);
        (stop - start).to_std().ok()
    }

    pub fn run(&mut self, scheduler: &JobScheduler) -> KrResult<()> {
        if self.status != OptimizerStatus::Created {
            return Err(config_error!("Optimizer {} has already been run", self.config.name));
        }
        self.status = OptimizerStatus::Running;
        self.run_start = Some(Utc::now());
        info!(
            "Running {} optimizer {} over {} target(s)",
            self.config.kind,
            self.config.name,
            self.targets.len()
        );
        let result = self.steps[0].run(scheduler).and_then(|()| self.advance(scheduler));
        self.settle(result)
    }

    /// Mark the optimizer failed when the current step could not be scored.
    fn settle(&mut self, result: KrResult<()>) -> KrResult<()> {
        if let Err(e) = &result {
            if self.steps[self.current_step].status() == StepStatus::Failed {
                warn!("Optimizer {} failed in step {}: {}", self.config.name, self.current_step, e);
                self.status = OptimizerStatus::Failed;
                self.run_stop = Some(Utc::now());
            }
        }
        result
    }

    /// Block until every step has run.
    pub fn wait(&mut self, scheduler: &JobScheduler, timeout: Option<Duration>) -> KrResult<()> {
        scheduler.drive(self, timeout)
    }

    /// Prepare and run the next step whenever the current one finishes.
    fn advance(&mut self, scheduler: &JobScheduler) -> KrResult<()> {
        loop {
            if !self.steps[self.current_step].is_finished() {
                return Ok(());
            }
            let next = self.current_step + 1;
            if next >= self.total_steps() {
                break;
            }
            if next == self.steps.len() {
                let step = self.prepare_refinement(next - 1)?;
                self.steps.push(step);
            }
            self.current_step = next;
            self.steps[next].run(scheduler)?;
        }

        if self.status == OptimizerStatus::Running {
            self.status = OptimizerStatus::Finished;
            self.run_stop = Some(Utc::now());
            info!(
                "Optimizer {} finished {} simulation(s) in {:?}",
                self.config.name,
                self.size_run(),
                self.run_duration().unwrap_or_default()
            );
        }
        Ok(())
    }

    /// Refinement step for `planned_refinements[j]`.
    fn prepare_refinement(&self, j: usize) -> KrResult<OptimizerStep> {
        let step0 = &self.steps[0];
        let comp = &self.planned_refinements[j];
        let index = self.product.component_index(comp)? + 1;

        let diff = self.best_value_diff()?;
        let starting_points = step0
            .starting_points()
            .iter()
            .map(|sp| Simulation::build_from(sp, sp.name.clone(), &diff).map(Arc::new))
            .collect::<KrResult<Vec<_>>>()?;

        let parameter_list = step0
            .parameter_list()
            .iter()
            .map(|scan| {
                let best = step0.optimal_value_for_comp(comp, scan.name())?;
                refined_scan(
                    scan.name().with_index(index)?,
                    &scan.scanned_values(),
                    best,
                    &self.config.refining,
                )
            })
            .collect::<KrResult<Vec<_>>>()?;

        debug!(
            "Prepared refinement of {} over {}",
            comp,
            parameter_list
                .iter()
                .map(|s| format!("{} [{}, {}]", s.name(), s.low(), s.high()))
                .collect::<Vec<_>>()
                .join(", ")
        );
        OptimizerStep::new(
            format!("{}: step {}", self.config.name, j + 1),
            self.targets.clone(),
            starting_points,
            parameter_list,
            Some(vec![comp.clone()]),
            self.config.step.clone(),
        )
    }

    /// Current best value of every scanned family for every target
    /// component: from its refinement step once that has run, else from
    /// step 0.
    fn best_value_diff(&self) -> KrResult<SimulationDiff> {
        let step0 = &self.steps[0];
        let mut entries = Vec::new();
        for comp in &self.target_components {
            let index = self.product.component_index(comp)? + 1;
            let refined = self
                .planned_refinements
                .iter()
                .position(|c| c == comp)
                .and_then(|j| self.steps.get(j + 1))
                .filter(|step| step.is_finished());
            for scan in step0.parameter_list() {
                let path = scan.name().with_index(index)?;
                let best = match refined {
                    Some(step) => step.optimal_value_for_comp(comp, &path)?,
                    None => step0.optimal_value_for_comp(comp, scan.name())?,
                };
                entries.push(SingleParamDiff::new(path, best));
            }
        }
        Ok(SimulationDiff::new(entries))
    }

    /// Starting points carrying every component's best values, one per
    /// target.
    pub fn optimal_models(&self) -> KrResult<Vec<Simulation>> {
        if self.config.kind != OptimizerKind::SelfRefining {
            return Err(config_error!("Only self-refining optimizers build optimal models"));
        }
        if !self.has_run() {
            return Err(internal_error!("Optimizer {} has not finished", self.config.name));
        }
        let diff = self.best_value_diff()?;
        self.steps[0]
            .starting_points()
            .iter()
            .zip(&self.targets)
            .map(|(sp, target)| {
                Simulation::build_from(
                    sp,
                    format!("{} optimum for {}", self.config.name, target.name),
                    &diff,
                )
            })
            .collect()
    }

    /// Best `num_optimal_simulations` variants of the last finished step,
    /// interleaved across targets by rank.
    pub fn optimal_simulations(&self) -> KrResult<Vec<Simulation>> {
        let step = self
            .steps
            .iter()
            .rev()
            .find(|s| s.is_finished())
            .ok_or_else(|| internal_error!("No step of {} has finished", self.config.name))?;
        let n = self.config.num_optimal_simulations;
        let per_target = self
            .targets
            .iter()
            .map(|t| step.get_optimal_sims(&t.name, n))
            .collect::<KrResult<Vec<_>>>()?;

        let mut interleaved = Vec::new();
        for rank in 0..n {
            for sims in &per_target {
                if let Some(sim) = sims.get(rank) {
                    interleaved.push(sim.clone());
                }
            }
        }
        Ok(interleaved)
    }

    /// Cost data of every finished step, one row per variant, sorted by cost.
    pub fn cost_data(&self) -> KrResult<DataTable> {
        let mut tables = Vec::new();
        for step in self.steps.iter().filter(|s| s.is_finished()) {
            let Some(table) = step.cost_data() else {
                continue;
            };
            let mut columns: Vec<String> = Vec::new();
            for path in step.scanned_paths() {
                let name = path.to_string();
                if !columns.contains(&name) {
                    columns.push(name);
                }
            }
            columns.push(ALL_COST_COL.to_string());
            let selected = table.select(&columns)?;

            let mut relabeled = DataTable::new(columns);
            for (r, label) in selected.labels().iter().enumerate() {
                let row = selected
                    .row(r)
                    .ok_or_else(|| internal_error!("Missing row {}", r))?;
                relabeled.push_row(format!("{}: {}", step.name(), label), row.to_vec())?;
            }
            tables.push(relabeled);
        }

        let combined = DataTable::concat(tables.iter());
        let mut columns: Vec<String> = combined
            .columns()
            .iter()
            .filter(|c| c.as_str() != ALL_COST_COL)
            .cloned()
            .collect();
        columns.sort();
        columns.push(ALL_COST_COL.to_string());
        if combined.column_index(ALL_COST_COL).is_none() {
            return Ok(DataTable::new(columns));
        }
        combined.select(&columns)?.sorted_by(ALL_COST_COL)
    }

    pub fn recompute_costs_for_weights(&mut self, weights: CostWeights) -> KrResult<()> {
        self.config.step.cost.weights = weights;
        for step in &mut self.steps {
            step.recompute_costs_for_weights(weights)?;
        }
        Ok(())
    }
}

impl CompletionHandler for Optimizer {
    fn on_completion(&mut self, scheduler: &JobScheduler, event: CompletionEvent) -> KrResult<()> {
        let result = self.steps[self.current_step]
            .on_completion(scheduler, event)
            .and_then(|()| self.advance(scheduler));
        self.settle(result)
    }

    fn poll(&mut self, scheduler: &JobScheduler) -> KrResult<()> {
        let result = self.steps[self.current_step]
            .poll(scheduler)
            .and_then(|()| self.advance(scheduler));
        self.settle(result)
    }

    fn is_complete(&self) -> bool {
        matches!(self.status, OptimizerStatus::Finished | OptimizerStatus::Failed)
    }

    fn pending(&self) -> usize {
        self.steps[self.current_step].pending()
    }
}
