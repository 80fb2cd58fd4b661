//! One optimizer step: grid scans around a starting point per target
//! experiment, scored by the peak-shape cost function.
//!
//! Groups run one at a time in creation order. Each finished group is scored
//! against its own target and released; once every group is done the
//! per-target cost tables are aggregated position by position into the
//! step's cost data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use kr_scan::{ParameterScan, ScanRequest};
use kr_solve::{CompletionEvent, CompletionHandler, JobScheduler};
use kr_types::{
    config_error, internal_error, DataError, DataTable, Experiment, KrResult,
    LookupError, ParamPath, Simulation,
};

use crate::cost::{CostFunctionConfig, CostWeights, PeakShapeCostFunction};
use crate::group::{build_groups, GroupOptions, GroupStatus, SimulationGroup};

/// Column holding the cost over all selected components.
pub const ALL_COST_COL: &str = "Cost (All selected comps)";

/// How costs are combined across components and across targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CostAggregation {
    #[default]
    Sum,
    Mean,
}

impl CostAggregation {
    /// Combine `values`, ignoring NaN. NaN when every value is NaN.
    pub fn combine_available(&self, values: &[f64]) -> f64 {
        let present: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
        if present.is_empty() {
            return f64::NAN;
        }
        self.combine(&present)
    }

    /// Combine `values`; any NaN makes the result NaN.
    pub fn combine(&self, values: &[f64]) -> f64 {
        let total: f64 = values.iter().sum();
        match self {
            Self::Sum => total,
            Self::Mean => total / values.len() as f64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    pub cost: CostFunctionConfig,
    pub cost_aggregation: CostAggregation,
    /// Split each target's grid into blocks of at most this many variants.
    pub sim_group_max_size: Option<usize>,
    pub lazy_loading: bool,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            cost: CostFunctionConfig::default(),
            cost_aggregation: CostAggregation::Sum,
            sim_group_max_size: None,
            lazy_loading: true,
        }
    }
}

impl StepConfig {
    pub fn with_cost(mut self, cost: CostFunctionConfig) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_aggregation(mut self, aggregation: CostAggregation) -> Self {
        self.cost_aggregation = aggregation;
        self
    }

    pub fn with_group_max_size(mut self, size: usize) -> Self {
        self.sim_group_max_size = Some(size);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Created,
    Running,
    Finished,
    /// A group could not be scored at all.
    Failed,
}

/// Position of a variant: group index within the step, variant index within
/// the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimRef {
    pub group: usize,
    pub index: usize,
}

#[derive(Debug)]
pub struct OptimizerStep {
    name: String,
    targets: Vec<Arc<Experiment>>,
    starting_points: Vec<Arc<Simulation>>,
    parameter_list: Vec<ParameterScan>,
    target_components: Vec<String>,
    config: StepConfig,
    status: StepStatus,
    groups: Vec<SimulationGroup>,
    group_target: Vec<usize>,
    cost_functions: Vec<Option<PeakShapeCostFunction>>,
    group_costs: Vec<Option<DataTable>>,
    target_costs: Vec<Option<DataTable>>,
    target_refs: Vec<Vec<SimRef>>,
    cost_data: Option<DataTable>,
    current_group: usize,
    run_start: Option<DateTime<Utc>>,
    run_stop: Option<DateTime<Utc>>,
}

impl OptimizerStep {
    /// Step scanning `parameter_list` around `starting_points[i]` for
    /// `targets[i]`. `target_components` defaults to every product component.
    pub fn new(
        name: impl Into<String>,
        targets: Vec<Arc<Experiment>>,
        starting_points: Vec<Arc<Simulation>>,
        parameter_list: Vec<ParameterScan>,
        target_components: Option<Vec<String>>,
        config: StepConfig,
    ) -> KrResult<Self> {
        let name = name.into();
        let first = targets
            .first()
            .ok_or_else(|| config_error!("Step {} needs at least one target experiment", name))?;
        let product = first.product.clone();
        for target in &targets {
            if !target.has_output() {
                return Err(DataError::NoOutput {
                    experiment: target.name.clone(),
                }
                .into());
            }
            if target.product != product {
                return Err(DataError::ProductMismatch {
                    expected: product.name.clone(),
                    actual: target.product.name.clone(),
                }
                .into());
            }
        }

        if starting_points.len() != targets.len() {
            return Err(config_error!(
                "Step {} has {} starting point(s) for {} target(s)",
                name,
                starting_points.len(),
                targets.len()
            ));
        }
        for sp in &starting_points {
            if sp.model.product != product {
                return Err(DataError::ProductMismatch {
                    expected: product.name.clone(),
                    actual: sp.model.product.name.clone(),
                }
                .into());
            }
        }

        if parameter_list.is_empty() {
            return Err(config_error!("Step {} has no parameter to scan", name));
        }
        for scan in &parameter_list {
            for sp in &starting_points {
                scan.validate_against(sp)?;
            }
        }

        let target_components = target_components.unwrap_or_else(|| product.component_names.clone());
        if target_components.is_empty() {
            return Err(config_error!("Step {} has no target component", name));
        }
        for comp in &target_components {
            product.component_index(comp)?;
        }

        let num_targets = targets.len();
        Ok(Self {
            name,
            targets,
            starting_points,
            parameter_list,
            target_components,
            config,
            status: StepStatus::Created,
            groups: Vec::new(),
            group_target: Vec::new(),
            cost_functions: Vec::new(),
            group_costs: Vec::new(),
            target_costs: vec![None; num_targets],
            target_refs: vec![Vec::new(); num_targets],
            cost_data: None,
            current_group: 0,
            run_start: None,
            run_stop: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn is_finished(&self) -> bool {
        self.status == StepStatus::Finished
    }

    pub fn targets(&self) -> &[Arc<Experiment>] {
        &self.targets
    }

    pub fn starting_points(&self) -> &[Arc<Simulation>] {
        &self.starting_points
    }

    pub fn parameter_list(&self) -> &[ParameterScan] {
        &self.parameter_list
    }

    pub fn target_components(&self) -> &[String] {
        &self.target_components
    }

    pub fn config(&self) -> &StepConfig {
        &self.config
    }

    pub fn groups(&self) -> &[SimulationGroup] {
        &self.groups
    }

    pub fn run_start(&self) -> Option<DateTime<Utc>> {
        self.run_start
    }

    pub fn run_stop(&self) -> Option<DateTime<Utc>> {
        self.run_stop
    }

    /// Every path written by the parameter list, primary and parallel.
    pub fn scanned_paths(&self) -> Vec<ParamPath> {
        self.parameter_list
            .iter()
            .flat_map(|s| s.scanned_paths().into_iter().cloned())
            .collect()
    }

    fn param_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        for path in self.scanned_paths() {
            let name = path.to_string();
            if !columns.contains(&name) {
                columns.push(name);
            }
        }
        columns
    }

    /// Aggregated cost table, available once the step has finished.
    pub fn cost_data(&self) -> Option<&DataTable> {
        self.cost_data.as_ref()
    }

    fn target_index(&self, target_name: &str) -> KrResult<usize> {
        self.targets
            .iter()
            .position(|t| t.name == target_name)
            .ok_or_else(|| {
                LookupError::Target {
                    name: target_name.to_string(),
                }
                .into()
            })
    }

    /// Cost table of one target, available once all its groups are scored.
    pub fn target_cost_data(&self, target_name: &str) -> KrResult<&DataTable> {
        let t = self.target_index(target_name)?;
        self.target_costs[t]
            .as_ref()
            .ok_or_else(|| internal_error!("Costs for {} are not available yet", target_name))
    }

    pub fn size(&self) -> usize {
        if !self.groups.is_empty() {
            return self.groups.iter().map(|g| g.size()).sum();
        }
        let per_target: usize = self.parameter_list.iter().map(|s| s.num_values()).product();
        per_target * self.targets.len()
    }

    pub fn size_run(&self) -> usize {
        self.groups.iter().map(|g| g.size_run()).sum()
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

    fn initialize_groups(&mut self) -> KrResult<()> {
        let request = ScanRequest::Grid(self.parameter_list.clone());
        let options = GroupOptions {
            max_block_size: self.config.sim_group_max_size,
            auto_delete_run_sims: false,
            lazy_loading: self.config.lazy_loading,
        };
        for (t, target) in self.targets.iter().enumerate() {
            let name = format!("Grid {}_{}", target.name, self.name);
            let groups = build_groups(
                &name,
                &request,
                Arc::clone(&self.starting_points[t]),
                options.clone(),
            )?;
            for mut group in groups {
                group.initialize_simulations(false)?;
                self.groups.push(group);
                self.group_target.push(t);
            }
        }
        self.cost_functions = vec![None; self.groups.len()];
        self.group_costs = vec![None; self.groups.len()];
        debug!("Step {} built {} group(s)", self.name, self.groups.len());
        Ok(())
    }

    /// Build the groups and submit the first one.
    pub fn run(&mut self, scheduler: &JobScheduler) -> KrResult<()> {
        if self.status != StepStatus::Created {
            return Err(config_error!("Step {} has already been run", self.name));
        }
        if self.groups.is_empty() {
            self.initialize_groups()?;
        }
        self.status = StepStatus::Running;
        self.run_start = Some(Utc::now());
        info!(
            "Running step {}: {} simulation(s) in {} group(s)",
            self.name,
            self.size(),
            self.groups.len()
        );
        if let Some(group) = self.groups.first_mut() {
            group.run(scheduler)?;
        }
        self.advance(scheduler)
    }

    /// Score finished groups and submit the next one.
    fn advance(&mut self, scheduler: &JobScheduler) -> KrResult<()> {
        if self.status == StepStatus::Failed {
            return Ok(());
        }
        while self.current_group < self.groups.len() {
            if self.groups[self.current_group].status() != GroupStatus::Finished {
                return Ok(());
            }
            self.on_group_finished(self.current_group)?;
            self.current_group += 1;
            if let Some(next) = self.groups.get_mut(self.current_group) {
                next.run(scheduler)?;
            }
        }

        if self.status == StepStatus::Running {
            self.cost_data = Some(self.aggregate_targets()?);
            self.status = StepStatus::Finished;
            self.run_stop = Some(Utc::now());
            info!("Step {} finished", self.name);
        }
        Ok(())
    }

    /// Block until every group of the step has run and been scored.
    pub fn wait(&mut self, scheduler: &JobScheduler, timeout: Option<Duration>) -> KrResult<()> {
        scheduler.drive(self, timeout)
    }

    fn on_group_finished(&mut self, k: usize) -> KrResult<()> {
        let group = &self.groups[k];
        let target = Arc::clone(&self.targets[self.group_target[k]]);
        let names = group.simulation_names();
        let outputs = group.outputs();

        let mut cost_function =
            PeakShapeCostFunction::new(self.config.cost.clone(), self.target_components.clone());
        let costs = match cost_function.evaluate(&names, &outputs, &[target.as_ref()]) {
            Ok(costs) => costs,
            Err(e) => {
                warn!("Could not score group {}: {}", group.name(), e);
                self.status = StepStatus::Failed;
                self.run_stop = Some(Utc::now());
                return Err(e);
            }
        };

        self.group_costs[k] = Some(self.assemble_group_costs(k, &costs)?);
        self.cost_functions[k] = Some(cost_function);
        self.groups[k].release();
        debug!("Scored group {} against {}", self.groups[k].name(), target.name);

        let t = self.group_target[k];
        let target_done = self
            .group_target
            .iter()
            .zip(&self.group_costs)
            .filter(|(gt, _)| **gt == t)
            .all(|(_, costs)| costs.is_some());
        if target_done {
            self.rebuild_target_costs(t)?;
        }
        Ok(())
    }

    /// Parameter columns, component costs, then the all-component cost.
    fn assemble_group_costs(&self, k: usize, costs: &DataTable) -> KrResult<DataTable> {
        let param_columns = self.param_columns();
        let params: Vec<ParamPath> = param_columns
            .iter()
            .map(|c| ParamPath::parse(c))
            .collect::<KrResult<_>>()?;
        let mut columns = param_columns;
        columns.extend(self.target_components.iter().cloned());
        columns.push(ALL_COST_COL.to_string());

        let diffs = self.groups[k].diffs();
        if diffs.len() != costs.num_rows() {
            return Err(internal_error!(
                "Group {} has {} variant(s) but {} cost row(s)",
                self.groups[k].name(),
                diffs.len(),
                costs.num_rows()
            ));
        }
        let mut table = DataTable::new(columns);
        for (r, diff) in diffs.iter().enumerate() {
            let comp_costs = costs
                .row(r)
                .ok_or_else(|| internal_error!("Missing cost row {}", r))?;
            let mut row: Vec<f64> = params
                .iter()
                .map(|p| diff.value_for(p).unwrap_or(f64::NAN))
                .collect();
            row.extend_from_slice(comp_costs);
            row.push(self.config.cost_aggregation.combine_available(comp_costs));
            table.push_row(costs.labels()[r].clone(), row)?;
        }
        Ok(table)
    }

    fn rebuild_target_costs(&mut self, t: usize) -> KrResult<()> {
        let mut tables = Vec::new();
        let mut refs = Vec::new();
        for (k, costs) in self.group_costs.iter().enumerate() {
            if self.group_target[k] != t {
                continue;
            }
            let costs = costs
                .as_ref()
                .ok_or_else(|| internal_error!("Group {} has not been scored", k))?;
            refs.extend((0..costs.num_rows()).map(|index| SimRef { group: k, index }));
            tables.push(costs);
        }
        self.target_costs[t] = Some(DataTable::concat(tables));
        self.target_refs[t] = refs;
        Ok(())
    }

    /// Combine the per-target tables row by row.
    fn aggregate_targets(&self) -> KrResult<DataTable> {
        let tables: Vec<&DataTable> = self
            .target_costs
            .iter()
            .map(|t| {
                t.as_ref()
                    .ok_or_else(|| internal_error!("Step {} has unscored targets", self.name))
            })
            .collect::<KrResult<_>>()?;
        let first = tables[0];
        let num_params = self.param_columns().len();
        let mut table = DataTable::new(first.columns().to_vec());

        for r in 0..first.num_rows() {
            let base = first
                .row(r)
                .ok_or_else(|| internal_error!("Missing row {}", r))?;
            let mut rows = Vec::with_capacity(tables.len());
            for other in &tables {
                let row = other.row(r).ok_or_else(|| {
                    internal_error!("Target tables of step {} differ in length", self.name)
                })?;
                let aligned = row[..num_params]
                    .iter()
                    .zip(&base[..num_params])
                    .all(|(a, b)| a == b || (a.is_nan() && b.is_nan()));
                if !aligned {
                    return Err(internal_error!(
                        "Row {} of step {} scans different values per target",
                        r,
                        self.name
                    ));
                }
                rows.push(row);
            }

            let mut values = base[..num_params].to_vec();
            for c in num_params..base.len() {
                let column: Vec<f64> = rows.iter().map(|row| row[c]).collect();
                values.push(self.config.cost_aggregation.combine(&column));
            }
            table.push_row(format!("Sim {r}"), values)?;
        }
        Ok(table)
    }

    fn finished_cost_data(&self) -> KrResult<&DataTable> {
        self.cost_data
            .as_ref()
            .ok_or_else(|| internal_error!("Step {} has not finished", self.name))
    }

    fn check_component(&self, component: &str) -> KrResult<()> {
        if self.target_components.iter().any(|c| c == component) {
            Ok(())
        } else {
            Err(LookupError::Component {
                name: component.to_string(),
            }
            .into())
        }
    }

    /// Value of `path` in the row with the lowest aggregated cost for
    /// `component`.
    pub fn optimal_value_for_comp(&self, component: &str, path: &ParamPath) -> KrResult<f64> {
        self.check_component(component)?;
        let table = self.finished_cost_data()?;
        let row = table.argmin(component).ok_or_else(|| DataError::InsufficientData {
            message: format!("No finite cost for {} in step {}", component, self.name),
        })?;
        table
            .get(row, path.as_str())
            .ok_or_else(|| config_error!("{} was not scanned in step {}", path, self.name))
    }

    /// Per target, the variant with the lowest cost for `component`.
    pub fn optimal_simulation_for_comp(&self, component: &str) -> KrResult<Vec<SimRef>> {
        self.check_component(component)?;
        self.targets
            .iter()
            .enumerate()
            .map(|(t, target)| {
                let table = self.target_costs[t]
                    .as_ref()
                    .ok_or_else(|| internal_error!("Costs for {} are not available", target.name))?;
                let row = table.argmin(component).ok_or_else(|| DataError::InsufficientData {
                    message: format!("No finite cost for {} against {}", component, target.name),
                })?;
                Ok(self.target_refs[t][row])
            })
            .collect()
    }

    /// Materialize a variant by reference.
    pub fn simulation(&self, sim_ref: SimRef) -> KrResult<Simulation> {
        let group = self.groups.get(sim_ref.group).ok_or_else(|| LookupError::Index {
            owner: self.name.clone(),
            index: sim_ref.group,
            size: self.groups.len(),
        })?;
        group.get_simulation(sim_ref.index)
    }

    /// The `n` best variants for `target_name` by all-component cost.
    pub fn get_optimal_sims(&self, target_name: &str, n: usize) -> KrResult<Vec<Simulation>> {
        let t = self.target_index(target_name)?;
        let table = self.target_cost_data(target_name)?;
        table
            .sort_order(ALL_COST_COL)?
            .into_iter()
            .take(n)
            .map(|row| self.simulation(self.target_refs[t][row]))
            .collect()
    }

    /// Apply new cost weights. Scored groups are recomputed from cached
    /// measurements without reloading any output.
    pub fn recompute_costs_for_weights(&mut self, weights: CostWeights) -> KrResult<()> {
        weights.normalized()?;
        self.config.cost.weights = weights;
        if self.status == StepStatus::Created {
            return Ok(());
        }

        for k in 0..self.groups.len() {
            let Some(cost_function) = self.cost_functions[k].as_mut() else {
                continue;
            };
            let costs = cost_function.recompute(weights)?;
            self.group_costs[k] = Some(self.assemble_group_costs(k, &costs)?);
        }
        for t in 0..self.targets.len() {
            if self.target_costs[t].is_some() {
                self.rebuild_target_costs(t)?;
            }
        }
        if self.status == StepStatus::Finished {
            self.cost_data = Some(self.aggregate_targets()?);
        }
        info!("Recomputed costs of step {} for {:?}", self.name, weights);
        Ok(())
    }
}

impl CompletionHandler for OptimizerStep {
    fn on_completion(&mut self, scheduler: &JobScheduler, event: CompletionEvent) -> KrResult<()> {
        if let Some(group) = self.groups.get_mut(self.current_group) {
            group.on_completion(scheduler, event)?;
        }
        self.advance(scheduler)
    }

    fn poll(&mut self, scheduler: &JobScheduler) -> KrResult<()> {
        if let Some(group) = self.groups.get_mut(self.current_group) {
            group.poll(scheduler)?;
        }
        self.advance(scheduler)
    }

    fn is_complete(&self) -> bool {
        matches!(self.status, StepStatus::Finished | StepStatus::Failed)
    }

    fn pending(&self) -> usize {
        self.groups
            .get(self.current_group..)
            .map(|rest| rest.iter().map(|g| g.size() - g.size_run()).sum())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{center_simulation, experiment, fake_scheduler, scans, KA_PATH, NU_PATH};
    use kr_types::KrError;

    fn step(targets: &[&str], config: StepConfig) -> OptimizerStep {
        let experiments: Vec<Arc<Experiment>> =
            targets.iter().map(|t| Arc::new(experiment(t))).collect();
        let starting_points = targets
            .iter()
            .map(|t| Arc::new(center_simulation().with_source_experiment(*t)))
            .collect();
        OptimizerStep::new("step 0", experiments, starting_points, scans(5, 5), None, config).unwrap()
    }

    fn run(step: &mut OptimizerStep, dir: &std::path::Path) -> usize {
        let (scheduler, calls) = fake_scheduler(dir);
        step.run(&scheduler).unwrap();
        step.wait(&scheduler, Some(Duration::from_secs(60))).unwrap();
        calls.load(std::sync::atomic::Ordering::SeqCst)
    }

    #[test]
    fn construction_validates_inputs() {
        let exp = Arc::new(experiment("Run_1"));
        let sp = Arc::new(center_simulation());

        let err = OptimizerStep::new("s", vec![], vec![], scans(2, 2), None, StepConfig::default());
        assert!(matches!(err, Err(KrError::Config(_))));

        let mut no_output = experiment("Run_2");
        no_output.output = None;
        let err = OptimizerStep::new(
            "s",
            vec![Arc::new(no_output)],
            vec![Arc::clone(&sp)],
            scans(2, 2),
            None,
            StepConfig::default(),
        );
        assert!(matches!(err, Err(KrError::Data(DataError::NoOutput { .. }))));

        let err = OptimizerStep::new(
            "s",
            vec![Arc::clone(&exp)],
            vec![Arc::clone(&sp), Arc::clone(&sp)],
            scans(2, 2),
            None,
            StepConfig::default(),
        );
        assert!(err.is_err());

        let err = OptimizerStep::new(
            "s",
            vec![Arc::clone(&exp)],
            vec![Arc::clone(&sp)],
            scans(2, 2),
            Some(vec!["Z".into()]),
            StepConfig::default(),
        );
        assert!(matches!(err, Err(KrError::Lookup(LookupError::Component { .. }))));
    }

    #[test]
    fn size_is_known_before_running() {
        let step = step(&["Run_1", "Run_2"], StepConfig::default());
        assert_eq!(step.size(), 50);
        assert_eq!(step.size_run(), 0);
        assert_eq!(step.status(), StepStatus::Created);
    }

    #[test]
    fn grid_optimum_recovers_each_component() {
        let dir = tempfile::tempdir().unwrap();
        let mut step = step(&["Run_1"], StepConfig::default());
        assert_eq!(run(&mut step, dir.path()), 25);
        assert!(step.is_finished());
        assert!(step.run_duration().is_some());

        let ka = ParamPath::parse(KA_PATH).unwrap();
        let nu = ParamPath::parse(NU_PATH).unwrap();
        assert!((step.optimal_value_for_comp("A", &ka).unwrap() - 1.0).abs() < 1e-9);
        assert!((step.optimal_value_for_comp("A", &nu).unwrap() - 3.0).abs() < 1e-9);
        assert!((step.optimal_value_for_comp("B", &ka).unwrap() - 10.0).abs() < 1e-9);
        assert!((step.optimal_value_for_comp("B", &nu).unwrap() - 5.0).abs() < 1e-9);

        let table = step.cost_data().unwrap();
        assert_eq!(table.num_rows(), 25);
        assert_eq!(
            table.columns(),
            &[KA_PATH.to_string(), NU_PATH.to_string(), "A".into(), "B".into(), ALL_COST_COL.into()]
        );
    }

    #[test]
    fn best_simulations_come_back_materialized() {
        let dir = tempfile::tempdir().unwrap();
        let mut step = step(&["Run_1"], StepConfig::default());
        run(&mut step, dir.path());

        let best = step.get_optimal_sims("Run_1", 3).unwrap();
        assert_eq!(best.len(), 3);
        assert!(best.iter().all(|s| s.load().unwrap().is_some()));
        let refs = step.optimal_simulation_for_comp("A").unwrap();
        let sim = step.simulation(refs[0]).unwrap();
        assert!((sim.model.binding_model.sma_ka[1] - 1.0).abs() < 1e-9);
        assert!(step.get_optimal_sims("Run_9", 1).is_err());
    }

    #[test]
    fn costs_aggregate_across_targets_and_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let config = StepConfig::default().with_group_max_size(10);
        let mut step = step(&["Run_1", "Run_2"], config);
        assert_eq!(run(&mut step, dir.path()), 50);
        assert_eq!(step.groups().len(), 6);

        let single = step.target_cost_data("Run_1").unwrap();
        let total = step.cost_data().unwrap();
        for r in 0..total.num_rows() {
            let a = single.get(r, ALL_COST_COL).unwrap();
            let sum = total.get(r, ALL_COST_COL).unwrap();
            assert!((sum - 2.0 * a).abs() < 1e-9 * sum.abs().max(1.0));
        }
    }

    #[test]
    fn mean_aggregation_matches_single_target() {
        let dir = tempfile::tempdir().unwrap();
        let config = StepConfig::default().with_aggregation(CostAggregation::Mean);
        let mut step = step(&["Run_1", "Run_2"], config);
        run(&mut step, dir.path());
        let single = step.target_cost_data("Run_2").unwrap().column("A").unwrap();
        let mean = step.cost_data().unwrap().column("A").unwrap();
        for (s, m) in single.iter().zip(&mean) {
            assert!((s - m).abs() < 1e-9 * s.abs().max(1.0));
        }
    }

    #[test]
    fn reweighting_changes_costs_without_rerunning() {
        let dir = tempfile::tempdir().unwrap();
        let mut step = step(&["Run_1"], StepConfig::default());
        run(&mut step, dir.path());
        let before = step.cost_data().unwrap().column(ALL_COST_COL).unwrap();

        step.recompute_costs_for_weights(CostWeights::new(0.0, 1.0, 0.0)).unwrap();
        let after = step.cost_data().unwrap().column(ALL_COST_COL).unwrap();
        assert_ne!(before, after);
        // All peaks share the same height.
        assert!(after.iter().all(|v| v.abs() < 1e-6));
        assert!(step
            .recompute_costs_for_weights(CostWeights::new(0.0, 0.0, 0.0))
            .is_err());
    }

    #[test]
    fn running_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut step = step(&["Run_1"], StepConfig::default());
        run(&mut step, dir.path());
        let (scheduler, _) = fake_scheduler(dir.path());
        assert!(step.run(&scheduler).is_err());
    }

    #[test]
    fn step_fails_when_no_variant_can_be_scored() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, calls) = fake_scheduler(dir.path());
        // Non-positive sma_nu makes every solver call fail.
        let scans = vec![ParameterScan::parse(NU_PATH, -1.0, 0.0, 2, kr_scan::Spacing::Linear).unwrap()];
        let mut step = OptimizerStep::new(
            "step 0",
            vec![Arc::new(experiment("Run_1"))],
            vec![Arc::new(center_simulation())],
            scans,
            None,
            StepConfig::default(),
        )
        .unwrap();

        step.run(&scheduler).unwrap();
        let err = step.wait(&scheduler, Some(Duration::from_secs(30))).unwrap_err();
        assert!(matches!(err, KrError::Data(DataError::InsufficientData { .. })));
        assert_eq!(step.status(), StepStatus::Failed);
        assert!(step.cost_data().is_none());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        // A failed step counts as settled for the scheduler.
        step.wait(&scheduler, Some(Duration::from_secs(1))).unwrap();
    }

    #[test]
    fn aggregation_skips_nan_components_only() {
        assert_eq!(CostAggregation::Sum.combine_available(&[1.0, f64::NAN, 2.0]), 3.0);
        assert_eq!(CostAggregation::Mean.combine_available(&[1.0, f64::NAN, 3.0]), 2.0);
        assert!(CostAggregation::Sum.combine_available(&[f64::NAN]).is_nan());
        assert!(CostAggregation::Sum.combine(&[1.0, f64::NAN]).is_nan());
    }
}
