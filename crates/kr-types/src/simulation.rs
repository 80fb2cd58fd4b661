//! Simulations, parameter diffs and the output state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::{DataError, KrResult};
use crate::model::ProcessModel;
use crate::path::ParamPath;
use crate::results::SimulationResults;

/// Suffix of the structured input artifact handed to the solver.
pub const INPUT_SUFFIX: &str = "input.json";
/// Suffix of the structured output artifact written by the solver.
pub const OUTPUT_SUFFIX: &str = "output.json";

/// One parameter override: set the slot(s) at `path` to `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleParamDiff {
    pub path: ParamPath,
    pub value: f64,
}

impl SingleParamDiff {
    pub fn new(path: ParamPath, value: f64) -> Self {
        Self { path, value }
    }
}

/// Ordered list of overrides describing one variant relative to a center point.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SimulationDiff(Vec<SingleParamDiff>);

impl SimulationDiff {
    pub fn new(entries: Vec<SingleParamDiff>) -> Self {
        Self(entries)
    }

    pub fn entries(&self) -> &[SingleParamDiff] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &SingleParamDiff> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Value assigned to `path`, if this diff overrides it.
    pub fn value_for(&self, path: &ParamPath) -> Option<f64> {
        self.0.iter().find(|d| &d.path == path).map(|d| d.value)
    }

    /// Concatenation of `self` followed by `other`.
    pub fn extended(&self, other: &SimulationDiff) -> SimulationDiff {
        let mut entries = self.0.clone();
        entries.extend(other.0.iter().cloned());
        SimulationDiff(entries)
    }
}

impl FromIterator<SingleParamDiff> for SimulationDiff {
    fn from_iter<T: IntoIterator<Item = SingleParamDiff>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Location of a variant's solver artifacts, derived from its uuid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub uuid: Uuid,
    pub input: PathBuf,
    pub output: PathBuf,
}

impl ArtifactRef {
    pub fn in_dir(dir: &Path, uuid: Uuid) -> Self {
        Self {
            uuid,
            input: dir.join(format!("{uuid}.{INPUT_SUFFIX}")),
            output: dir.join(format!("{uuid}.{OUTPUT_SUFFIX}")),
        }
    }

    pub fn output_exists(&self) -> bool {
        self.output.is_file()
    }

    /// Parse the output artifact from disk.
    pub fn read_output(&self) -> KrResult<SimulationResults> {
        let bytes = std::fs::read(&self.output).map_err(|e| DataError::UnreadableArtifact {
            path: self.output.display().to_string(),
            message: e.to_string(),
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            DataError::UnreadableArtifact {
                path: self.output.display().to_string(),
                message: e.to_string(),
            }
            .into()
        })
    }
}

/// Run status of a single variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    NotRun,
    Submitted,
    Running,
    FinishedSuccess,
    FinishedFail,
}

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::FinishedSuccess | Self::FinishedFail)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotRun => "Not run",
            Self::Submitted => "Submitted",
            Self::Running => "Running...",
            Self::FinishedSuccess => "Run successfully",
            Self::FinishedFail => "Run failed",
        };
        f.write_str(label)
    }
}

/// Where a variant's results currently live.
#[derive(Debug, Clone)]
pub enum OutputState {
    NotRun,
    /// Results are on disk and read on every access.
    Unloaded(ArtifactRef),
    Loaded(Arc<SimulationResults>),
    /// The run succeeded but its artifacts were removed after ingestion.
    Deleted,
    Failed(String),
}

/// A model instance to run through the solver.
#[derive(Debug, Clone)]
pub struct Simulation {
    pub name: String,
    pub uuid: Uuid,
    pub model: ProcessModel,
    /// Experiment this simulation was built to reproduce.
    pub source_experiment: Option<String>,
    pub run_status: RunStatus,
    pub output: OutputState,
}

impl Simulation {
    pub fn new(name: impl Into<String>, model: ProcessModel) -> Self {
        Self {
            name: name.into(),
            uuid: Uuid::new_v4(),
            model,
            source_experiment: None,
            run_status: RunStatus::NotRun,
            output: OutputState::NotRun,
        }
    }

    pub fn with_source_experiment(mut self, experiment: impl Into<String>) -> Self {
        self.source_experiment = Some(experiment.into());
        self
    }

    /// Clone `center` under a fresh identity, reset to not-run, with `diff` applied in order.
    pub fn build_from(center: &Simulation, name: impl Into<String>, diff: &SimulationDiff) -> KrResult<Self> {
        let mut sim = Self {
            name: name.into(),
            uuid: Uuid::new_v4(),
            model: center.model.clone(),
            source_experiment: center.source_experiment.clone(),
            run_status: RunStatus::NotRun,
            output: OutputState::NotRun,
        };
        sim.apply_diff(diff)?;
        Ok(sim)
    }

    pub fn apply_diff(&mut self, diff: &SimulationDiff) -> KrResult<()> {
        for entry in diff.iter() {
            entry.path.assign(&mut self.model, entry.value)?;
        }
        Ok(())
    }

    /// Values currently held at `path`.
    pub fn value_of(&self, path: &ParamPath) -> KrResult<Vec<f64>> {
        path.resolve(&self.model)
    }

    pub fn has_run(&self) -> bool {
        self.run_status.is_finished()
    }

    pub fn mark_success(&mut self, output: OutputState) {
        self.run_status = RunStatus::FinishedSuccess;
        self.output = output;
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.run_status = RunStatus::FinishedFail;
        self.output = OutputState::Failed(reason.into());
    }

    /// Results of the run, read from disk when unloaded. `None` when the
    /// variant has not run, failed, or had its output deleted.
    pub fn load(&self) -> KrResult<Option<Arc<SimulationResults>>> {
        match &self.output {
            OutputState::Loaded(results) => Ok(Some(Arc::clone(results))),
            OutputState::Unloaded(artifact) => artifact.read_output().map(|r| Some(Arc::new(r))),
            OutputState::NotRun | OutputState::Deleted | OutputState::Failed(_) => Ok(None),
        }
    }

    /// Like [`Simulation::load`], but keeps the results resident afterwards.
    pub fn load_in_place(&mut self) -> KrResult<Option<Arc<SimulationResults>>> {
        let results = self.load()?;
        if let Some(results) = &results {
            self.output = OutputState::Loaded(Arc::clone(results));
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Column, Method, Product};

    fn center() -> Simulation {
        let product = Product::new("P", vec!["A".into()]);
        let method = Method {
            name: "m".into(),
            method_steps: Vec::new(),
            collection_criteria: None,
        };
        let column = Column {
            bed_height: 20.0,
            diameter: 1.0,
        };
        let model = ProcessModel::new(product, column, method).unwrap();
        Simulation::new("center", model).with_source_experiment("Run_1")
    }

    fn diff(entries: &[(&str, f64)]) -> SimulationDiff {
        entries
            .iter()
            .map(|(p, v)| SingleParamDiff::new(ParamPath::parse(p).unwrap(), *v))
            .collect()
    }

    #[test]
    fn build_from_resets_identity_and_applies_diff() {
        let mut c = center();
        c.run_status = RunStatus::FinishedSuccess;
        let d = diff(&[("binding_model.sma_ka[1]", 0.25), ("binding_model.sma_lambda", 500.0)]);

        let sim = Simulation::build_from(&c, "Sim 0_G", &d).unwrap();
        assert_ne!(sim.uuid, c.uuid);
        assert_eq!(sim.run_status, RunStatus::NotRun);
        assert!(matches!(sim.output, OutputState::NotRun));
        assert_eq!(sim.model.binding_model.sma_ka[1], 0.25);
        assert_eq!(sim.model.binding_model.sma_lambda, 500.0);
        assert_eq!(sim.source_experiment.as_deref(), Some("Run_1"));
        assert_eq!(c.model.binding_model.sma_ka[1], 1.0);
    }

    #[test]
    fn later_diff_entries_win() {
        let d = diff(&[("binding_model.sma_nu[1]", 2.0), ("binding_model.sma_nu[1:]", 4.0)]);
        let sim = Simulation::build_from(&center(), "s", &d).unwrap();
        assert_eq!(sim.model.binding_model.sma_nu[1], 4.0);
    }

    #[test]
    fn unknown_path_in_diff_fails() {
        let d = diff(&[("binding_model.sma_zz", 1.0)]);
        assert!(Simulation::build_from(&center(), "s", &d).is_err());
    }

    #[test]
    fn unloaded_output_is_read_on_each_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut sim = center();
        let artifact = ArtifactRef::in_dir(dir.path(), sim.uuid);
        assert!(artifact
            .input
            .to_string_lossy()
            .ends_with(&format!("{}.input.json", sim.uuid)));

        let results = SimulationResults::default();
        std::fs::write(&artifact.output, serde_json::to_vec(&results).unwrap()).unwrap();
        sim.mark_success(OutputState::Unloaded(artifact.clone()));

        assert!(sim.load().unwrap().is_some());
        assert!(matches!(sim.output, OutputState::Unloaded(_)));

        std::fs::remove_file(&artifact.output).unwrap();
        assert!(sim.load().is_err());
    }

    #[test]
    fn load_in_place_keeps_results_resident() {
        let dir = tempfile::tempdir().unwrap();
        let mut sim = center();
        let artifact = ArtifactRef::in_dir(dir.path(), sim.uuid);
        std::fs::write(
            &artifact.output,
            serde_json::to_vec(&SimulationResults::default()).unwrap(),
        )
        .unwrap();
        sim.mark_success(OutputState::Unloaded(artifact.clone()));

        sim.load_in_place().unwrap();
        std::fs::remove_file(&artifact.output).unwrap();
        assert!(matches!(sim.output, OutputState::Loaded(_)));
        assert!(sim.load().unwrap().is_some());
    }

    #[test]
    fn deleted_output_keeps_success_status() {
        let mut sim = center();
        sim.mark_success(OutputState::Deleted);
        assert!(sim.has_run());
        assert_eq!(sim.run_status, RunStatus::FinishedSuccess);
        assert!(sim.load().unwrap().is_none());
    }

    #[test]
    fn failed_run_loads_nothing() {
        let mut sim = center();
        sim.mark_failed("solver diverged");
        assert_eq!(sim.run_status.to_string(), "Run failed");
        assert!(sim.load().unwrap().is_none());
    }
}
