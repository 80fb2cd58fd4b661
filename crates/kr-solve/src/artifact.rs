//! On-disk solver artifacts, one input/output pair per variant uuid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use kr_types::{ArtifactRef, DataError, KrResult, ProcessModel, Simulation, SimulationResults};

/// Contents of an input artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverInput {
    pub simulation_name: String,
    pub uuid: Uuid,
    pub model: ProcessModel,
}

/// Directory holding solver artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (creating if needed) an artifact directory.
    pub fn new(root: impl Into<PathBuf>) -> KrResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// `<user cache dir>/kromatic/runs`, falling back to the system temp dir.
    pub fn default_root() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("kromatic")
            .join("runs")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_for(&self, uuid: Uuid) -> ArtifactRef {
        ArtifactRef::in_dir(&self.root, uuid)
    }

    /// Serialize `sim` into its input artifact.
    pub fn write_input(&self, sim: &Simulation) -> KrResult<ArtifactRef> {
        let artifact = self.artifact_for(sim.uuid);
        let input = SolverInput {
            simulation_name: sim.name.clone(),
            uuid: sim.uuid,
            model: sim.model.clone(),
        };
        std::fs::write(&artifact.input, serde_json::to_vec_pretty(&input)?)?;
        debug!("Wrote solver input {}", artifact.input.display());
        Ok(artifact)
    }

    pub fn read_input(artifact: &ArtifactRef) -> KrResult<SolverInput> {
        let bytes = std::fs::read(&artifact.input).map_err(|e| DataError::UnreadableArtifact {
            path: artifact.input.display().to_string(),
            message: e.to_string(),
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn write_output(artifact: &ArtifactRef, results: &SimulationResults) -> KrResult<()> {
        std::fs::write(&artifact.output, serde_json::to_vec(results)?)?;
        Ok(())
    }

    /// Delete both files of an artifact; files already gone are ignored.
    pub fn remove(artifact: &ArtifactRef) -> KrResult<()> {
        for path in [&artifact.input, &artifact.output] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kr_types::{Column, Method, Product};

    fn sim() -> Simulation {
        let model = ProcessModel::new(
            Product::new("P", vec!["A".into()]),
            Column {
                bed_height: 20.0,
                diameter: 1.0,
            },
            Method {
                name: "m".into(),
                method_steps: Vec::new(),
                collection_criteria: None,
            },
        )
        .unwrap();
        Simulation::new("Sim 0_G", model)
    }

    #[test]
    fn input_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("runs")).unwrap();
        let sim = sim();

        let artifact = store.write_input(&sim).unwrap();
        assert!(artifact.input.starts_with(store.root()));
        let input = ArtifactStore::read_input(&artifact).unwrap();
        assert_eq!(input.uuid, sim.uuid);
        assert_eq!(input.model, sim.model);
    }

    #[test]
    fn remove_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let artifact = store.write_input(&sim()).unwrap();
        ArtifactStore::write_output(&artifact, &SimulationResults::default()).unwrap();

        ArtifactStore::remove(&artifact).unwrap();
        assert!(!artifact.input.exists());
        assert!(!artifact.output_exists());
        ArtifactStore::remove(&artifact).unwrap();
    }
}
