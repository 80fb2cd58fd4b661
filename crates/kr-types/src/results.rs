//! Solver outputs and experimental reference data.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::Product;

/// Key of the total UV absorbance curve in continuous data maps.
pub const UV_CURVE: &str = "uv";

/// A sampled curve (time or volume on x, signal on y).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XYData {
    pub name: String,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

impl XYData {
    pub fn new(name: impl Into<String>, x: Vec<f64>, y: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            x,
            y,
        }
    }

    pub fn len(&self) -> usize {
        self.x.len().min(self.y.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pooling performance of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceData {
    /// Pool volume in column volumes.
    pub pool_volume: f64,
    /// Step yield in percent.
    pub step_yield: f64,
    /// Pool concentration in g/L.
    pub pool_concentration: f64,
    /// Purity per component name, in percent.
    pub purities: BTreeMap<String, f64>,
}

/// Everything a successful solver run produces.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SimulationResults {
    /// Per-component chromatograms plus the optional [`UV_CURVE`].
    pub continuous_data: BTreeMap<String, XYData>,
    pub performance: Option<PerformanceData>,
}

/// Measured data of an experiment.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExperimentOutput {
    /// Fraction assays per component name.
    pub fraction_data: BTreeMap<String, XYData>,
    /// Continuous detector traces, including [`UV_CURVE`].
    pub continuous_data: BTreeMap<String, XYData>,
}

/// A reference experiment that simulations are scored against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub name: String,
    pub product: Product,
    pub output: Option<ExperimentOutput>,
}

impl Experiment {
    pub fn has_output(&self) -> bool {
        self.output.is_some()
    }
}

/// A scalar performance figure extracted from a run into result tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PerformanceMetric {
    PoolVolume,
    StepYield,
    PoolConcentration,
    Purity(String),
}

impl PerformanceMetric {
    /// Standard metric set for a product: pool figures then one purity per component.
    pub fn standard_set(product: &Product) -> Vec<PerformanceMetric> {
        let mut metrics = vec![
            PerformanceMetric::PoolVolume,
            PerformanceMetric::StepYield,
            PerformanceMetric::PoolConcentration,
        ];
        metrics.extend(
            product
                .component_names
                .iter()
                .map(|c| PerformanceMetric::Purity(c.clone())),
        );
        metrics
    }

    /// Column label used in result tables.
    pub fn label(&self) -> String {
        match self {
            Self::PoolVolume => "pool_volume (CV)".to_string(),
            Self::StepYield => "step_yield (%)".to_string(),
            Self::PoolConcentration => "pool_concentration (g/L)".to_string(),
            Self::Purity(comp) => format!("purity: {comp} (%)"),
        }
    }

    /// Value of the metric, NaN when the run carries no performance data.
    pub fn extract(&self, results: &SimulationResults) -> f64 {
        let Some(perf) = results.performance.as_ref() else {
            return f64::NAN;
        };
        match self {
            Self::PoolVolume => perf.pool_volume,
            Self::StepYield => perf.step_yield,
            Self::PoolConcentration => perf.pool_concentration,
            Self::Purity(comp) => perf.purities.get(comp).copied().unwrap_or(f64::NAN),
        }
    }
}
