//! Peak-shape cost function.
//!
//! Every component peak is summarized by its timing, height and trailing
//! slope. A variant's cost for a component is the weighted sum of the
//! relative errors of those three metrics against the target experiments'
//! averages, scaled by 100.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use kr_types::{
    config_error, internal_error, DataError, DataTable, Experiment, KrResult, SimulationResults,
    XYData, UV_CURVE,
};

use super::calcs::{peak_height, peak_timing, trailing_slope};

/// Relative importance of the three peak metrics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostWeights {
    pub peak_time: f64,
    pub peak_height: f64,
    pub trailing_slope: f64,
}

impl Default for CostWeights {
    fn default() -> Self {
        Self {
            peak_time: 10.0,
            peak_height: 5.0,
            trailing_slope: 0.5,
        }
    }
}

impl CostWeights {
    pub fn new(peak_time: f64, peak_height: f64, trailing_slope: f64) -> Self {
        Self {
            peak_time,
            peak_height,
            trailing_slope,
        }
    }

    /// Weights scaled to sum to 1.
    pub fn normalized(&self) -> KrResult<[f64; 3]> {
        let w = [self.peak_time, self.peak_height, self.trailing_slope];
        if w.iter().any(|v| *v < 0.0 || !v.is_finite()) {
            return Err(config_error!("Cost weights must be finite and non-negative: {:?}", w));
        }
        let total: f64 = w.iter().sum();
        if total <= 0.0 {
            return Err(config_error!("Cost weights sum to zero"));
        }
        Ok(w.map(|v| v / total))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostFunctionConfig {
    #[serde(default)]
    pub weights: CostWeights,
    /// Fraction of the peak maximum ending the trailing-slope window.
    pub low_trigger_fraction: f64,
    /// Fraction of the peak maximum starting the trailing-slope window.
    pub high_trigger_fraction: f64,
    /// Fall back to the UV trace when a target lacks fraction data.
    pub use_uv_for_cost: bool,
}

impl Default for CostFunctionConfig {
    fn default() -> Self {
        Self {
            weights: CostWeights::default(),
            low_trigger_fraction: 0.2,
            high_trigger_fraction: 0.8,
            use_uv_for_cost: false,
        }
    }
}

impl CostFunctionConfig {
    pub fn with_weights(mut self, weights: CostWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_uv_fallback(mut self, enabled: bool) -> Self {
        self.use_uv_for_cost = enabled;
        self
    }
}

/// Timing, height and trailing slope of one peak.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapeMetrics {
    pub peak_time: f64,
    pub peak_height: f64,
    pub trailing_slope: f64,
}

impl ShapeMetrics {
    pub const NAN: ShapeMetrics = ShapeMetrics {
        peak_time: f64::NAN,
        peak_height: f64::NAN,
        trailing_slope: f64::NAN,
    };

    pub fn measure(curve: &XYData, low_frac: f64, high_frac: f64) -> Self {
        Self {
            peak_time: peak_timing(&curve.x, &curve.y),
            peak_height: peak_height(&curve.y),
            trailing_slope: trailing_slope(&curve.x, &curve.y, low_frac, high_frac),
        }
    }

    fn as_array(&self) -> [f64; 3] {
        [self.peak_time, self.peak_height, self.trailing_slope]
    }

    fn mean(items: &[ShapeMetrics]) -> ShapeMetrics {
        let n = items.len() as f64;
        let sum = items.iter().fold([0.0; 3], |acc, m| {
            let a = m.as_array();
            [acc[0] + a[0], acc[1] + a[1], acc[2] + a[2]]
        });
        ShapeMetrics {
            peak_time: sum[0] / n,
            peak_height: sum[1] / n,
            trailing_slope: sum[2] / n,
        }
    }
}

/// Scores variants against target experiments, per component.
///
/// Metrics are cached after [`PeakShapeCostFunction::evaluate`] so costs can
/// be recomputed for new weights without touching the outputs again.
#[derive(Debug, Clone)]
pub struct PeakShapeCostFunction {
    config: CostFunctionConfig,
    target_components: Vec<String>,
    reference: Option<Vec<ShapeMetrics>>,
    sim_names: Vec<String>,
    sim_metrics: Vec<Vec<ShapeMetrics>>,
}

impl PeakShapeCostFunction {
    pub fn new(config: CostFunctionConfig, target_components: Vec<String>) -> Self {
        Self {
            config,
            target_components,
            reference: None,
            sim_names: Vec::new(),
            sim_metrics: Vec::new(),
        }
    }

    pub fn config(&self) -> &CostFunctionConfig {
        &self.config
    }

    pub fn target_components(&self) -> &[String] {
        &self.target_components
    }

    /// Measure targets and variant outputs, then compute the cost table
    /// (one row per variant, one column per target component).
    ///
    /// `outputs[i]` is `None` for variants without results; their costs are NaN.
    pub fn evaluate(
        &mut self,
        sim_names: &[String],
        outputs: &[Option<Arc<SimulationResults>>],
        targets: &[&Experiment],
    ) -> KrResult<DataTable> {
        if sim_names.len() != outputs.len() {
            return Err(internal_error!(
                "{} simulation name(s) for {} output(s)",
                sim_names.len(),
                outputs.len()
            ));
        }
        if targets.is_empty() {
            return Err(config_error!("Cost function needs at least one target"));
        }

        let mut per_target = Vec::with_capacity(targets.len());
        for target in targets {
            per_target.push(self.target_metrics(target)?);
        }
        let reference: Vec<ShapeMetrics> = (0..self.target_components.len())
            .map(|c| {
                let column: Vec<ShapeMetrics> = per_target.iter().map(|t| t[c]).collect();
                ShapeMetrics::mean(&column)
            })
            .collect();

        let (low, high) = (
            self.config.low_trigger_fraction,
            self.config.high_trigger_fraction,
        );
        let components = &self.target_components;
        let sim_metrics: Vec<Vec<ShapeMetrics>> = outputs
            .par_iter()
            .map(|output| {
                components
                    .iter()
                    .map(|comp| {
                        output
                            .as_ref()
                            .and_then(|r| r.continuous_data.get(comp))
                            .map(|curve| ShapeMetrics::measure(curve, low, high))
                            .unwrap_or(ShapeMetrics::NAN)
                    })
                    .collect()
            })
            .collect();

        debug!(
            "Measured {} simulation(s) against {} target(s)",
            sim_metrics.len(),
            targets.len()
        );
        self.reference = Some(reference);
        self.sim_names = sim_names.to_vec();
        self.sim_metrics = sim_metrics;
        self.compute_costs()
    }

    fn target_metrics(&self, target: &Experiment) -> KrResult<Vec<ShapeMetrics>> {
        let output = target.output.as_ref().ok_or_else(|| DataError::NoOutput {
            experiment: target.name.clone(),
        })?;
        self.target_components
            .iter()
            .map(|comp| -> KrResult<ShapeMetrics> {
                let curve = match output.fraction_data.get(comp) {
                    Some(curve) => curve,
                    None if self.config.use_uv_for_cost => {
                        output.continuous_data.get(UV_CURVE).ok_or_else(|| {
                            DataError::MissingCurve {
                                source_name: target.name.clone(),
                                component: comp.clone(),
                                curve: "UV".to_string(),
                            }
                        })?
                    }
                    None => {
                        return Err(DataError::MissingCurve {
                            source_name: target.name.clone(),
                            component: comp.clone(),
                            curve: "fraction".to_string(),
                        }
                        .into())
                    }
                };
                Ok(ShapeMetrics::measure(
                    curve,
                    self.config.low_trigger_fraction,
                    self.config.high_trigger_fraction,
                ))
            })
            .collect()
    }

    /// Cost table from the cached metrics and current weights.
    pub fn compute_costs(&self) -> KrResult<DataTable> {
        let reference = self
            .reference
            .as_ref()
            .ok_or_else(|| internal_error!("Cost function has not been evaluated yet"))?;
        let weights = self.config.weights.normalized()?;

        let mut table = DataTable::new(self.target_components.clone());
        let mut any_value = false;
        for (name, metrics) in self.sim_names.iter().zip(&self.sim_metrics) {
            let row: Vec<f64> = metrics
                .iter()
                .zip(reference)
                .map(|(sim, target)| component_cost(sim, target, &weights))
                .collect();
            any_value |= row.iter().any(|v| !v.is_nan());
            table.push_row(name.clone(), row)?;
        }

        if !any_value {
            return Err(DataError::InsufficientData {
                message: "No data found: every simulation cost is NaN".to_string(),
            }
            .into());
        }
        Ok(table)
    }

    /// Replace the weights and recompute from cached metrics.
    pub fn recompute(&mut self, weights: CostWeights) -> KrResult<DataTable> {
        weights.normalized()?;
        self.config.weights = weights;
        self.compute_costs()
    }
}

fn component_cost(sim: &ShapeMetrics, target: &ShapeMetrics, weights: &[f64; 3]) -> f64 {
    let mut total = 0.0;
    let mut seen = false;
    for ((s, t), w) in sim.as_array().iter().zip(target.as_array()).zip(weights) {
        let error = (s - t).abs() / t.abs();
        if error.is_finite() {
            total += error * w;
            seen = true;
        }
    }
    if seen {
        100.0 * total
    } else {
        f64::NAN
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kr_types::{ExperimentOutput, Product};
    use std::collections::BTreeMap;

    fn gaussian(name: &str, center: f64, height: f64, width: f64) -> XYData {
        let x: Vec<f64> = (0..600).map(|i| i as f64 * 0.1).collect();
        let y = x
            .iter()
            .map(|t| height * (-(t - center).powi(2) / (2.0 * width * width)).exp())
            .collect();
        XYData::new(name, x, y)
    }

    fn experiment(fractions: &[(&str, f64)], uv: bool) -> Experiment {
        let mut output = ExperimentOutput::default();
        for (comp, center) in fractions {
            output
                .fraction_data
                .insert(comp.to_string(), gaussian(comp, *center, 1.0, 1.5));
        }
        if uv {
            output
                .continuous_data
                .insert(UV_CURVE.to_string(), gaussian(UV_CURVE, 20.0, 2.0, 3.0));
        }
        Experiment {
            name: "Run_1".into(),
            product: Product::new("P", vec!["A".into(), "B".into()]),
            output: Some(output),
        }
    }

    fn sim_output(curves: &[(&str, f64)]) -> Option<Arc<SimulationResults>> {
        let mut continuous_data = BTreeMap::new();
        for (comp, center) in curves {
            continuous_data.insert(comp.to_string(), gaussian(comp, *center, 1.0, 1.5));
        }
        Some(Arc::new(SimulationResults {
            continuous_data,
            performance: None,
        }))
    }

    #[test]
    fn weights_normalize_to_one() {
        let w = CostWeights::default().normalized().unwrap();
        assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((w[0] - 10.0 / 15.5).abs() < 1e-12);
        assert!(CostWeights::new(0.0, 0.0, 0.0).normalized().is_err());
        assert!(CostWeights::new(-1.0, 2.0, 0.0).normalized().is_err());
    }

    #[test]
    fn perfect_match_costs_zero_and_shift_costs_more() {
        let exp = experiment(&[("A", 20.0), ("B", 30.0)], false);
        let mut cf = PeakShapeCostFunction::new(CostFunctionConfig::default(), vec!["A".into(), "B".into()]);
        let names = vec!["Sim 0".to_string(), "Sim 1".to_string()];
        let outputs = vec![
            sim_output(&[("A", 20.0), ("B", 30.0)]),
            sim_output(&[("A", 22.0), ("B", 30.0)]),
        ];
        let table = cf.evaluate(&names, &outputs, &[&exp]).unwrap();

        assert_eq!(table.columns(), &["A", "B"]);
        assert!(table.get(0, "A").unwrap().abs() < 1e-9);
        assert!(table.get(1, "A").unwrap() > 1.0);
        assert!(table.get(1, "B").unwrap().abs() < 1e-9);
    }

    #[test]
    fn missing_output_yields_nan_row() {
        let exp = experiment(&[("A", 20.0)], false);
        let mut cf = PeakShapeCostFunction::new(CostFunctionConfig::default(), vec!["A".into()]);
        let names = vec!["Sim 0".to_string(), "Sim 1".to_string()];
        let outputs = vec![sim_output(&[("A", 21.0)]), None];
        let table = cf.evaluate(&names, &outputs, &[&exp]).unwrap();
        assert!(!table.get(0, "A").unwrap().is_nan());
        assert!(table.get(1, "A").unwrap().is_nan());
    }

    #[test]
    fn all_nan_costs_are_an_error() {
        let exp = experiment(&[("A", 20.0)], false);
        let mut cf = PeakShapeCostFunction::new(CostFunctionConfig::default(), vec!["A".into()]);
        let err = cf
            .evaluate(&["Sim 0".to_string()], &[None], &[&exp])
            .unwrap_err();
        assert!(err.to_string().contains("No data found"));
    }

    #[test]
    fn missing_fraction_data_needs_uv_fallback() {
        let exp = experiment(&[("A", 20.0)], true);
        let components = vec!["A".to_string(), "B".to_string()];
        let names = vec!["Sim 0".to_string()];
        let outputs = vec![sim_output(&[("A", 20.0), ("B", 20.0)])];

        let mut strict = PeakShapeCostFunction::new(CostFunctionConfig::default(), components.clone());
        assert!(strict.evaluate(&names, &outputs, &[&exp]).is_err());

        let mut lenient = PeakShapeCostFunction::new(
            CostFunctionConfig::default().with_uv_fallback(true),
            components,
        );
        let table = lenient.evaluate(&names, &outputs, &[&exp]).unwrap();
        assert!(table.get(0, "B").unwrap() > 0.0);
    }

    #[test]
    fn recompute_uses_cached_metrics() {
        let exp = experiment(&[("A", 20.0)], false);
        let mut cf = PeakShapeCostFunction::new(CostFunctionConfig::default(), vec!["A".into()]);
        let names = vec!["Sim 0".to_string()];
        let outputs = vec![sim_output(&[("A", 24.0)])];
        let first = cf.evaluate(&names, &outputs, &[&exp]).unwrap();

        let height_only = cf.recompute(CostWeights::new(0.0, 1.0, 0.0)).unwrap();
        assert!(height_only.get(0, "A").unwrap().abs() < 1e-9);
        assert!(first.get(0, "A").unwrap() > 0.0);
        assert!(cf.recompute(CostWeights::new(0.0, 0.0, 0.0)).is_err());
    }

    #[test]
    fn targets_are_averaged() {
        let early = experiment(&[("A", 18.0)], false);
        let late = experiment(&[("A", 22.0)], false);
        let mut cf = PeakShapeCostFunction::new(
            CostFunctionConfig::default().with_weights(CostWeights::new(1.0, 0.0, 0.0)),
            vec!["A".into()],
        );
        let outputs = vec![sim_output(&[("A", 20.0)])];
        let table = cf
            .evaluate(&["Sim 0".to_string()], &outputs, &[&early, &late])
            .unwrap();
        assert!(table.get(0, "A").unwrap().abs() < 1e-9);
    }
}
