//! Fixtures shared by the optimizer tests.
//!
//! The fake solver turns SMA parameters into one Gaussian peak per
//! component, so grid optima are known in closed form.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kr_scan::{ParameterScan, ScanRequest, Spacing};
use kr_solve::{FnSolver, JobScheduler, SchedulerConfig, SolverInput};
use kr_types::{
    validation_error, Column, Experiment, ExperimentOutput, Method, PerformanceData, ProcessModel,
    Product, Simulation, SimulationResults, XYData,
};

pub const KA_PATH: &str = "binding_model.sma_ka[1:]";
pub const NU_PATH: &str = "binding_model.sma_nu[1:]";

/// (ka, nu) of components A and B in the reference experiments.
pub const TRUTH: [(f64, f64); 2] = [(1.0, 3.0), (10.0, 5.0)];

pub fn product() -> Product {
    Product::new("P", vec!["A".into(), "B".into()])
}

pub fn center_simulation() -> Simulation {
    let model = ProcessModel::new(
        product(),
        Column {
            bed_height: 20.0,
            diameter: 1.0,
        },
        Method {
            name: "Gradient elution".into(),
            method_steps: Vec::new(),
            collection_criteria: None,
        },
    )
    .unwrap();
    Simulation::new("center", model).with_source_experiment("Run_1")
}

pub fn peak(name: &str, ka: f64, nu: f64) -> XYData {
    let center = 10.0 + 5.0 * ka.log10() + 2.0 * nu;
    let width = 1.0 + 0.1 * nu;
    let x: Vec<f64> = (0..600).map(|i| i as f64 * 0.1).collect();
    let y = x
        .iter()
        .map(|v| (-0.5 * ((v - center) / width).powi(2)).exp())
        .collect();
    XYData::new(name, x, y)
}

/// What the fake solver returns for `model`.
pub fn solve(model: &ProcessModel) -> kr_types::KrResult<SimulationResults> {
    let binding = &model.binding_model;
    let mut continuous_data = BTreeMap::new();
    let mut purities = BTreeMap::new();
    for (i, comp) in model.product.component_names.iter().enumerate() {
        let (ka, nu) = (binding.sma_ka[i + 1], binding.sma_nu[i + 1]);
        if nu <= 0.0 || ka <= 0.0 {
            return Err(validation_error!("Non-physical SMA parameters for {}", comp));
        }
        continuous_data.insert(comp.clone(), peak(comp, ka, nu));
        purities.insert(comp.clone(), 100.0 / (1.0 + nu));
    }
    Ok(SimulationResults {
        continuous_data,
        performance: Some(PerformanceData {
            pool_volume: 3.0,
            step_yield: 90.0 - binding.sma_nu[1],
            pool_concentration: 1.5,
            purities,
        }),
    })
}

pub fn experiment(name: &str) -> Experiment {
    let fraction_data = product()
        .component_names
        .iter()
        .zip(TRUTH)
        .map(|(comp, (ka, nu))| (comp.clone(), peak(comp, ka, nu)))
        .collect();
    Experiment {
        name: name.to_string(),
        product: product(),
        output: Some(ExperimentOutput {
            fraction_data,
            continuous_data: BTreeMap::new(),
        }),
    }
}

fn scheduler_with(dir: &Path, delay: Duration) -> (JobScheduler, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let config = SchedulerConfig::default()
        .with_work_dir(dir)
        .with_max_workers(2)
        .with_polling_period(Duration::from_millis(5));
    let solver = FnSolver::new(move |input: &SolverInput| {
        counter.fetch_add(1, Ordering::SeqCst);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        solve(&input.model)
    });
    let scheduler = JobScheduler::new(config, Arc::new(solver)).unwrap();
    (scheduler, calls)
}

/// Scheduler over the fake solver, with a count of solver invocations.
pub fn fake_scheduler(dir: &Path) -> (JobScheduler, Arc<AtomicUsize>) {
    scheduler_with(dir, Duration::ZERO)
}

pub fn slow_scheduler(dir: &Path, delay: Duration) -> (JobScheduler, Arc<AtomicUsize>) {
    scheduler_with(dir, delay)
}

/// ka on a log grid over [0.01, 100] and nu on a linear grid over [1, 9].
pub fn scans(ka_values: usize, nu_values: usize) -> Vec<ParameterScan> {
    vec![
        ParameterScan::parse(KA_PATH, 0.01, 100.0, ka_values, Spacing::Log).unwrap(),
        ParameterScan::parse(NU_PATH, 1.0, 9.0, nu_values, Spacing::Linear).unwrap(),
    ]
}

pub fn grid_request(ka_values: usize, nu_values: usize) -> ScanRequest {
    ScanRequest::Grid(scans(ka_values, nu_values))
}
