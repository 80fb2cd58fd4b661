//! Cost scoring of simulation outputs against reference experiments.

pub mod calcs;
mod function;

pub use function::{CostFunctionConfig, CostWeights, PeakShapeCostFunction, ShapeMetrics};
