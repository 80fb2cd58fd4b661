//! Kromatic optimizer: simulation groups, cost scoring and multi-step
//! optimizers built on the scan expander and the job scheduler.

pub mod constant_step;
pub mod cost;
pub mod export;
pub mod group;
pub mod optimizer;
pub mod refine;
pub mod step;

#[cfg(test)]
mod test_support;

pub use constant_step::ConstantStepConfig;
pub use cost::{CostFunctionConfig, CostWeights, PeakShapeCostFunction, ShapeMetrics};
pub use export::{export_group, export_optimizer, write_table_csv};
pub use group::{build_groups, GroupOptions, GroupStatus, SimulationGroup};
pub use optimizer::{Optimizer, OptimizerConfig, OptimizerKind, OptimizerStatus};
pub use refine::{refined_range, refined_scan, RefiningConfig, RefiningSpacing};
pub use step::{CostAggregation, OptimizerStep, SimRef, StepConfig, StepStatus, ALL_COST_COL};
