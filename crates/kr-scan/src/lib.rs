//! # kr-scan
//!
//! Parameter scan descriptions and their expansion into simulation diffs.
//!
//! Regular scans sample `[low, high]` on a linear or log grid and expand into
//! a cross product; random scans draw from a distribution and expand into a
//! Monte-Carlo sample of a fixed size.

mod expander;
mod random;
mod scan;

pub use expander::{grid_diffs, random_diffs, random_diffs_with_rng, GroupType, ScanRequest};
pub use random::{DependentParameter, RandomParameterScan, SamplingDistribution};
pub use scan::{ParameterScan, ParameterScanDef, Spacing};
