//! Expansion of scan descriptions into ordered lists of simulation diffs.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use kr_types::{
    config_error, KrError, KrResult, ParamPath, Simulation, SimulationDiff, SingleParamDiff,
};

use crate::random::RandomParameterScan;
use crate::scan::ParameterScan;

/// Kind of simulation group a scan request produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupType {
    MultiParamGrid,
    MonteCarlo,
}

impl fmt::Display for GroupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MultiParamGrid => f.write_str("Multi-Param Grid"),
            Self::MonteCarlo => f.write_str("Monte-Carlo Exploration"),
        }
    }
}

impl FromStr for GroupType {
    type Err = KrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "multi-param grid" | "grid" => Ok(Self::MultiParamGrid),
            "monte-carlo exploration" | "monte-carlo" | "montecarlo" => Ok(Self::MonteCarlo),
            other => Err(config_error!("Unsupported group type: {}", other)),
        }
    }
}

/// Scans to expand, together with how to expand them.
#[derive(Debug, Clone)]
pub enum ScanRequest {
    Grid(Vec<ParameterScan>),
    MonteCarlo {
        scans: Vec<RandomParameterScan>,
        group_size: usize,
        /// Fixed seed for reproducible draws; entropy-seeded when `None`.
        seed: Option<u64>,
    },
}

impl ScanRequest {
    pub fn group_type(&self) -> GroupType {
        match self {
            Self::Grid(_) => GroupType::MultiParamGrid,
            Self::MonteCarlo { .. } => GroupType::MonteCarlo,
        }
    }

    /// Paths written by every diff of this request, in diff order.
    pub fn scanned_paths(&self) -> Vec<ParamPath> {
        match self {
            Self::Grid(scans) => scans
                .iter()
                .flat_map(|s| s.scanned_paths().into_iter().cloned())
                .collect(),
            Self::MonteCarlo { scans, .. } => scans
                .iter()
                .flat_map(|s| {
                    std::iter::once(s.name.clone()).chain(s.dependents.iter().map(|d| d.path.clone()))
                })
                .collect(),
        }
    }

    pub fn validate_against(&self, center: &Simulation) -> KrResult<()> {
        match self {
            Self::Grid(scans) => scans.iter().try_for_each(|s| s.validate_against(center)),
            Self::MonteCarlo { scans, .. } => scans.iter().try_for_each(|s| s.validate_against(center)),
        }
    }

    pub fn expand(&self) -> KrResult<Vec<SimulationDiff>> {
        match self {
            Self::Grid(scans) => grid_diffs(scans),
            Self::MonteCarlo {
                scans,
                group_size,
                seed,
            } => random_diffs(scans, *group_size, *seed),
        }
    }
}

/// Cross product of all scans, first scan varying slowest.
///
/// Each scan together with its parallel scans forms one dimension whose
/// entries are the zipped values at the same index.
pub fn grid_diffs(scans: &[ParameterScan]) -> KrResult<Vec<SimulationDiff>> {
    if scans.is_empty() {
        return Ok(Vec::new());
    }

    let mut dimensions: Vec<Vec<Vec<SingleParamDiff>>> = Vec::with_capacity(scans.len());
    for scan in scans {
        let primary = scan.scanned_values();
        let mut columns = vec![(scan.name(), primary)];
        for parallel in scan.parallel_parameters() {
            let values = parallel.scanned_values();
            if values.len() != columns[0].1.len() {
                return Err(config_error!(
                    "Parallel scan {} has {} values, {} has {}",
                    parallel.name(),
                    values.len(),
                    scan.name(),
                    columns[0].1.len()
                ));
            }
            columns.push((parallel.name(), values));
        }

        let count = columns[0].1.len();
        let entries = (0..count)
            .map(|i| {
                columns
                    .iter()
                    .map(|(path, values)| SingleParamDiff::new((*path).clone(), values[i]))
                    .collect()
            })
            .collect();
        dimensions.push(entries);
    }

    let mut combos: Vec<Vec<SingleParamDiff>> = vec![Vec::new()];
    for dimension in &dimensions {
        let mut next = Vec::with_capacity(combos.len() * dimension.len());
        for prefix in &combos {
            for entry in dimension {
                let mut combo = prefix.clone();
                combo.extend(entry.iter().cloned());
                next.push(combo);
            }
        }
        combos = next;
    }

    debug!("Expanded {} scan(s) into {} grid diffs", scans.len(), combos.len());
    Ok(combos.into_iter().map(SimulationDiff::new).collect())
}

/// `group_size` independent draws of every random scan.
pub fn random_diffs(
    scans: &[RandomParameterScan],
    group_size: usize,
    seed: Option<u64>,
) -> KrResult<Vec<SimulationDiff>> {
    let mut rng = match seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_rng(&mut rand::rng()),
    };
    random_diffs_with_rng(scans, group_size, &mut rng)
}

/// Like [`random_diffs`], drawing from a caller-supplied generator.
///
/// Draws are taken variant by variant, scan by scan; each dependent value is
/// placed right after the draw it derives from.
pub fn random_diffs_with_rng<R: Rng + ?Sized>(
    scans: &[RandomParameterScan],
    group_size: usize,
    rng: &mut R,
) -> KrResult<Vec<SimulationDiff>> {
    if scans.is_empty() {
        return Ok(Vec::new());
    }

    let mut diffs = Vec::with_capacity(group_size);
    for _ in 0..group_size {
        let mut entries = Vec::new();
        for scan in scans {
            let value = scan.distribution.sample(rng)?;
            entries.push(SingleParamDiff::new(scan.name.clone(), value));
            for dep in &scan.dependents {
                entries.push(SingleParamDiff::new(dep.path.clone(), (dep.func)(value)));
            }
        }
        diffs.push(SimulationDiff::new(entries));
    }
    Ok(diffs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::SamplingDistribution;
    use crate::scan::Spacing;

    fn scan(path: &str, low: f64, high: f64, n: usize) -> ParameterScan {
        ParameterScan::parse(path, low, high, n, Spacing::Linear).unwrap()
    }

    fn values(diff: &SimulationDiff) -> Vec<f64> {
        diff.iter().map(|d| d.value).collect()
    }

    #[test]
    fn grid_count_is_product_of_dimensions() {
        let scans = vec![
            scan("binding_model.sma_ka[1]", 1.0, 3.0, 3),
            scan("binding_model.sma_nu[1]", 1.0, 2.0, 2),
            scan("binding_model.sma_sigma[1]", 5.0, 8.0, 4),
        ];
        let diffs = grid_diffs(&scans).unwrap();
        assert_eq!(diffs.len(), 24);
        assert!(diffs.iter().all(|d| d.len() == 3));
    }

    #[test]
    fn first_dimension_varies_slowest() {
        let scans = vec![
            scan("binding_model.sma_ka[1]", 1.0, 2.0, 2),
            scan("binding_model.sma_nu[1]", 10.0, 30.0, 3),
        ];
        let diffs = grid_diffs(&scans).unwrap();
        let got: Vec<Vec<f64>> = diffs.iter().map(values).collect();
        assert_eq!(
            got,
            vec![
                vec![1.0, 10.0],
                vec![1.0, 20.0],
                vec![1.0, 30.0],
                vec![2.0, 10.0],
                vec![2.0, 20.0],
                vec![2.0, 30.0],
            ]
        );
    }

    #[test]
    fn parallel_scans_form_one_dimension() {
        let primary = scan("binding_model.sma_ka[1]", 1.0, 2.0, 2)
            .with_parallel(scan("binding_model.sma_ka[2]", 5.0, 6.0, 2))
            .unwrap();
        let scans = vec![primary, scan("binding_model.sma_nu[1]", 1.0, 3.0, 3)];
        let diffs = grid_diffs(&scans).unwrap();
        assert_eq!(diffs.len(), 6);
        assert_eq!(values(&diffs[0]), vec![1.0, 5.0, 1.0]);
        assert_eq!(values(&diffs[5]), vec![2.0, 6.0, 3.0]);
    }

    #[test]
    fn empty_scan_list_expands_to_nothing() {
        assert!(grid_diffs(&[]).unwrap().is_empty());
        assert!(random_diffs(&[], 10, Some(1)).unwrap().is_empty());
    }

    #[test]
    fn seeded_random_diffs_are_reproducible() {
        let scans = vec![RandomParameterScan::new(
            ParamPath::parse("binding_model.sma_ka[1]").unwrap(),
            SamplingDistribution::Gaussian {
                mean: 1.0,
                std_dev: 0.1,
            },
        )
        .unwrap()];
        let a = random_diffs(&scans, 20, Some(42)).unwrap();
        let b = random_diffs(&scans, 20, Some(42)).unwrap();
        assert_eq!(a.len(), 20);
        assert_eq!(a, b);
    }

    #[test]
    fn dependents_follow_their_draw() {
        let scans = vec![RandomParameterScan::new(
            ParamPath::parse("binding_model.sma_ka[1]").unwrap(),
            SamplingDistribution::Uniform { low: 1.0, high: 2.0 },
        )
        .unwrap()
        .with_dependent(ParamPath::parse("binding_model.sma_kd[1]").unwrap(), |ka| ka * 1000.0)];

        let diffs = random_diffs(&scans, 5, Some(3)).unwrap();
        for diff in &diffs {
            let v = values(diff);
            assert_eq!(v.len(), 2);
            assert!((v[1] - v[0] * 1000.0).abs() < 1e-9);
        }
    }

    #[test]
    fn request_reports_type_and_paths() {
        let primary = scan("binding_model.sma_ka[1]", 1.0, 2.0, 2)
            .with_parallel(scan("binding_model.sma_ka[2]", 5.0, 6.0, 2))
            .unwrap();
        let request = ScanRequest::Grid(vec![primary]);
        assert_eq!(request.group_type(), GroupType::MultiParamGrid);
        assert_eq!(request.scanned_paths().len(), 2);
        assert_eq!(request.expand().unwrap().len(), 2);

        assert_eq!("Monte-Carlo Exploration".parse::<GroupType>().unwrap(), GroupType::MonteCarlo);
        assert!("Bayesian".parse::<GroupType>().is_err());
    }
}
