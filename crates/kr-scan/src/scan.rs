//! Regular parameter scans.

use serde::{Deserialize, Serialize};

use kr_types::{config_error, KrError, KrResult, ParamPath, Simulation};

/// How values are placed between `low` and `high`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Spacing {
    #[default]
    Linear,
    /// Evenly spaced in log10 space; both bounds must be positive.
    Log,
}

/// A regularly spaced, ascending sweep of one parameter, optionally dragging
/// other parameters along in lockstep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ParameterScanDef", into = "ParameterScanDef")]
pub struct ParameterScan {
    name: ParamPath,
    low: f64,
    high: f64,
    num_values: usize,
    spacing: Spacing,
    parallel_parameters: Vec<ParameterScan>,
}

/// Unvalidated serialized form of a [`ParameterScan`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterScanDef {
    pub name: String,
    pub low: f64,
    pub high: f64,
    #[serde(default = "default_num_values")]
    pub num_values: usize,
    #[serde(default)]
    pub spacing: Spacing,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parallel_parameters: Vec<ParameterScanDef>,
}

fn default_num_values() -> usize {
    5
}

impl ParameterScan {
    pub fn new(
        name: ParamPath,
        low: f64,
        high: f64,
        num_values: usize,
        spacing: Spacing,
    ) -> KrResult<Self> {
        if num_values == 0 {
            return Err(config_error!("Scan of {} needs at least one value", name));
        }
        if !low.is_finite() || !high.is_finite() {
            return Err(config_error!(
                "Scan of {} has non-finite bounds [{}, {}]",
                name,
                low,
                high
            ));
        }
        if low > high {
            return Err(config_error!(
                "Scan of {} has low bound {} above high bound {}",
                name,
                low,
                high
            ));
        }
        if spacing == Spacing::Log && (low <= 0.0 || high <= 0.0) {
            return Err(config_error!(
                "Log scan of {} needs positive bounds, got [{}, {}]",
                name,
                low,
                high
            ));
        }
        Ok(Self {
            name,
            low,
            high,
            num_values,
            spacing,
            parallel_parameters: Vec::new(),
        })
    }

    /// Shorthand taking the path as a string.
    pub fn parse(
        name: &str,
        low: f64,
        high: f64,
        num_values: usize,
        spacing: Spacing,
    ) -> KrResult<Self> {
        Self::new(ParamPath::parse(name)?, low, high, num_values, spacing)
    }

    /// Linear scan over `center ± relative_range * center`.
    pub fn around_center(
        name: ParamPath,
        center: f64,
        relative_range: f64,
        num_values: usize,
    ) -> KrResult<Self> {
        if relative_range < 0.0 {
            return Err(config_error!("Relative range must be non-negative"));
        }
        let delta = (center * relative_range).abs();
        Self::new(name, center - delta, center + delta, num_values, Spacing::Linear)
    }

    /// Attach a scan that varies in lockstep with this one.
    pub fn with_parallel(mut self, parallel: ParameterScan) -> KrResult<Self> {
        if parallel.num_values != self.num_values {
            return Err(config_error!(
                "Parallel scan {} has {} values, {} has {}",
                parallel.name,
                parallel.num_values,
                self.name,
                self.num_values
            ));
        }
        if !parallel.parallel_parameters.is_empty() {
            return Err(config_error!(
                "Parallel scan {} cannot carry parallel scans of its own",
                parallel.name
            ));
        }
        self.parallel_parameters.push(parallel);
        Ok(self)
    }

    pub fn name(&self) -> &ParamPath {
        &self.name
    }

    pub fn low(&self) -> f64 {
        self.low
    }

    pub fn high(&self) -> f64 {
        self.high
    }

    pub fn num_values(&self) -> usize {
        self.num_values
    }

    pub fn spacing(&self) -> Spacing {
        self.spacing
    }

    pub fn parallel_parameters(&self) -> &[ParameterScan] {
        &self.parallel_parameters
    }

    /// Change the value count here and on every parallel scan.
    pub fn set_num_values(&mut self, num_values: usize) -> KrResult<()> {
        if num_values == 0 {
            return Err(config_error!("Scan of {} needs at least one value", self.name));
        }
        self.num_values = num_values;
        for parallel in &mut self.parallel_parameters {
            parallel.num_values = num_values;
        }
        Ok(())
    }

    /// The values this scan visits, endpoints included.
    pub fn scanned_values(&self) -> Vec<f64> {
        let n = self.num_values;
        if n == 1 {
            return vec![self.low];
        }
        let (start, stop) = match self.spacing {
            Spacing::Linear => (self.low, self.high),
            Spacing::Log => (self.low.log10(), self.high.log10()),
        };
        let step = (stop - start) / (n - 1) as f64;
        let mut values: Vec<f64> = (0..n)
            .map(|i| {
                let v = start + step * i as f64;
                match self.spacing {
                    Spacing::Linear => v,
                    Spacing::Log => 10f64.powf(v),
                }
            })
            .collect();
        values[0] = self.low;
        values[n - 1] = self.high;
        values
    }

    /// This scan's path followed by its parallel scans' paths.
    pub fn scanned_paths(&self) -> Vec<&ParamPath> {
        std::iter::once(&self.name)
            .chain(self.parallel_parameters.iter().map(|p| &p.name))
            .collect()
    }

    /// Check every path of this scan addresses a numeric slot of `center`.
    pub fn validate_against(&self, center: &Simulation) -> KrResult<()> {
        for path in self.scanned_paths() {
            path.validate(&center.model)?;
        }
        Ok(())
    }
}

impl TryFrom<ParameterScanDef> for ParameterScan {
    type Error = KrError;

    fn try_from(def: ParameterScanDef) -> Result<Self, Self::Error> {
        let mut scan = ParameterScan::parse(
            &def.name,
            def.low,
            def.high,
            def.num_values,
            def.spacing,
        )?;
        for parallel in def.parallel_parameters {
            scan = scan.with_parallel(ParameterScan::try_from(parallel)?)?;
        }
        Ok(scan)
    }
}

impl From<ParameterScan> for ParameterScanDef {
    fn from(scan: ParameterScan) -> Self {
        Self {
            name: scan.name.to_string(),
            low: scan.low,
            high: scan.high,
            num_values: scan.num_values,
            spacing: scan.spacing,
            parallel_parameters: scan
                .parallel_parameters
                .into_iter()
                .map(ParameterScanDef::from)
                .collect(),
        }
    }
}
