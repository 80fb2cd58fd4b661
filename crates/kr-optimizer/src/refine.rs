//! Narrowing of scan ranges around a best value.

use serde::{Deserialize, Serialize};
use tracing::warn;

use kr_scan::{ParameterScan, Spacing};
use kr_types::{config_error, KrResult, LookupError, ParamPath};

/// Spacing of refined scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RefiningSpacing {
    /// Linear when the range is narrow or touches zero, log otherwise.
    #[default]
    Best,
    Linear,
    Log,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefiningConfig {
    /// Percentage of the distance to each neighbour kept around the best value.
    pub refining_factor: f64,
    pub num_values: usize,
    #[serde(default)]
    pub spacing: RefiningSpacing,
}

impl Default for RefiningConfig {
    fn default() -> Self {
        Self {
            refining_factor: 10.0,
            num_values: 5,
            spacing: RefiningSpacing::Best,
        }
    }
}

impl RefiningConfig {
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.refining_factor = factor;
        self
    }

    pub fn with_num_values(mut self, num_values: usize) -> Self {
        self.num_values = num_values;
        self
    }

    pub fn with_spacing(mut self, spacing: RefiningSpacing) -> Self {
        self.spacing = spacing;
        self
    }

    pub fn validate(&self) -> KrResult<()> {
        if !(1.0..=100.0).contains(&self.refining_factor) {
            return Err(config_error!(
                "Refining factor must be within [1, 100], got {}",
                self.refining_factor
            ));
        }
        if self.num_values == 0 {
            return Err(config_error!("Refined scans need at least one value"));
        }
        Ok(())
    }
}

fn same_value(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(f64::MIN_POSITIVE)
}

/// Range to rescan around `best`, one of the sorted `values` of a previous
/// scan.
///
/// The range extends towards each neighbour of `best` by `factor` percent of
/// the distance to it. At an edge of the grid the missing side mirrors the
/// available one; a single-value grid uses `|best|` (or 1 when `best` is 0)
/// as the distance on both sides.
pub fn refined_range(values: &[f64], best: f64, factor: f64) -> KrResult<(f64, f64)> {
    let index = values
        .iter()
        .position(|v| same_value(*v, best))
        .ok_or_else(|| LookupError::ScannedValue {
            parameter: format!("{:?}", values),
            value: best,
        })?;

    let below = index.checked_sub(1).map(|i| best - values[i]);
    let above = values.get(index + 1).map(|v| v - best);
    let (dm, dp) = match (below, above) {
        (Some(dm), Some(dp)) => (dm, dp),
        (Some(d), None) | (None, Some(d)) => {
            warn!(
                "Best value {} lies on the edge of the scanned range [{}, {}]",
                best,
                values[0],
                values[values.len() - 1]
            );
            (d, d)
        }
        (None, None) => {
            let d = if best == 0.0 { 1.0 } else { best.abs() };
            (d, d)
        }
    };

    Ok((best - dm * factor / 100.0, best + dp * factor / 100.0))
}

/// Scan of `path` narrowed around `best`, one of the `values` it was last
/// scanned with.
pub fn refined_scan(
    path: ParamPath,
    values: &[f64],
    best: f64,
    config: &RefiningConfig,
) -> KrResult<ParameterScan> {
    config.validate()?;
    let (low, high) = refined_range(values, best, config.refining_factor)?;
    let spacing = match config.spacing {
        RefiningSpacing::Linear => Spacing::Linear,
        RefiningSpacing::Log if low > 0.0 => Spacing::Log,
        RefiningSpacing::Log => {
            warn!("Refined range of {} reaches {}; scanning linearly", path, low);
            Spacing::Linear
        }
        RefiningSpacing::Best if low <= 0.0 || high / low < 100.0 => Spacing::Linear,
        RefiningSpacing::Best => Spacing::Log,
    };
    ParameterScan::new(path, low, high, config.num_values, spacing)
}
