//! Default binding-constant scans for an optimizer's first step.

use serde::{Deserialize, Serialize};
use tracing::warn;

use kr_scan::{ParameterScan, Spacing};
use kr_types::{config_error, KrResult, ParamPath, Product};

/// Which SMA families to scan, and over which ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstantStepConfig {
    pub scan_type: Spacing,
    pub scan_num_values: usize,
    pub scan_ka: bool,
    pub scan_nu: bool,
    pub scan_sigma: bool,
    pub ka_range: (f64, f64),
    pub nu_range: (f64, f64),
    pub sigma_range: (f64, f64),
}

impl Default for ConstantStepConfig {
    fn default() -> Self {
        Self {
            scan_type: Spacing::Log,
            scan_num_values: 5,
            scan_ka: true,
            scan_nu: true,
            scan_sigma: false,
            ka_range: (1e-8, 50.0),
            nu_range: (0.1, 20.0),
            sigma_range: (0.0, 100.0),
        }
    }
}

impl ConstantStepConfig {
    pub fn with_num_values(mut self, n: usize) -> Self {
        self.scan_num_values = n;
        self
    }

    pub fn with_scan_type(mut self, spacing: Spacing) -> Self {
        self.scan_type = spacing;
        self
    }

    pub fn with_families(mut self, ka: bool, nu: bool, sigma: bool) -> Self {
        self.scan_ka = ka;
        self.scan_nu = nu;
        self.scan_sigma = sigma;
        self
    }

    fn families(&self) -> Vec<(&'static str, (f64, f64))> {
        [
            (self.scan_ka, "sma_ka", self.ka_range),
            (self.scan_nu, "sma_nu", self.nu_range),
            (self.scan_sigma, "sma_sigma", self.sigma_range),
        ]
        .into_iter()
        .filter(|(enabled, _, _)| *enabled)
        .map(|(_, family, range)| (family, range))
        .collect()
    }

    /// One scan per enabled family, covering the targeted components.
    ///
    /// With every component targeted a family is scanned as one slice over
    /// all components. Otherwise the first targeted component is scanned and
    /// the others follow it in parallel.
    pub fn parameter_list(
        &self,
        product: &Product,
        target_components: &[String],
    ) -> KrResult<Vec<ParameterScan>> {
        let families = self.families();
        if families.is_empty() {
            return Err(config_error!("No binding parameter family selected for scanning"));
        }
        if target_components.is_empty() {
            return Err(config_error!("No target component to scan"));
        }

        let mut indices = target_components
            .iter()
            .map(|comp| product.component_index(comp).map(|i| i + 1))
            .collect::<KrResult<Vec<usize>>>()?;
        indices.sort_unstable();
        indices.dedup();
        let all_targeted = indices.len() == product.num_components();

        families
            .into_iter()
            .map(|(family, (low, high))| {
                let spacing = if self.scan_type == Spacing::Log && low <= 0.0 {
                    warn!("{} range starts at {}; scanning linearly", family, low);
                    Spacing::Linear
                } else {
                    self.scan_type
                };
                let base = format!("binding_model.{family}");
                if all_targeted {
                    let path = ParamPath::parse(&format!("{base}[1:]"))?;
                    return ParameterScan::new(path, low, high, self.scan_num_values, spacing);
                }
                let mut scan = ParameterScan::new(
                    ParamPath::parse(&format!("{base}[{}]", indices[0]))?,
                    low,
                    high,
                    self.scan_num_values,
                    spacing,
                )?;
                for index in &indices[1..] {
                    let parallel = ParameterScan::new(
                        ParamPath::parse(&format!("{base}[{index}]"))?,
                        low,
                        high,
                        self.scan_num_values,
                        spacing,
                    )?;
                    scan = scan.with_parallel(parallel)?;
                }
                Ok(scan)
            })
            .collect()
    }
}
