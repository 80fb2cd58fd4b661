//! Random parameter scans for Monte-Carlo exploration.

use rand::Rng;
use rand_distr::{Distribution, Exp, Gamma, LogNormal, Normal, Triangular, Uniform};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use kr_types::{config_error, KrResult, ParamPath, Simulation};

/// Distribution a random scan draws from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum SamplingDistribution {
    Uniform { low: f64, high: f64 },
    Gaussian { mean: f64, std_dev: f64 },
    LogNormal { mu: f64, sigma: f64 },
    Exponential { lambda: f64 },
    Triangular { min: f64, max: f64, mode: f64 },
    Gamma { shape: f64, scale: f64 },
}

impl SamplingDistribution {
    /// Build a distribution from its family name and positional parameters.
    ///
    /// `p1`/`p2` are the two leading parameters (low/high, mean/std_dev,
    /// mu/sigma, shape/scale, min/max); `extra` carries any further ones
    /// (the triangular mode).
    pub fn from_name(name: &str, p1: f64, p2: f64, extra: &[f64]) -> KrResult<Self> {
        let dist = match name.to_ascii_lowercase().as_str() {
            "uniform" => Self::Uniform { low: p1, high: p2 },
            "gaussian" | "normal" => Self::Gaussian {
                mean: p1,
                std_dev: p2,
            },
            "lognormal" => Self::LogNormal { mu: p1, sigma: p2 },
            "exponential" => Self::Exponential { lambda: p1 },
            "triangular" => {
                let mode = extra.first().copied().ok_or_else(|| {
                    config_error!("Triangular distribution needs a mode parameter")
                })?;
                Self::Triangular {
                    min: p1,
                    max: p2,
                    mode,
                }
            }
            "gamma" => Self::Gamma {
                shape: p1,
                scale: p2,
            },
            other => return Err(config_error!("Unsupported distribution family: {}", other)),
        };
        dist.validate()?;
        Ok(dist)
    }

    /// Check the parameters describe a valid distribution.
    pub fn validate(&self) -> KrResult<()> {
        self.sampler().map(|_| ())
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> KrResult<f64> {
        Ok(self.sampler()?.sample(rng))
    }

    fn sampler(&self) -> KrResult<Sampler> {
        let invalid = |e: &dyn fmt::Display| config_error!("Invalid {:?}: {}", self, e);
        let sampler = match *self {
            Self::Uniform { low, high } => {
                Sampler::Uniform(Uniform::new_inclusive(low, high).map_err(|e| invalid(&e))?)
            }
            Self::Gaussian { mean, std_dev } => {
                Sampler::Gaussian(Normal::new(mean, std_dev).map_err(|e| invalid(&e))?)
            }
            Self::LogNormal { mu, sigma } => {
                Sampler::LogNormal(LogNormal::new(mu, sigma).map_err(|e| invalid(&e))?)
            }
            Self::Exponential { lambda } => {
                Sampler::Exponential(Exp::new(lambda).map_err(|e| invalid(&e))?)
            }
            Self::Triangular { min, max, mode } => {
                Sampler::Triangular(Triangular::new(min, max, mode).map_err(|e| invalid(&e))?)
            }
            Self::Gamma { shape, scale } => {
                Sampler::Gamma(Gamma::new(shape, scale).map_err(|e| invalid(&e))?)
            }
        };
        Ok(sampler)
    }
}

enum Sampler {
    Uniform(Uniform<f64>),
    Gaussian(Normal<f64>),
    LogNormal(LogNormal<f64>),
    Exponential(Exp<f64>),
    Triangular(Triangular<f64>),
    Gamma(Gamma<f64>),
}

impl Sampler {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match self {
            Self::Uniform(d) => d.sample(rng),
            Self::Gaussian(d) => d.sample(rng),
            Self::LogNormal(d) => d.sample(rng),
            Self::Exponential(d) => d.sample(rng),
            Self::Triangular(d) => d.sample(rng),
            Self::Gamma(d) => d.sample(rng),
        }
    }
}

/// A parameter whose value is a function of a random scan's draw.
///
/// The function is expected to be deterministic: the same draw must always
/// produce the same dependent value.
#[derive(Clone)]
pub struct DependentParameter {
    pub path: ParamPath,
    pub func: Arc<dyn Fn(f64) -> f64 + Send + Sync>,
}

impl fmt::Debug for DependentParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependentParameter")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// One parameter drawn at random for every variant of a Monte-Carlo group.
#[derive(Debug, Clone)]
pub struct RandomParameterScan {
    pub name: ParamPath,
    pub distribution: SamplingDistribution,
    pub dependents: Vec<DependentParameter>,
}

impl RandomParameterScan {
    pub fn new(name: ParamPath, distribution: SamplingDistribution) -> KrResult<Self> {
        distribution.validate()?;
        Ok(Self {
            name,
            distribution,
            dependents: Vec::new(),
        })
    }

    pub fn with_dependent<F>(mut self, path: ParamPath, func: F) -> Self
    where
        F: Fn(f64) -> f64 + Send + Sync + 'static,
    {
        self.dependents.push(DependentParameter {
            path,
            func: Arc::new(func),
        });
        self
    }

    pub fn validate_against(&self, center: &Simulation) -> KrResult<()> {
        self.name.validate(&center.model)?;
        for dep in &self.dependents {
            dep.path.validate(&center.model)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn from_name_accepts_known_families() {
        assert!(matches!(
            SamplingDistribution::from_name("Normal", 1.0, 0.1, &[]).unwrap(),
            SamplingDistribution::Gaussian { .. }
        ));
        assert!(SamplingDistribution::from_name("triangular", 0.0, 2.0, &[1.0]).is_ok());
        assert!(SamplingDistribution::from_name("gamma", 2.0, 1.5, &[]).is_ok());
    }

    #[test]
    fn from_name_rejects_unknown_or_invalid() {
        assert!(SamplingDistribution::from_name("cauchy", 0.0, 1.0, &[]).is_err());
        assert!(SamplingDistribution::from_name("triangular", 0.0, 2.0, &[]).is_err());
        assert!(SamplingDistribution::from_name("gaussian", 0.0, -1.0, &[]).is_err());
        assert!(SamplingDistribution::from_name("uniform", 2.0, 1.0, &[]).is_err());
    }

    #[test]
    fn uniform_draws_stay_in_bounds() {
        let dist = SamplingDistribution::Uniform { low: 2.0, high: 3.0 };
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..200 {
            let v = dist.sample(&mut rng).unwrap();
            assert!((2.0..=3.0).contains(&v));
        }
    }

    #[test]
    fn serializes_with_family_tag() {
        let dist = SamplingDistribution::Gaussian {
            mean: 1.0,
            std_dev: 0.5,
        };
        let json = serde_json::to_value(&dist).unwrap();
        assert_eq!(json["family"], "gaussian");
    }
}
