use crate::job::{Job, JobId, Parameters};
use itertools::Itertools;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs::File, path::PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum SamplingError {
    #[error("generator defines no parameters")]
    NoParameters,
    #[error("parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },
    #[error("generator must produce at least one sample")]
    NoSamples,
    #[error("failed to read parameter list {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse parameter list: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GridAxis {
    pub min: f64,
    pub max: f64,
    pub steps: usize,
}

impl GridAxis {
    /// `steps` evenly spaced values from `min` to `max` inclusive
    pub fn values(&self) -> Vec<f64> {
        if self.steps <= 1 {
            return vec![self.min];
        }

        let width = (self.max - self.min) / (self.steps - 1) as f64;

        (0..self.steps)
            .map(|step| self.min + width * step as f64)
            .collect()
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

/// Supported job generators, selected by `kind` in the config
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum GeneratorConfig {
    /// full factorial over evenly spaced axis values
    Grid {
        parameters: BTreeMap<String, GridAxis>,
    },
    /// uniform samples from a seeded generator
    Random {
        parameters: BTreeMap<String, Bounds>,
        samples: usize,
        #[serde(default)]
        seed: u64,
    },
    /// an explicit YAML list of parameter maps
    List { path: PathBuf },
}

fn check_range(name: &str, min: f64, max: f64) -> Result<(), SamplingError> {
    if !min.is_finite() || !max.is_finite() {
        Err(SamplingError::InvalidParameter {
            name: name.to_owned(),
            reason: "bounds must be finite".to_owned(),
        })
    } else if min > max {
        Err(SamplingError::InvalidParameter {
            name: name.to_owned(),
            reason: format!("min ({min}) is larger than max ({max})"),
        })
    } else {
        Ok(())
    }
}

impl GeneratorConfig {
    pub fn validate(&self) -> Result<(), SamplingError> {
        match self {
            Self::Grid { parameters } => {
                if parameters.is_empty() {
                    return Err(SamplingError::NoParameters);
                }

                for (name, axis) in parameters {
                    check_range(name, axis.min, axis.max)?;

                    if axis.steps == 0 {
                        return Err(SamplingError::InvalidParameter {
                            name: name.clone(),
                            reason: "steps must be at least 1".to_owned(),
                        });
                    }
                }

                Ok(())
            }
            Self::Random {
                parameters,
                samples,
                ..
            } => {
                if parameters.is_empty() {
                    return Err(SamplingError::NoParameters);
                }
                if *samples == 0 {
                    return Err(SamplingError::NoSamples);
                }

                parameters
                    .iter()
                    .try_for_each(|(name, bounds)| check_range(name, bounds.min, bounds.max))
            }
            // only known once the file is read
            Self::List { .. } => Ok(()),
        }
    }

    /// Produce the ordered job sequence, ids run from 0 to N-1
    pub fn generate(&self) -> Result<Vec<Job>, SamplingError> {
        self.validate()?;

        let samples: Vec<Parameters> = match self {
            Self::Grid { parameters } => parameters
                .values()
                .map(|axis| axis.values().into_iter())
                .multi_cartesian_product()
                .map(|values| parameters.keys().cloned().zip(values).collect())
                .collect(),
            Self::Random {
                parameters,
                samples,
                seed,
            } => {
                let mut rng = ChaCha8Rng::seed_from_u64(*seed);

                (0..*samples)
                    .map(|_| {
                        parameters
                            .iter()
                            .map(|(name, bounds)| {
                                let value = if bounds.min == bounds.max {
                                    bounds.min
                                } else {
                                    rng.random_range(bounds.min..bounds.max)
                                };

                                (name.clone(), value)
                            })
                            .collect()
                    })
                    .collect()
            }
            Self::List { path } => {
                let file = File::open(path).map_err(|source| SamplingError::Read {
                    path: path.clone(),
                    source,
                })?;

                serde_yaml::from_reader(file)?
            }
        };

        if samples.is_empty() {
            return Err(SamplingError::NoSamples);
        }

        info!("Creating {} jobs", samples.len());

        Ok(samples
            .into_iter()
            .enumerate()
            .map(|(id, parameters)| Job::new(id as JobId, parameters))
            .collect())
    }
}
