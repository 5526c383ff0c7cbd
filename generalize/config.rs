//! TOML analysis configuration.
//!
//! ```toml
//! population = "transport"
//! estimators = ["ipsw", "g_transport", "aipsw"]
//! sampling_model = [{ main = "L" }, { main = "W" }, { interaction = ["W", "W"] }]
//! outcome_model = [{ main = "A" }, { main = "L" }, { interaction = ["A", "V"] }]
//!
//! [data]
//! path = "study.tsv"
//!
//! [columns]
//! id = "id"
//! outcome = "Y"
//! treatment = "A"
//! sample = "S"
//!
//! [bootstrap]
//! replicates = 200
//! seed = 2021
//! ```

use crate::bootstrap::BootstrapConfig;
use crate::data::ColumnRoles;
use crate::estimators::Population;
use crate::fit::IrlsFitter;
use crate::formula::ModelSpec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("The {estimator} estimator requires a '{model}' in the configuration.")]
    MissingModel {
        estimator: &'static str,
        model: &'static str,
    },
    #[error(
        "Both a weight column ('{0}') and a treatment model were configured. Choose one source of treatment weights."
    )]
    ConflictingWeights(String),
    #[error("The field separator must be a single ASCII character, got {0:?}.")]
    InvalidSeparator(char),
    #[error("No estimators were requested.")]
    NoEstimators,
    #[error("The bootstrap needs at least 2 replicates, got {0}.")]
    TooFewReplicates(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorKind {
    Ipsw,
    GTransport,
    Aipsw,
}

impl EstimatorKind {
    pub fn name(self) -> &'static str {
        match self {
            EstimatorKind::Ipsw => "IPSW",
            EstimatorKind::GTransport => "g-transport",
            EstimatorKind::Aipsw => "AIPSW",
        }
    }

    fn needs_sampling_model(self) -> bool {
        matches!(self, EstimatorKind::Ipsw | EstimatorKind::Aipsw)
    }

    fn needs_outcome_model(self) -> bool {
        matches!(self, EstimatorKind::GTransport | EstimatorKind::Aipsw)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataConfig {
    /// Relative paths are resolved against the directory of the configuration file.
    pub path: PathBuf,
    #[serde(default = "default_separator")]
    pub separator: char,
}

fn default_separator() -> char {
    '\t'
}

/// Logistic treatment model for IPTW.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TreatmentModelConfig {
    pub terms: ModelSpec,
    #[serde(default = "default_true")]
    pub stabilized: bool,
}

fn default_true() -> bool {
    true
}

fn default_estimators() -> Vec<EstimatorKind> {
    vec![
        EstimatorKind::Ipsw,
        EstimatorKind::GTransport,
        EstimatorKind::Aipsw,
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub population: Population,
    #[serde(default = "default_estimators")]
    pub estimators: Vec<EstimatorKind>,
    #[serde(default)]
    pub sampling_model: Option<ModelSpec>,
    #[serde(default)]
    pub outcome_model: Option<ModelSpec>,
    /// Multiply sampling weights by a constant so their mean is near 1.
    #[serde(default)]
    pub stabilized_weights: bool,
    pub data: DataConfig,
    pub columns: ColumnRoles,
    #[serde(default)]
    pub treatment_model: Option<TreatmentModelConfig>,
    #[serde(default)]
    pub fit: IrlsFitter,
    #[serde(default)]
    pub bootstrap: Option<BootstrapConfig>,
}

impl AnalysisConfig {
    /// Reads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let mut config = Self::parse(&text)?;
        if config.data.path.is_relative() {
            if let Some(dir) = path.parent() {
                config.data.path = dir.join(&config.data.path);
            }
        }
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.estimators.is_empty() {
            return Err(ConfigError::NoEstimators);
        }
        for &kind in &self.estimators {
            if kind.needs_sampling_model() && self.sampling_model.is_none() {
                return Err(ConfigError::MissingModel {
                    estimator: kind.name(),
                    model: "sampling_model",
                });
            }
            if kind.needs_outcome_model() && self.outcome_model.is_none() {
                return Err(ConfigError::MissingModel {
                    estimator: kind.name(),
                    model: "outcome_model",
                });
            }
        }
        if let (Some(column), Some(_)) = (&self.columns.weight, &self.treatment_model) {
            return Err(ConfigError::ConflictingWeights(column.clone()));
        }
        self.separator()?;
        if let Some(bootstrap) = &self.bootstrap {
            if bootstrap.replicates < 2 {
                return Err(ConfigError::TooFewReplicates(bootstrap.replicates));
            }
        }
        Ok(())
    }

    pub fn separator(&self) -> Result<u8, ConfigError> {
        let c = self.data.separator;
        if c.is_ascii() {
            Ok(c as u8)
        } else {
            Err(ConfigError::InvalidSeparator(c))
        }
    }
}
