//! Population-level estimators of the treatment effect.
//!
//! All three estimators share one contract, [`Estimator::estimate`], taking a
//! [`Partition`] and returning an [`Estimate`]. A treatment arm with no sample records
//! gives an undefined (`NaN`) estimate rather than an error, so bootstrap replicates with
//! empty strata remain visible downstream.

pub mod aipsw;
pub mod gtransport;
pub mod ipsw;

pub use aipsw::Aipsw;
pub use gtransport::GTransport;
pub use ipsw::{Ipsw, IpswWeights};

use crate::data::{DataError, Partition, Subset};
use crate::fit::FitError;
use crate::formula::FormulaError;
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The population the estimate refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Population {
    /// Transportability: the target records only. The sample is not part of the population.
    #[default]
    Transport,
    /// Generalizability: sample and target records together form the population.
    Generalize,
}

impl Population {
    /// The records whose covariate distribution defines the population.
    pub fn records<'a>(self, partition: &Partition<'a>) -> Subset<'a> {
        match self {
            Population::Transport => partition.target().clone(),
            Population::Generalize => partition.sample().concat(partition.target()),
        }
    }
}

/// A population-level contrast between the two treatment arms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Estimate {
    /// Mean outcome had everyone been treated.
    pub risk_treated: f64,
    /// Mean outcome had no one been treated.
    pub risk_untreated: f64,
    pub risk_difference: f64,
    pub risk_ratio: f64,
    pub n_sample: usize,
    pub n_target: usize,
}

impl Estimate {
    pub fn from_arm_risks(
        risk_treated: f64,
        risk_untreated: f64,
        n_sample: usize,
        n_target: usize,
    ) -> Self {
        Self {
            risk_treated,
            risk_untreated,
            risk_difference: risk_treated - risk_untreated,
            risk_ratio: risk_treated / risk_untreated,
            n_sample,
            n_target,
        }
    }

    pub fn undefined(n_sample: usize, n_target: usize) -> Self {
        Self::from_arm_risks(f64::NAN, f64::NAN, n_sample, n_target)
    }

    pub fn is_defined(&self) -> bool {
        self.risk_difference.is_finite()
    }
}

/// A comprehensive error type for the estimation process.
#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("Invalid model specification: {0}")]
    Formula(#[from] FormulaError),

    #[error("Regression fit failed: {0}")]
    Fit(#[from] FitError),

    #[error("Invalid data: {0}")]
    Data(#[from] DataError),

    #[error("The fitter returned {found} coefficients, but the model has {expected} columns.")]
    CoefficientCount { expected: usize, found: usize },

    #[error("Invalid bootstrap configuration: {0}")]
    InvalidBootstrap(String),
}

/// Estimates a population-level treatment contrast from a partitioned dataset.
pub trait Estimator: Sync {
    fn name(&self) -> &'static str;

    fn estimate(&self, partition: &Partition<'_>) -> Result<Estimate, EstimationError>;
}

/// Weighted mean of `values` over the records with `treatment == level`. `NaN` when no
/// record has that level or the weights sum to zero.
pub(crate) fn weighted_arm_mean(
    values: ArrayView1<f64>,
    treatment: ArrayView1<f64>,
    weights: ArrayView1<f64>,
    level: f64,
) -> f64 {
    let (numerator, denominator) = ndarray::Zip::from(values)
        .and(treatment)
        .and(weights)
        .fold((0.0, 0.0), |(num, den), &v, &a, &w| {
            if a == level {
                (num + w * v, den + w)
            } else {
                (num, den)
            }
        });
    if denominator > 0.0 {
        numerator / denominator
    } else {
        f64::NAN
    }
}

/// True when both treatment arms have at least one sample record.
pub(crate) fn both_arms_present(treatment: ArrayView1<f64>) -> bool {
    treatment.iter().any(|&a| a == 1.0) && treatment.iter().any(|&a| a == 0.0)
}
