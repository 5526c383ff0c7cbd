//! Sampling weights (IPSW) and treatment weights (IPTW).

use crate::data::{Partition, Subset};
use crate::estimators::{EstimationError, Population};
use crate::fit::{FittedModel, IrlsFitter, LinkFunction, RegressionFitter};
use crate::formula::{ModelSpec, TreatmentLevel};
use ndarray::{Array1, ArrayView1};
use serde::Serialize;

/// Inverse probability of sampling weights for the sample records, in sample order.
#[derive(Debug, Clone)]
pub struct SamplingWeights {
    /// Predicted probability of sample membership.
    pub probabilities: Array1<f64>,
    pub weights: Array1<f64>,
}

impl SamplingWeights {
    /// True when some sample record has a predicted membership probability of zero, which
    /// leaves its weight undefined.
    pub fn has_zero_probability(&self) -> bool {
        self.probabilities.iter().any(|&p| p <= 0.0)
    }
}

/// Fits the sample-membership model on all records and weights each sample record by the
/// inverse odds (transport) or inverse probability (generalize) of membership.
///
/// A stabilized weight is multiplied by `n_sample / n_target` (transport) or
/// `n_sample / n_total` (generalize), which brings its mean near 1 without changing any
/// ratio estimator.
pub fn sampling_weights<F: RegressionFitter + ?Sized>(
    fitter: &F,
    model: &ModelSpec,
    partition: &Partition<'_>,
    population: Population,
    stabilized: bool,
) -> Result<SamplingWeights, EstimationError> {
    let roles = partition.sample().data().roles();
    model.forbid(&roles.treatment, "treatment", "sampling model")?;

    let combined = partition.sample().concat(partition.target());
    let indicator = combined.sample_indicator();
    let fitted = FittedModel::fit(
        fitter,
        model,
        &combined,
        indicator.view(),
        None,
        LinkFunction::Logit,
    )?;
    let probabilities = fitted.predict(partition.sample(), TreatmentLevel::Observed)?;

    let n_sample = partition.n_sample() as f64;
    let n_target = partition.n_target() as f64;
    let (weight_of, stabilizer): (fn(f64) -> f64, f64) = match population {
        Population::Transport => (|p| (1.0 - p) / p, n_sample / n_target),
        Population::Generalize => (|p| 1.0 / p, n_sample / (n_sample + n_target)),
    };
    let scale = if stabilized { stabilizer } else { 1.0 };
    let weights = probabilities.mapv(|p| weight_of(p) * scale);

    if log::log_enabled!(log::Level::Debug) {
        let summary = WeightDiagnostics::of(weights.view());
        log::debug!(
            "Sampling weights: min {:.4}, max {:.4}, mean {:.4}, sum {:.2}",
            summary.min,
            summary.max,
            summary.mean,
            summary.sum
        );
    }

    Ok(SamplingWeights {
        probabilities,
        weights,
    })
}

/// Summary statistics of a weight vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WeightDiagnostics {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub sum: f64,
    /// Kish effective sample size, `(sum w)^2 / sum w^2`.
    pub effective_sample_size: f64,
}

impl WeightDiagnostics {
    pub fn of(weights: ArrayView1<f64>) -> Self {
        let sum = weights.sum();
        let sum_sq = weights.dot(&weights);
        Self {
            min: weights.iter().copied().fold(f64::INFINITY, f64::min),
            max: weights.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            mean: sum / weights.len() as f64,
            sum,
            effective_sample_size: sum * sum / sum_sq,
        }
    }
}

/// Produces one non-negative treatment weight per sample record, mean weight near 1.
pub trait TreatmentWeighter: Sync {
    fn weights(&self, sample: &Subset<'_>) -> Result<Array1<f64>, EstimationError>;
}

/// Inverse probability of treatment weighting from a logistic treatment model fitted
/// among the sample records.
#[derive(Debug, Clone)]
pub struct Iptw<F = IrlsFitter> {
    treatment_model: ModelSpec,
    stabilized: bool,
    fitter: F,
}

impl Iptw<IrlsFitter> {
    pub fn new(treatment_model: ModelSpec) -> Self {
        Self {
            treatment_model,
            stabilized: true,
            fitter: IrlsFitter::default(),
        }
    }
}

impl<F: RegressionFitter> Iptw<F> {
    pub fn with_fitter<G: RegressionFitter>(self, fitter: G) -> Iptw<G> {
        Iptw {
            treatment_model: self.treatment_model,
            stabilized: self.stabilized,
            fitter,
        }
    }

    /// Multiply by the marginal probability of the received treatment (default on).
    pub fn stabilized(mut self, stabilized: bool) -> Self {
        self.stabilized = stabilized;
        self
    }
}

impl<F: RegressionFitter> TreatmentWeighter for Iptw<F> {
    fn weights(&self, sample: &Subset<'_>) -> Result<Array1<f64>, EstimationError> {
        let roles = sample.data().roles();
        self.treatment_model
            .forbid(&roles.treatment, "treatment", "treatment model")?;

        let treatment = sample.treatment();
        let fitted = FittedModel::fit(
            &self.fitter,
            &self.treatment_model,
            sample,
            treatment.view(),
            None,
            LinkFunction::Logit,
        )?;
        let propensity = fitted.predict(sample, TreatmentLevel::Observed)?;

        let marginal = treatment.mean().unwrap_or(f64::NAN);
        let weights: Array1<f64> = ndarray::Zip::from(&treatment)
            .and(&propensity)
            .map_collect(|&a, &p| {
                let (received, numerator) = if a == 1.0 {
                    (p, marginal)
                } else {
                    (1.0 - p, 1.0 - marginal)
                };
                if self.stabilized {
                    numerator / received
                } else {
                    1.0 / received
                }
            });

        if weights.iter().any(|w| !w.is_finite()) {
            log::warn!(
                "Treatment probabilities of exactly 0 or 1 produced non-finite IPTW weights."
            );
        }
        Ok(weights)
    }
}
