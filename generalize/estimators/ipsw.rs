//! Inverse probability of sampling weighting.

use super::{
    Estimate, EstimationError, Estimator, Population, both_arms_present, weighted_arm_mean,
};
use crate::data::Partition;
use crate::fit::{IrlsFitter, RegressionFitter};
use crate::formula::ModelSpec;
use crate::weights::{SamplingWeights, WeightDiagnostics, sampling_weights};
use ndarray::{Array1, ArrayView1};

/// Reweights the sample to the covariate distribution of the target population and takes
/// the weighted mean outcome in each treatment arm.
#[derive(Debug, Clone)]
pub struct Ipsw<F = IrlsFitter> {
    sampling_model: ModelSpec,
    population: Population,
    stabilized: bool,
    fitter: F,
}

/// Per-record weights for the sample, in sample order.
#[derive(Debug, Clone)]
pub struct IpswWeights {
    pub sampling: SamplingWeights,
    /// Sampling weight times treatment weight (when treatment weights are present).
    pub combined: Array1<f64>,
}

impl IpswWeights {
    pub fn diagnostics(&self) -> WeightDiagnostics {
        WeightDiagnostics::of(self.combined.view())
    }

    /// True when some sample record has a predicted membership probability of zero.
    pub fn has_zero_probability(&self) -> bool {
        self.sampling.has_zero_probability()
    }
}

impl Ipsw<IrlsFitter> {
    pub fn new(sampling_model: ModelSpec) -> Self {
        Self {
            sampling_model,
            population: Population::default(),
            stabilized: false,
            fitter: IrlsFitter::default(),
        }
    }
}

impl<F: RegressionFitter> Ipsw<F> {
    pub fn with_fitter<G: RegressionFitter>(self, fitter: G) -> Ipsw<G> {
        Ipsw {
            sampling_model: self.sampling_model,
            population: self.population,
            stabilized: self.stabilized,
            fitter,
        }
    }

    pub fn with_population(mut self, population: Population) -> Self {
        self.population = population;
        self
    }

    /// Scale sampling weights to a mean near 1. Point estimates are unchanged.
    pub fn stabilized(mut self, stabilized: bool) -> Self {
        self.stabilized = stabilized;
        self
    }

    pub fn sampling_model(&self) -> &ModelSpec {
        &self.sampling_model
    }

    pub fn population(&self) -> Population {
        self.population
    }

    pub fn weights(&self, partition: &Partition<'_>) -> Result<IpswWeights, EstimationError> {
        let sampling = sampling_weights(
            &self.fitter,
            &self.sampling_model,
            partition,
            self.population,
            self.stabilized,
        )?;
        let combined = combine_weights(&sampling.weights, partition.treatment_weights());
        Ok(IpswWeights { sampling, combined })
    }
}

impl<F: RegressionFitter> Estimator for Ipsw<F> {
    fn name(&self) -> &'static str {
        "IPSW"
    }

    fn estimate(&self, partition: &Partition<'_>) -> Result<Estimate, EstimationError> {
        let (n_sample, n_target) = (partition.n_sample(), partition.n_target());
        let treatment = partition.sample().treatment();
        if !both_arms_present(treatment.view()) {
            log::debug!("IPSW is undefined: a treatment arm has no sample records.");
            return Ok(Estimate::undefined(n_sample, n_target));
        }

        let weights = self.weights(partition)?;
        if weights.has_zero_probability() {
            log::warn!(
                "IPSW is undefined: a sample record has a predicted sampling probability of 0."
            );
            return Ok(Estimate::undefined(n_sample, n_target));
        }

        let outcome = partition.sample().outcome();
        let risk = |level| {
            weighted_arm_mean(
                outcome.view(),
                treatment.view(),
                weights.combined.view(),
                level,
            )
        };
        Ok(Estimate::from_arm_risks(
            risk(1.0),
            risk(0.0),
            n_sample,
            n_target,
        ))
    }
}

/// Multiplies sampling weights by the treatment weights, if any.
pub(crate) fn combine_weights(
    sampling: &Array1<f64>,
    treatment: Option<ArrayView1<f64>>,
) -> Array1<f64> {
    match treatment {
        Some(t) => sampling * &t,
        None => sampling.clone(),
    }
}
