//! Augmented IPSW, the doubly robust combination of the sampling and outcome models.

use super::gtransport::{counterfactual_predictions, fit_outcome_model, mean_or_nan};
use super::ipsw::combine_weights;
use super::{
    Estimate, EstimationError, Estimator, Population, both_arms_present, weighted_arm_mean,
};
use crate::data::Partition;
use crate::fit::{IrlsFitter, RegressionFitter};
use crate::formula::{ModelSpec, TreatmentLevel};
use crate::weights::sampling_weights;

/// G-transport risk plus an IPSW-weighted mean of the outcome-model residuals in each arm.
///
/// Consistent when either the sampling model or the outcome model is correctly specified.
#[derive(Debug, Clone)]
pub struct Aipsw<F = IrlsFitter> {
    sampling_model: ModelSpec,
    outcome_model: ModelSpec,
    population: Population,
    stabilized: bool,
    fitter: F,
}

impl Aipsw<IrlsFitter> {
    pub fn new(sampling_model: ModelSpec, outcome_model: ModelSpec) -> Self {
        Self {
            sampling_model,
            outcome_model,
            population: Population::default(),
            stabilized: false,
            fitter: IrlsFitter::default(),
        }
    }
}

impl<F: RegressionFitter> Aipsw<F> {
    pub fn with_fitter<G: RegressionFitter>(self, fitter: G) -> Aipsw<G> {
        Aipsw {
            sampling_model: self.sampling_model,
            outcome_model: self.outcome_model,
            population: self.population,
            stabilized: self.stabilized,
            fitter,
        }
    }

    pub fn with_population(mut self, population: Population) -> Self {
        self.population = population;
        self
    }

    pub fn stabilized(mut self, stabilized: bool) -> Self {
        self.stabilized = stabilized;
        self
    }
}

impl<F: RegressionFitter> Estimator for Aipsw<F> {
    fn name(&self) -> &'static str {
        "AIPSW"
    }

    fn estimate(&self, partition: &Partition<'_>) -> Result<Estimate, EstimationError> {
        let (n_sample, n_target) = (partition.n_sample(), partition.n_target());
        let sample = partition.sample();
        let treatment = sample.treatment();
        if !both_arms_present(treatment.view()) {
            log::debug!("AIPSW is undefined: a treatment arm has no sample records.");
            return Ok(Estimate::undefined(n_sample, n_target));
        }

        let sampling = sampling_weights(
            &self.fitter,
            &self.sampling_model,
            partition,
            self.population,
            self.stabilized,
        )?;
        if sampling.has_zero_probability() {
            log::warn!(
                "AIPSW is undefined: a sample record has a predicted sampling probability of 0."
            );
            return Ok(Estimate::undefined(n_sample, n_target));
        }
        let weights = combine_weights(&sampling.weights, partition.treatment_weights());

        let model = fit_outcome_model(&self.fitter, &self.outcome_model, partition)?;
        let (treated, untreated) = counterfactual_predictions(&model, partition, self.population)?;
        let outcome = sample.outcome();

        let mut risks = [0.0; 2];
        for (risk, (level, standardized)) in risks
            .iter_mut()
            .zip([(1.0, mean_or_nan(&treated)), (0.0, mean_or_nan(&untreated))])
        {
            let fitted = model.predict(sample, TreatmentLevel::Fixed(level))?;
            let residuals = &outcome - &fitted;
            let correction =
                weighted_arm_mean(residuals.view(), treatment.view(), weights.view(), level);
            *risk = standardized + correction;
        }
        Ok(Estimate::from_arm_risks(
            risks[0], risks[1], n_sample, n_target,
        ))
    }
}
