//! The g-transport formula: outcome-model standardization over the target population.

use super::{Estimate, EstimationError, Estimator, Population, both_arms_present};
use crate::data::Partition;
use crate::fit::{FittedModel, IrlsFitter, LinkFunction, RegressionFitter};
use crate::formula::{FormulaError, ModelSpec, TreatmentLevel};
use ndarray::Array1;

/// Fits an outcome model among the sample records and averages its predictions over the
/// target population with treatment set to 1 and to 0.
#[derive(Debug, Clone)]
pub struct GTransport<F = IrlsFitter> {
    outcome_model: ModelSpec,
    population: Population,
    fitter: F,
}

impl GTransport<IrlsFitter> {
    pub fn new(outcome_model: ModelSpec) -> Self {
        Self {
            outcome_model,
            population: Population::default(),
            fitter: IrlsFitter::default(),
        }
    }
}

impl<F: RegressionFitter> GTransport<F> {
    pub fn with_fitter<G: RegressionFitter>(self, fitter: G) -> GTransport<G> {
        GTransport {
            outcome_model: self.outcome_model,
            population: self.population,
            fitter,
        }
    }

    pub fn with_population(mut self, population: Population) -> Self {
        self.population = population;
        self
    }

    pub fn outcome_model(&self) -> &ModelSpec {
        &self.outcome_model
    }
}

impl<F: RegressionFitter> Estimator for GTransport<F> {
    fn name(&self) -> &'static str {
        "g-transport"
    }

    fn estimate(&self, partition: &Partition<'_>) -> Result<Estimate, EstimationError> {
        let (n_sample, n_target) = (partition.n_sample(), partition.n_target());
        if !both_arms_present(partition.sample().treatment().view()) {
            log::debug!("G-transport is undefined: a treatment arm has no sample records.");
            return Ok(Estimate::undefined(n_sample, n_target));
        }

        let model = fit_outcome_model(&self.fitter, &self.outcome_model, partition)?;
        let (treated, untreated) = counterfactual_predictions(&model, partition, self.population)?;
        Ok(Estimate::from_arm_risks(
            mean_or_nan(&treated),
            mean_or_nan(&untreated),
            n_sample,
            n_target,
        ))
    }
}

/// Fits the outcome model among the sample records. The link is logit for a binary
/// outcome and identity otherwise.
pub(super) fn fit_outcome_model<F: RegressionFitter + ?Sized>(
    fitter: &F,
    outcome_model: &ModelSpec,
    partition: &Partition<'_>,
) -> Result<FittedModel, EstimationError> {
    let treatment = &partition.sample().data().roles().treatment;
    if !outcome_model.references(treatment) {
        return Err(FormulaError::MissingTreatmentTerm(treatment.clone()).into());
    }
    let sample = partition.sample();
    let outcome = sample.outcome();
    let link = LinkFunction::detect(outcome.view());
    log::debug!(
        "Fitting outcome model with {} columns on {} sample records ({link:?} link).",
        outcome_model.ncols(),
        sample.len()
    );
    FittedModel::fit(fitter, outcome_model, sample, outcome.view(), None, link)
}

/// Predictions for every population record with treatment forced to 1 and to 0.
pub(super) fn counterfactual_predictions(
    model: &FittedModel,
    partition: &Partition<'_>,
    population: Population,
) -> Result<(Array1<f64>, Array1<f64>), EstimationError> {
    let records = population.records(partition);
    let treated = model.predict(&records, TreatmentLevel::Fixed(1.0))?;
    let untreated = model.predict(&records, TreatmentLevel::Fixed(0.0))?;
    Ok((treated, untreated))
}

pub(super) fn mean_or_nan(values: &Array1<f64>) -> f64 {
    values.mean().unwrap_or(f64::NAN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Dataset, Record, partition};
    use crate::formula::Term;
    use crate::test_fixtures::{FailingFitter, cell_study, roles, single_arm_study};
    use approx::assert_abs_diff_eq;

    fn saturated() -> ModelSpec {
        ModelSpec::new(vec![
            Term::main("A"),
            Term::main("L"),
            Term::interaction("A", "L"),
        ])
        .unwrap()
    }

    #[test]
    fn test_saturated_model_reproduces_stratum_standardization() {
        let data = cell_study();
        let split = partition(&data).unwrap();

        let transported = GTransport::new(saturated()).estimate(&split).unwrap();
        assert_abs_diff_eq!(transported.risk_treated, 0.45, epsilon = 1e-6);
        assert_abs_diff_eq!(transported.risk_untreated, 0.325, epsilon = 1e-6);

        let generalized = GTransport::new(saturated())
            .with_population(Population::Generalize)
            .estimate(&split)
            .unwrap();
        assert_abs_diff_eq!(generalized.risk_treated, 142.0 / 300.0, epsilon = 1e-6);
        assert_abs_diff_eq!(generalized.risk_untreated, 101.0 / 300.0, epsilon = 1e-6);
    }

    #[test]
    fn test_outcome_model_requires_treatment_term() {
        let data = cell_study();
        let split = partition(&data).unwrap();
        let err = GTransport::new(ModelSpec::main_effects(&["L"]).unwrap())
            .estimate(&split)
            .unwrap_err();
        match err {
            EstimationError::Formula(FormulaError::MissingTreatmentTerm(column)) => {
                assert_eq!(column, "A")
            }
            other => panic!("Expected MissingTreatmentTerm, got {:?}", other),
        }
    }

    #[test]
    fn test_continuous_outcome_uses_identity_link() {
        // Y = 1 + 2A + 0.5L exactly, so the effect is 2 in any population.
        let mut records = Vec::new();
        for i in 0..40 {
            let a = (i % 2) as f64;
            let l = (i % 5) as f64;
            records.push(Record::sample(&format!("s{i}"), a, 1.0 + 2.0 * a + 0.5 * l, vec![l]));
        }
        for i in 0..30 {
            records.push(Record::target(&format!("t{i}"), vec![(i % 3) as f64 + 2.0]));
        }
        let data = Dataset::from_records(roles(), &["L"], &records).unwrap();
        let split = partition(&data).unwrap();
        let model = ModelSpec::main_effects(&["A", "L"]).unwrap();

        let estimate = GTransport::new(model).estimate(&split).unwrap();
        assert_abs_diff_eq!(estimate.risk_difference, 2.0, epsilon = 1e-8);
        // Target L averages 3, so the untreated mean is 1 + 1.5.
        assert_abs_diff_eq!(estimate.risk_untreated, 2.5, epsilon = 1e-8);
    }

    #[test]
    fn test_missing_target_covariate_names_column() {
        let mut records = vec![
            Record::sample("s1", 1.0, 1.0, vec![0.0]),
            Record::sample("s2", 1.0, 0.0, vec![1.0]),
            Record::sample("s3", 0.0, 1.0, vec![1.0]),
            Record::sample("s4", 0.0, 0.0, vec![0.0]),
        ];
        records.push(Record::target("t1", vec![1.0]));
        records.push(Record::target("t2", vec![f64::NAN]));
        let data = Dataset::from_records(roles(), &["L"], &records).unwrap();
        let split = partition(&data).unwrap();
        let model = ModelSpec::main_effects(&["A", "L"]).unwrap();

        let err = GTransport::new(model).estimate(&split).unwrap_err();
        match err {
            EstimationError::Formula(FormulaError::MissingValue { column, id }) => {
                assert_eq!(column, "L");
                assert_eq!(id, "t2");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_arm_is_undefined_without_fitting() {
        let data = single_arm_study();
        let split = partition(&data).unwrap();
        let estimate = GTransport::new(saturated())
            .with_fitter(FailingFitter)
            .estimate(&split)
            .unwrap();
        assert!(!estimate.is_defined());
    }

    #[test]
    fn test_fit_failure_is_an_error() {
        let data = cell_study();
        let split = partition(&data).unwrap();
        let err = GTransport::new(saturated())
            .with_fitter(FailingFitter)
            .estimate(&split)
            .unwrap_err();
        assert!(matches!(err, EstimationError::Fit(_)));
    }
}
