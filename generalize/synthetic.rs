//! Seeded synthetic studies with known target-population risks.
//!
//! Each individual gets covariates L ~ Bernoulli(0.4), V ~ Bernoulli(0.5) and
//! W ~ Normal(0, 1). Sample membership follows
//! `logit P(S = 1) = -2.3 + s * (0.8 L - 0.6 W + 0.7 V)` with selection strength `s`, so the
//! sample over-represents L and V and under-represents high W. Treatment is randomized with
//! probability 0.5, or confounded with `logit P(A = 1) = -0.3 + L + 0.5 W`. The outcome risk is
//! `logit P(Y = 1) = -1.2 + 0.3 A + 0.6 L + 0.4 W + 0.2 W^2 + 0.6 A V`, so V modifies the
//! treatment effect and the sample effect differs from the target effect.
//!
//! With the default settings about one record in six lands in the sample.

use crate::data::{ColumnRoles, DataError, Dataset, Record};
use crate::estimators::Population;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

pub const COVARIATES: [&str; 3] = ["L", "W", "V"];

/// The column roles of a generated dataset.
pub fn column_roles() -> ColumnRoles {
    ColumnRoles::new("Y", "A", "S").with_id("id")
}

fn sigmoid(eta: f64) -> f64 {
    1.0 / (1.0 + (-eta).exp())
}

fn outcome_risk(a: f64, l: f64, w: f64, v: f64) -> f64 {
    sigmoid(-1.2 + 0.3 * a + 0.6 * l + 0.4 * w + 0.2 * w * w + 0.6 * a * v)
}

#[derive(Debug, Clone)]
pub struct SyntheticStudyBuilder {
    records: usize,
    seed: u64,
    confounded: bool,
    selection_strength: f64,
    population: Population,
}

/// A generated dataset and its true risks under both treatments.
#[derive(Debug, Clone)]
pub struct SyntheticStudy {
    pub dataset: Dataset,
    /// Mean individual risk under treatment over the population records.
    pub true_risk_treated: f64,
    pub true_risk_untreated: f64,
}

impl SyntheticStudy {
    pub fn true_risk_difference(&self) -> f64 {
        self.true_risk_treated - self.true_risk_untreated
    }

    pub fn true_risk_ratio(&self) -> f64 {
        self.true_risk_treated / self.true_risk_untreated
    }
}

impl SyntheticStudyBuilder {
    pub fn new(records: usize) -> Self {
        Self {
            records,
            seed: 2021,
            confounded: false,
            selection_strength: 1.0,
            population: Population::Transport,
        }
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Make treatment depend on L and W among the sample records.
    pub fn confounded(mut self, confounded: bool) -> Self {
        self.confounded = confounded;
        self
    }

    /// Scales the covariate effects on sample membership. 0 makes membership random.
    pub fn selection_strength(mut self, strength: f64) -> Self {
        self.selection_strength = strength;
        self
    }

    /// The population the true risks are averaged over.
    pub fn population(mut self, population: Population) -> Self {
        self.population = population;
        self
    }

    pub fn build(&self) -> Result<SyntheticStudy, DataError> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut records = Vec::with_capacity(self.records);
        let (mut treated, mut untreated, mut counted) = (0.0, 0.0, 0usize);

        for i in 0..self.records {
            let l = if rng.gen_bool(0.4) { 1.0 } else { 0.0 };
            let v = if rng.gen_bool(0.5) { 1.0 } else { 0.0 };
            let w: f64 = rng.sample(StandardNormal);

            let selection =
                -2.3 + self.selection_strength * (0.8 * l - 0.6 * w + 0.7 * v);
            let in_sample = rng.gen_bool(sigmoid(selection));
            let id = (i + 1).to_string();

            if in_sample {
                let p_treated = if self.confounded {
                    sigmoid(-0.3 + l + 0.5 * w)
                } else {
                    0.5
                };
                let a = if rng.gen_bool(p_treated) { 1.0 } else { 0.0 };
                let y = if rng.gen_bool(outcome_risk(a, l, w, v)) {
                    1.0
                } else {
                    0.0
                };
                records.push(Record::sample(&id, a, y, vec![l, w, v]));
            } else {
                records.push(Record::target(&id, vec![l, w, v]));
            }

            if !in_sample || self.population == Population::Generalize {
                treated += outcome_risk(1.0, l, w, v);
                untreated += outcome_risk(0.0, l, w, v);
                counted += 1;
            }
        }

        let dataset = Dataset::from_records(column_roles(), &COVARIATES, &records)?;
        log::info!(
            "Generated {} records from seed {} ({} population records).",
            dataset.len(),
            self.seed,
            counted
        );
        Ok(SyntheticStudy {
            dataset,
            true_risk_treated: treated / counted as f64,
            true_risk_untreated: untreated / counted as f64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::partition;

    #[test]
    fn test_same_seed_same_study() {
        let first = SyntheticStudyBuilder::new(500).seed(5).build().unwrap();
        let second = SyntheticStudyBuilder::new(500).seed(5).build().unwrap();
        assert_eq!(first.dataset.outcome().len(), 500);
        for row in 0..500 {
            assert_eq!(first.dataset.is_sample(row), second.dataset.is_sample(row));
        }
        assert_eq!(first.true_risk_treated, second.true_risk_treated);
    }

    #[test]
    fn test_sample_fraction_and_effect_modification() {
        let study = SyntheticStudyBuilder::new(3000).build().unwrap();
        let split = partition(&study.dataset).unwrap();
        let fraction = split.n_sample() as f64 / 3000.0;
        assert!(fraction > 0.1 && fraction < 0.3, "sample fraction {fraction}");
        assert!(study.true_risk_difference() > 0.0);
        assert!(study.true_risk_ratio() > 1.0);
    }

    #[test]
    fn test_no_selection_keeps_distributions_aligned() {
        let study = SyntheticStudyBuilder::new(4000)
            .selection_strength(0.0)
            .build()
            .unwrap();
        let split = partition(&study.dataset).unwrap();
        let mean_l = |rows: &crate::data::Subset<'_>| {
            crate::test_fixtures::covariate(rows, "L").mean().unwrap()
        };
        assert!((mean_l(split.sample()) - mean_l(split.target())).abs() < 0.1);
    }
}
