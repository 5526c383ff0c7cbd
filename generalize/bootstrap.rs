//! # Paired Bootstrap
//!
//! Standard errors and 95% intervals for any [`Estimator`]. Each replicate resamples the
//! sample view and the target view independently, with replacement and at their original
//! sizes, then re-runs the estimator on the resampled partition. When a treatment weighter
//! is given, treatment weights are re-estimated on every resampled sample. Otherwise the
//! input weights travel with their rows.
//!
//! Replicates run in parallel on the rayon pool. Replicate `b` draws from its own RNG seeded
//! from `(seed, b)`, so the result for a seed does not depend on thread scheduling.

use crate::data::Partition;
use crate::estimators::{Estimate, EstimationError, Estimator};
use crate::weights::TreatmentWeighter;
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Two-sided 95% standard normal quantile.
pub const Z_95: f64 = 1.96;

/// How the 95% interval is formed from the replicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalMethod {
    /// Point estimate plus or minus 1.96 bootstrap standard errors.
    #[default]
    Normal,
    /// 2.5th and 97.5th percentiles of the replicate estimates.
    Percentile,
}

/// What to do with replicates whose estimate is undefined, whose risk ratio is `0` or
/// infinite, or whose fit failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegeneratePolicy {
    /// Any undefined replicate makes the standard error and interval undefined.
    #[default]
    Propagate,
    /// Drop undefined replicates and summarize the rest.
    Discard,
    /// Draw an undefined replicate again, up to `max_attempts` more times, then propagate.
    Redraw { max_attempts: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BootstrapConfig {
    pub replicates: usize,
    pub seed: u64,
    pub interval: IntervalMethod,
    pub degenerate: DegeneratePolicy,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            replicates: 200,
            seed: 2021,
            interval: IntervalMethod::default(),
            degenerate: DegeneratePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Interval {
    pub lower: f64,
    pub upper: f64,
}

impl Interval {
    pub fn undefined() -> Self {
        Self {
            lower: f64::NAN,
            upper: f64::NAN,
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BootstrapSummary {
    pub replicates: usize,
    /// Replicates whose risk difference or log risk ratio was not finite after any redraws.
    pub undefined: usize,
    pub method: IntervalMethod,
    pub risk_difference_se: f64,
    /// Standard error of the log risk ratio.
    pub log_risk_ratio_se: f64,
    pub risk_difference_interval: Interval,
    pub risk_ratio_interval: Interval,
    /// The replicate risk differences in replicate order (`NaN` where undefined).
    #[serde(skip)]
    pub risk_differences: Vec<f64>,
}

/// Runs the paired bootstrap for `estimator` around its point estimate `point`.
pub fn paired_bootstrap<E: Estimator + ?Sized>(
    estimator: &E,
    partition: &Partition<'_>,
    weighter: Option<&dyn TreatmentWeighter>,
    point: &Estimate,
    config: &BootstrapConfig,
) -> Result<BootstrapSummary, EstimationError> {
    if config.replicates < 2 {
        return Err(EstimationError::InvalidBootstrap(format!(
            "at least 2 replicates are required to estimate a standard error, got {}",
            config.replicates
        )));
    }
    log::info!(
        "Running {} bootstrap replicates for {} (seed {}).",
        config.replicates,
        estimator.name(),
        config.seed
    );

    let extra_attempts = match config.degenerate {
        DegeneratePolicy::Redraw { max_attempts } => max_attempts,
        DegeneratePolicy::Propagate | DegeneratePolicy::Discard => 0,
    };
    let draws: Vec<Estimate> = (0..config.replicates)
        .into_par_iter()
        .map(|b| {
            let mut rng = StdRng::seed_from_u64(replicate_seed(config.seed, b));
            let mut estimate = draw_replicate(estimator, partition, weighter, &mut rng);
            let mut attempt = 0;
            while !is_usable(&estimate) && attempt < extra_attempts {
                attempt += 1;
                estimate = draw_replicate(estimator, partition, weighter, &mut rng);
            }
            estimate
        })
        .collect();

    let undefined = draws.iter().filter(|e| !is_usable(e)).count();
    if undefined > 0 {
        log::warn!(
            "{undefined} of {} bootstrap replicates for {} were undefined.",
            config.replicates,
            estimator.name()
        );
    }

    // Both summaries are taken over the same replicates.
    let kept: Vec<&Estimate> = if config.degenerate == DegeneratePolicy::Discard {
        draws.iter().filter(|e| is_usable(e)).collect()
    } else if undefined == 0 {
        draws.iter().collect()
    } else {
        Vec::new()
    };
    let rd = summarize(kept.iter().map(|e| e.risk_difference).collect());
    let log_rr = summarize(kept.iter().map(|e| e.risk_ratio.ln()).collect());
    let risk_differences: Vec<f64> = draws.iter().map(|e| e.risk_difference).collect();

    let (risk_difference_interval, risk_ratio_interval) = match config.interval {
        IntervalMethod::Normal => (
            normal_interval(point.risk_difference, rd.standard_error),
            exp_interval(normal_interval(
                point.risk_ratio.ln(),
                log_rr.standard_error,
            )),
        ),
        IntervalMethod::Percentile => (rd.percentile, exp_interval(log_rr.percentile)),
    };

    Ok(BootstrapSummary {
        replicates: config.replicates,
        undefined,
        method: config.interval,
        risk_difference_se: rd.standard_error,
        log_risk_ratio_se: log_rr.standard_error,
        risk_difference_interval,
        risk_ratio_interval,
        risk_differences,
    })
}

/// One resample-and-estimate pass. A failed fit inside a replicate yields an undefined
/// estimate rather than aborting the whole bootstrap.
fn draw_replicate<E: Estimator + ?Sized>(
    estimator: &E,
    partition: &Partition<'_>,
    weighter: Option<&dyn TreatmentWeighter>,
    rng: &mut StdRng,
) -> Estimate {
    let (n_sample, n_target) = (partition.n_sample(), partition.n_target());
    let sample_positions: Vec<usize> = (0..n_sample).map(|_| rng.gen_range(0..n_sample)).collect();
    let target_positions: Vec<usize> = (0..n_target).map(|_| rng.gen_range(0..n_target)).collect();

    match resample_and_estimate(
        estimator,
        partition,
        weighter,
        &sample_positions,
        &target_positions,
    ) {
        Ok(estimate) => estimate,
        Err(e) => {
            log::debug!("Bootstrap replicate failed and is treated as undefined: {e}");
            Estimate::undefined(n_sample, n_target)
        }
    }
}

fn resample_and_estimate<E: Estimator + ?Sized>(
    estimator: &E,
    partition: &Partition<'_>,
    weighter: Option<&dyn TreatmentWeighter>,
    sample_positions: &[usize],
    target_positions: &[usize],
) -> Result<Estimate, EstimationError> {
    let sample = partition.sample().select(sample_positions);
    let target = partition.target().select(target_positions);
    let weights = match weighter {
        Some(weighter) => Some(weighter.weights(&sample)?),
        None => partition
            .treatment_weights()
            .map(|w| sample_positions.iter().map(|&p| w[p]).collect::<Array1<f64>>()),
    };
    let resampled = Partition::new(sample, target, weights)?;
    estimator.estimate(&resampled)
}

/// Spreads `(seed, replicate)` over the full seed space (splitmix64 finalizer).
fn replicate_seed(seed: u64, replicate: usize) -> u64 {
    let mut z = seed.wrapping_add((replicate as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

struct Spread {
    standard_error: f64,
    percentile: Interval,
}

/// A replicate enters the summaries only when both its risk difference and its log risk
/// ratio are finite. A zero risk in either arm leaves the risk difference finite but not
/// the log risk ratio.
fn is_usable(estimate: &Estimate) -> bool {
    estimate.is_defined() && estimate.risk_ratio.ln().is_finite()
}

fn summarize(mut kept: Vec<f64>) -> Spread {
    if kept.len() < 2 {
        return Spread {
            standard_error: f64::NAN,
            percentile: Interval::undefined(),
        };
    }
    kept.sort_by(f64::total_cmp);
    Spread {
        standard_error: sample_std(&kept),
        percentile: Interval {
            lower: quantile(&kept, 0.025),
            upper: quantile(&kept, 0.975),
        },
    }
}

/// Standard deviation with the `n - 1` divisor.
fn sample_std(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let ss: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
    (ss / (n - 1.0)).sqrt()
}

/// Linearly interpolated quantile of sorted values.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let h = (sorted.len() - 1) as f64 * q;
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

fn normal_interval(center: f64, standard_error: f64) -> Interval {
    Interval {
        lower: center - Z_95 * standard_error,
        upper: center + Z_95 * standard_error,
    }
}

fn exp_interval(log_scale: Interval) -> Interval {
    Interval {
        lower: log_scale.lower.exp(),
        upper: log_scale.upper.exp(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::partition;
    use crate::estimators::{GTransport, Ipsw};
    use crate::formula::{ModelSpec, Term};
    use crate::test_fixtures::{FailingFitter, cell_study, confounded_cells};
    use crate::weights::{Iptw, TreatmentWeighter};
    use approx::assert_abs_diff_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ipsw() -> Ipsw {
        Ipsw::new(ModelSpec::main_effects(&["L"]).unwrap())
    }

    fn config(replicates: usize, seed: u64) -> BootstrapConfig {
        BootstrapConfig {
            replicates,
            seed,
            ..BootstrapConfig::default()
        }
    }

    /// Undefined whenever the first resampled sample row is even.
    struct CoinFlipEstimator;

    impl Estimator for CoinFlipEstimator {
        fn name(&self) -> &'static str {
            "coin flip"
        }

        fn estimate(&self, partition: &Partition<'_>) -> Result<Estimate, EstimationError> {
            let sample = partition.sample();
            if sample.rows()[0] % 2 == 0 {
                return Ok(Estimate::undefined(sample.len(), partition.n_target()));
            }
            let mean = sample.outcome().mean().unwrap_or(f64::NAN);
            Ok(Estimate::from_arm_risks(
                mean,
                0.5,
                sample.len(),
                partition.n_target(),
            ))
        }
    }

    /// Zero risk among the untreated whenever the first resampled sample row is even, which
    /// leaves the risk difference finite and the risk ratio infinite.
    struct ZeroRiskEstimator;

    impl Estimator for ZeroRiskEstimator {
        fn name(&self) -> &'static str {
            "zero risk"
        }

        fn estimate(&self, partition: &Partition<'_>) -> Result<Estimate, EstimationError> {
            let sample = partition.sample();
            let mean = sample.outcome().mean().unwrap_or(f64::NAN);
            let untreated = if sample.rows()[0] % 2 == 0 { 0.0 } else { 0.5 };
            Ok(Estimate::from_arm_risks(
                mean,
                untreated,
                sample.len(),
                partition.n_target(),
            ))
        }
    }

    /// Always undefined, counting how often it was asked.
    struct NeverDefinedEstimator {
        calls: AtomicUsize,
    }

    impl Estimator for NeverDefinedEstimator {
        fn name(&self) -> &'static str {
            "never defined"
        }

        fn estimate(&self, partition: &Partition<'_>) -> Result<Estimate, EstimationError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(Estimate::undefined(partition.n_sample(), partition.n_target()))
        }
    }

    #[test]
    fn test_same_seed_gives_identical_replicates() {
        let data = cell_study();
        let split = partition(&data).unwrap();
        let estimator = ipsw();
        let point = estimator.estimate(&split).unwrap();

        let first = paired_bootstrap(&estimator, &split, None, &point, &config(40, 7)).unwrap();
        let second = paired_bootstrap(&estimator, &split, None, &point, &config(40, 7)).unwrap();
        assert_eq!(first.risk_differences, second.risk_differences);
        assert_eq!(first.risk_difference_se, second.risk_difference_se);

        let other = paired_bootstrap(&estimator, &split, None, &point, &config(40, 8)).unwrap();
        assert_ne!(first.risk_differences, other.risk_differences);
    }

    #[test]
    fn test_result_does_not_depend_on_thread_count() {
        let data = cell_study();
        let split = partition(&data).unwrap();
        let estimator = ipsw();
        let point = estimator.estimate(&split).unwrap();

        let parallel = paired_bootstrap(&estimator, &split, None, &point, &config(30, 3)).unwrap();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .unwrap();
        let serial = pool
            .install(|| paired_bootstrap(&estimator, &split, None, &point, &config(30, 3)))
            .unwrap();
        assert_eq!(parallel.risk_differences, serial.risk_differences);
    }

    #[test]
    fn test_normal_interval_is_symmetric_around_point() {
        let data = cell_study();
        let split = partition(&data).unwrap();
        let estimator = ipsw();
        let point = estimator.estimate(&split).unwrap();
        let summary = paired_bootstrap(&estimator, &split, None, &point, &config(100, 1)).unwrap();

        let se = summary.risk_difference_se;
        assert!(se > 0.0 && se.is_finite());
        let interval = summary.risk_difference_interval;
        assert_abs_diff_eq!(interval.upper - point.risk_difference, Z_95 * se, epsilon = 1e-12);
        assert_abs_diff_eq!(point.risk_difference - interval.lower, Z_95 * se, epsilon = 1e-12);

        let rr = summary.risk_ratio_interval;
        assert_abs_diff_eq!(
            (rr.upper / point.risk_ratio).ln(),
            Z_95 * summary.log_risk_ratio_se,
            epsilon = 1e-10
        );
        assert_eq!(summary.undefined, 0);
    }

    #[test]
    fn test_percentile_interval_lies_within_replicates() {
        let data = cell_study();
        let split = partition(&data).unwrap();
        let estimator = ipsw();
        let point = estimator.estimate(&split).unwrap();
        let settings = BootstrapConfig {
            interval: IntervalMethod::Percentile,
            ..config(100, 2)
        };
        let summary = paired_bootstrap(&estimator, &split, None, &point, &settings).unwrap();

        let min = summary
            .risk_differences
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min);
        let max = summary
            .risk_differences
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        let interval = summary.risk_difference_interval;
        assert!(min <= interval.lower && interval.lower < interval.upper && interval.upper <= max);
        assert_eq!(summary.method, IntervalMethod::Percentile);
    }

    #[test]
    fn test_too_few_replicates_rejected() {
        let data = cell_study();
        let split = partition(&data).unwrap();
        let estimator = ipsw();
        let point = estimator.estimate(&split).unwrap();
        let err = paired_bootstrap(&estimator, &split, None, &point, &config(1, 1)).unwrap_err();
        assert!(matches!(err, EstimationError::InvalidBootstrap(_)));
    }

    #[test]
    fn test_degenerate_policies() {
        let data = cell_study();
        let split = partition(&data).unwrap();
        let point = Estimate::from_arm_risks(0.4, 0.5, split.n_sample(), split.n_target());

        let propagated =
            paired_bootstrap(&CoinFlipEstimator, &split, None, &point, &config(60, 4)).unwrap();
        assert!(propagated.undefined > 0);
        assert!(propagated.risk_difference_se.is_nan());
        assert!(propagated.risk_difference_interval.lower.is_nan());

        let discard = BootstrapConfig {
            degenerate: DegeneratePolicy::Discard,
            ..config(60, 4)
        };
        let discarded =
            paired_bootstrap(&CoinFlipEstimator, &split, None, &point, &discard).unwrap();
        assert_eq!(discarded.undefined, propagated.undefined);
        assert!(discarded.risk_difference_se.is_finite());

        let redraw = BootstrapConfig {
            degenerate: DegeneratePolicy::Redraw { max_attempts: 60 },
            ..config(60, 4)
        };
        let redrawn = paired_bootstrap(&CoinFlipEstimator, &split, None, &point, &redraw).unwrap();
        assert_eq!(redrawn.undefined, 0);
        assert!(redrawn.risk_difference_se.is_finite());
    }

    #[test]
    fn test_infinite_risk_ratio_replicates_are_degenerate() {
        let data = cell_study();
        let split = partition(&data).unwrap();
        let point = Estimate::from_arm_risks(0.4, 0.5, split.n_sample(), split.n_target());

        let propagated =
            paired_bootstrap(&ZeroRiskEstimator, &split, None, &point, &config(60, 4)).unwrap();
        assert!(propagated.undefined > 0);
        assert!(propagated.risk_difference_se.is_nan());
        assert!(propagated.log_risk_ratio_se.is_nan());

        let discard = BootstrapConfig {
            degenerate: DegeneratePolicy::Discard,
            ..config(60, 4)
        };
        let discarded =
            paired_bootstrap(&ZeroRiskEstimator, &split, None, &point, &discard).unwrap();
        assert_eq!(discarded.undefined, propagated.undefined);
        assert!(discarded.log_risk_ratio_se.is_finite());
        // Zero-risk replicates have RD equal to the sample mean, the rest sit near mean - 0.5.
        let usable: Vec<f64> = discarded
            .risk_differences
            .iter()
            .copied()
            .filter(|&rd| rd < 0.25)
            .collect();
        assert_eq!(usable.len(), 60 - discarded.undefined);
        assert_abs_diff_eq!(
            discarded.risk_difference_se,
            sample_std(&usable),
            epsilon = 1e-12
        );

        let redraw = BootstrapConfig {
            degenerate: DegeneratePolicy::Redraw { max_attempts: 60 },
            ..config(60, 4)
        };
        let redrawn = paired_bootstrap(&ZeroRiskEstimator, &split, None, &point, &redraw).unwrap();
        assert_eq!(redrawn.undefined, 0);
        assert!(redrawn.risk_ratio_interval.lower.is_finite());
    }

    #[test]
    fn test_redraw_gives_up_after_max_attempts() {
        let data = cell_study();
        let split = partition(&data).unwrap();
        let point = Estimate::from_arm_risks(0.4, 0.5, split.n_sample(), split.n_target());
        let estimator = NeverDefinedEstimator {
            calls: AtomicUsize::new(0),
        };
        let redraw = BootstrapConfig {
            degenerate: DegeneratePolicy::Redraw { max_attempts: 3 },
            ..config(10, 5)
        };

        let summary = paired_bootstrap(&estimator, &split, None, &point, &redraw).unwrap();
        assert_eq!(estimator.calls.load(Ordering::Relaxed), 10 * 4);
        assert_eq!(summary.undefined, 10);
        assert!(summary.risk_difference_se.is_nan());
        assert!(summary.risk_ratio_interval.upper.is_nan());
    }

    #[test]
    fn test_fit_failures_count_as_undefined_replicates() {
        let data = cell_study();
        let split = partition(&data).unwrap();
        let model = ModelSpec::new(vec![Term::main("A"), Term::main("L")]).unwrap();
        let estimator = GTransport::new(model).with_fitter(FailingFitter);
        let point = Estimate::undefined(split.n_sample(), split.n_target());

        let summary = paired_bootstrap(&estimator, &split, None, &point, &config(10, 1)).unwrap();
        assert_eq!(summary.undefined, 10);
        assert!(summary.risk_difference_se.is_nan());
    }

    #[test]
    fn test_treatment_weights_are_reestimated_per_replicate() {
        let data = confounded_cells();
        let split = partition(&data).unwrap();
        let iptw = Iptw::new(ModelSpec::main_effects(&["L"]).unwrap());
        let treatment_weights = iptw.weights(split.sample()).unwrap();
        let weighted = split.clone().with_treatment_weights(treatment_weights).unwrap();
        let estimator = ipsw();
        let point = estimator.estimate(&weighted).unwrap();

        let summary =
            paired_bootstrap(&estimator, &weighted, Some(&iptw), &point, &config(50, 9)).unwrap();
        assert_eq!(summary.undefined, 0);
        assert!(summary.risk_difference_se > 0.0);
        assert!(summary.risk_difference_interval.contains(point.risk_difference));
    }

    #[test]
    fn test_quantile_interpolates() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_abs_diff_eq!(quantile(&sorted, 0.5), 3.0);
        assert_abs_diff_eq!(quantile(&sorted, 0.025), 1.1, epsilon = 1e-12);
        assert_abs_diff_eq!(sample_std(&[1.0, 2.0, 3.0]), 1.0, epsilon = 1e-12);
    }
}
