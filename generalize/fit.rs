//! # Regression Fitting
//!
//! Every estimator in this crate reduces to a handful of generalized linear model fits
//! (sample membership, outcome, treatment). The fitting itself is an injected capability,
//! [`RegressionFitter`], so estimators can be exercised with fixed coefficients in tests.
//!
//! The default fitter, [`IrlsFitter`], runs iteratively reweighted least squares:
//!
//! 1.  Compute the mean, working weights and working response from the current linear
//!     predictor.
//! 2.  Solve the weighted normal equations `X'WX beta = X'Wz`.
//! 3.  Halve the step while the deviance increases, then test the relative deviance change.

use crate::data::Subset;
use crate::estimators::EstimationError;
use crate::formula::{FormulaError, ModelSpec, TreatmentLevel};
use ndarray::{Array1, ArrayView1, ArrayView2};
use ndarray_linalg::Solve;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Defines the link function, connecting the linear predictor to the mean response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkFunction {
    /// The logit link, for binary outcomes (logistic regression).
    Logit,
    /// The identity link, for continuous outcomes (linear regression).
    Identity,
}

impl LinkFunction {
    /// Logit when every value is 0 or 1, identity otherwise.
    pub fn detect(y: ArrayView1<f64>) -> Self {
        if y.iter().all(|&v| v == 0.0 || v == 1.0) {
            LinkFunction::Logit
        } else {
            LinkFunction::Identity
        }
    }

    /// Maps a linear predictor to the mean scale. The logistic mean is not clamped, so an
    /// extreme predictor yields exactly 0 or 1.
    pub fn inverse(self, eta: f64) -> f64 {
        match self {
            LinkFunction::Logit => 1.0 / (1.0 + (-eta).exp()),
            LinkFunction::Identity => eta,
        }
    }
}

#[derive(Error, Debug)]
pub enum FitError {
    #[error("The design matrix has no rows.")]
    EmptyDesign,
    #[error("The design matrix has {rows} rows but the response has {response} values.")]
    DimensionMismatch { rows: usize, response: usize },
    #[error("The design matrix has {rows} rows but {weights} prior weights were given.")]
    WeightLengthMismatch { rows: usize, weights: usize },
    #[error(
        "The weighted normal equations could not be solved. The design may be rank deficient (e.g. a constant term). Error: {0}"
    )]
    LinearSystemSolveFailed(ndarray_linalg::error::LinalgError),
    #[error(
        "Non-finite coefficients appeared at IRLS iteration {iteration}. The model may be separated or collinear."
    )]
    NonFiniteCoefficients { iteration: usize },
}

/// The injected regression capability: (design, response, optional prior weights, link)
/// to a coefficient vector with one entry per design column.
pub trait RegressionFitter: Sync {
    fn fit(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        weights: Option<ArrayView1<f64>>,
        link: LinkFunction,
    ) -> Result<Array1<f64>, FitError>;
}

impl<F: RegressionFitter + ?Sized> RegressionFitter for &F {
    fn fit(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        weights: Option<ArrayView1<f64>>,
        link: LinkFunction,
    ) -> Result<Array1<f64>, FitError> {
        (**self).fit(x, y, weights, link)
    }
}

/// The status of IRLS convergence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrlsStatus {
    /// Converged successfully within tolerance.
    Converged,
    /// Reached maximum iterations without converging.
    MaxIterationsReached,
}

/// Holds the result of an IRLS fit.
#[derive(Clone, Debug)]
pub struct IrlsResult {
    pub beta: Array1<f64>,
    /// Binomial deviance for the logit link, weighted residual sum of squares for identity.
    pub deviance: f64,
    pub iterations: usize,
    pub status: IrlsStatus,
}

/// Iteratively reweighted least squares for unpenalized GLMs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IrlsFitter {
    pub max_iterations: usize,
    /// Relative deviance change below which the fit is considered converged.
    pub convergence_tolerance: f64,
}

impl Default for IrlsFitter {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            convergence_tolerance: 1e-10,
        }
    }
}

const MAX_STEP_HALVINGS: usize = 30;

impl IrlsFitter {
    pub fn fit_detailed(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        weights: Option<ArrayView1<f64>>,
        link: LinkFunction,
    ) -> Result<IrlsResult, FitError> {
        let n = x.nrows();
        if n == 0 {
            return Err(FitError::EmptyDesign);
        }
        if y.len() != n {
            return Err(FitError::DimensionMismatch {
                rows: n,
                response: y.len(),
            });
        }
        let prior = match weights {
            Some(w) if w.len() != n => {
                return Err(FitError::WeightLengthMismatch {
                    rows: n,
                    weights: w.len(),
                });
            }
            Some(w) => w.to_owned(),
            None => Array1::ones(n),
        };

        let mut beta = Array1::<f64>::zeros(x.ncols());
        let mut eta = x.dot(&beta);
        let mut deviance = calculate_deviance(y, &mean_response(&eta, link), link, prior.view());

        for iteration in 1..=self.max_iterations {
            let (_, working_weights, z) = update_glm_vectors(y, &eta, link, prior.view());

            let xtw = &x.t() * &working_weights;
            let xtwx = xtw.dot(&x);
            let xtwz = xtw.dot(&z);
            let mut candidate = xtwx
                .solve_into(xtwz)
                .map_err(FitError::LinearSystemSolveFailed)?;
            if candidate.iter().any(|b| !b.is_finite()) {
                log::error!("Non-finite beta values at iteration {iteration}: {candidate:?}");
                return Err(FitError::NonFiniteCoefficients { iteration });
            }

            let mut candidate_eta = x.dot(&candidate);
            let mut candidate_deviance =
                calculate_deviance(y, &mean_response(&candidate_eta, link), link, prior.view());

            let mut halvings = 0;
            while (!candidate_deviance.is_finite() || candidate_deviance > deviance)
                && halvings < MAX_STEP_HALVINGS
            {
                candidate = (&beta + &candidate) * 0.5;
                candidate_eta = x.dot(&candidate);
                candidate_deviance = calculate_deviance(
                    y,
                    &mean_response(&candidate_eta, link),
                    link,
                    prior.view(),
                );
                halvings += 1;
            }
            if halvings > 0 {
                log::debug!("IRLS iteration {iteration}: step halved {halvings} times");
            }

            let change = (deviance - candidate_deviance).abs();
            beta = candidate;
            eta = candidate_eta;
            deviance = candidate_deviance;

            log::trace!(
                "IRLS iteration {iteration}: deviance = {deviance:.10e}, change = {change:.3e}"
            );

            if change <= self.convergence_tolerance * (deviance.abs() + 0.1) {
                return Ok(IrlsResult {
                    beta,
                    deviance,
                    iterations: iteration,
                    status: IrlsStatus::Converged,
                });
            }
        }

        log::warn!(
            "IRLS did not converge after {} iterations (deviance {:.6e}).",
            self.max_iterations,
            deviance
        );
        Ok(IrlsResult {
            beta,
            deviance,
            iterations: self.max_iterations,
            status: IrlsStatus::MaxIterationsReached,
        })
    }
}

impl RegressionFitter for IrlsFitter {
    fn fit(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        weights: Option<ArrayView1<f64>>,
        link: LinkFunction,
    ) -> Result<Array1<f64>, FitError> {
        self.fit_detailed(x, y, weights, link).map(|result| result.beta)
    }
}

fn mean_response(eta: &Array1<f64>, link: LinkFunction) -> Array1<f64> {
    eta.mapv(|e| link.inverse(e))
}

/// Mean, total working weights (prior times IRLS weights) and working response.
pub fn update_glm_vectors(
    y: ArrayView1<f64>,
    eta: &Array1<f64>,
    link: LinkFunction,
    prior_weights: ArrayView1<f64>,
) -> (Array1<f64>, Array1<f64>, Array1<f64>) {
    const MIN_WEIGHT: f64 = 1e-10;
    const PROB_EPS: f64 = 1e-12;

    match link {
        LinkFunction::Logit => {
            let eta_clamped = eta.mapv(|e| e.clamp(-700.0, 700.0));
            let mut mu = eta_clamped.mapv(|e| link.inverse(e));
            mu.mapv_inplace(|v| v.clamp(PROB_EPS, 1.0 - PROB_EPS));
            let irls_weights = (&mu * (1.0 - &mu)).mapv(|v| v.max(MIN_WEIGHT));

            let residual = &y - &mu;
            let z = &eta_clamped + &(&residual / &irls_weights);
            let weights = &prior_weights * &irls_weights;

            (mu, weights, z)
        }
        LinkFunction::Identity => {
            let mu = eta.clone();
            // For the identity link the iterative weights are the prior weights.
            let weights = prior_weights.to_owned();
            let z = y.to_owned();
            (mu, weights, z)
        }
    }
}

pub fn calculate_deviance(
    y: ArrayView1<f64>,
    mu: &Array1<f64>,
    link: LinkFunction,
    prior_weights: ArrayView1<f64>,
) -> f64 {
    const EPS: f64 = 1e-12;
    match link {
        LinkFunction::Logit => {
            let total_residual = ndarray::Zip::from(y)
                .and(mu)
                .and(prior_weights)
                .fold(0.0, |acc, &yi, &mui, &wi| {
                    let mui_c = mui.clamp(EPS, 1.0 - EPS);
                    let term1 = if yi > EPS {
                        yi * (yi.ln() - mui_c.ln())
                    } else {
                        0.0
                    };
                    let term2 = if yi < 1.0 - EPS {
                        (1.0 - yi) * ((1.0 - yi).ln() - (1.0 - mui_c).ln())
                    } else {
                        0.0
                    };
                    acc + wi * (term1 + term2)
                });
            2.0 * total_residual
        }
        LinkFunction::Identity => ndarray::Zip::from(y)
            .and(mu)
            .and(prior_weights)
            .fold(0.0, |acc, &yi, &mui, &wi| acc + wi * (yi - mui) * (yi - mui)),
    }
}

/// A fitted regression over a [`ModelSpec`], owned by one estimation run.
#[derive(Debug, Clone)]
pub struct FittedModel {
    spec: ModelSpec,
    link: LinkFunction,
    coefficients: Array1<f64>,
}

impl FittedModel {
    /// Fits `response` on the design of `subset` (observed treatment values).
    pub fn fit<F: RegressionFitter + ?Sized>(
        fitter: &F,
        spec: &ModelSpec,
        subset: &Subset<'_>,
        response: ArrayView1<f64>,
        weights: Option<ArrayView1<f64>>,
        link: LinkFunction,
    ) -> Result<Self, EstimationError> {
        let x = spec.design(subset, TreatmentLevel::Observed)?;
        let coefficients = fitter.fit(x.view(), response, weights, link)?;
        Self::from_coefficients(spec.clone(), link, coefficients)
    }

    pub fn from_coefficients(
        spec: ModelSpec,
        link: LinkFunction,
        coefficients: Array1<f64>,
    ) -> Result<Self, EstimationError> {
        if coefficients.len() != spec.ncols() {
            return Err(EstimationError::CoefficientCount {
                expected: spec.ncols(),
                found: coefficients.len(),
            });
        }
        Ok(Self {
            spec,
            link,
            coefficients,
        })
    }

    pub fn coefficients(&self) -> ArrayView1<'_, f64> {
        self.coefficients.view()
    }

    pub fn link(&self) -> LinkFunction {
        self.link
    }

    /// Predicted means for every row of `subset`.
    pub fn predict(
        &self,
        subset: &Subset<'_>,
        level: TreatmentLevel,
    ) -> Result<Array1<f64>, FormulaError> {
        let x = self.spec.design(subset, level)?;
        let link = self.link;
        Ok(x.dot(&self.coefficients).mapv(|eta| link.inverse(eta)))
    }
}
