#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

//! Generalizability and transportability of trial results.
//!
//! The crate takes a combined dataset (a sample with observed treatment and outcome, plus
//! covariate-only records from a target population) and estimates the risk difference and
//! risk ratio the treatment would have in the target population:
//!
//! - [`estimators::Ipsw`]: inverse probability of sampling weighting,
//! - [`estimators::GTransport`]: the g-transport (outcome standardization) formula,
//! - [`estimators::Aipsw`]: augmented IPSW, consistent if either model is correct.
//!
//! Sampling variability comes from [`bootstrap::paired_bootstrap`]. Non-randomized samples
//! are handled by [`weights::Iptw`], whose weights feed IPSW and AIPSW.

pub mod analysis;
pub mod bootstrap;
pub mod config;
pub mod data;
pub mod estimators;
pub mod fit;
pub mod formula;
pub mod report;
pub mod synthetic;
pub mod weights;

#[cfg(test)]
pub(crate) mod test_fixtures;

pub use analysis::{AnalysisError, analyze, run_analysis, sampling_weight_table};
pub use bootstrap::{BootstrapConfig, BootstrapSummary, paired_bootstrap};
pub use config::AnalysisConfig;
pub use data::{ColumnRoles, Dataset, Partition, Record, Subset, partition};
pub use estimators::{Aipsw, Estimate, Estimator, GTransport, Ipsw, Population};
pub use fit::{IrlsFitter, LinkFunction, RegressionFitter};
pub use formula::{ModelSpec, Term};
pub use weights::{Iptw, TreatmentWeighter};
