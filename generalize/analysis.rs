//! Runs a configured analysis end to end: load, partition, weight, estimate, bootstrap.

use crate::bootstrap::paired_bootstrap;
use crate::config::{AnalysisConfig, ConfigError, EstimatorKind};
use crate::data::{DataError, Dataset, load_dataset, partition};
use crate::estimators::{Aipsw, EstimationError, Estimator, GTransport, Ipsw};
use crate::report::{Report, ReportEntry, ReportError, WeightTable};
use crate::weights::{Iptw, TreatmentWeighter};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Data error: {0}")]
    Data(#[from] DataError),
    #[error("Estimation error: {0}")]
    Estimation(#[from] EstimationError),
    #[error("Output error: {0}")]
    Report(#[from] ReportError),
}

/// Loads the configured data file and analyzes it.
pub fn run_analysis(config: &AnalysisConfig) -> Result<Report, AnalysisError> {
    let data = load_dataset(&config.data.path, &config.columns, config.separator()?)?;
    analyze(&data, config)
}

fn treatment_weighter(config: &AnalysisConfig) -> Option<Iptw> {
    config.treatment_model.as_ref().map(|model| {
        Iptw::new(model.terms.clone())
            .with_fitter(config.fit)
            .stabilized(model.stabilized)
    })
}

fn missing(kind: EstimatorKind, model: &'static str) -> ConfigError {
    ConfigError::MissingModel {
        estimator: kind.name(),
        model,
    }
}

fn build_estimator(
    kind: EstimatorKind,
    config: &AnalysisConfig,
) -> Result<Box<dyn Estimator>, ConfigError> {
    let sampling = || {
        config
            .sampling_model
            .clone()
            .ok_or_else(|| missing(kind, "sampling_model"))
    };
    let outcome = || {
        config
            .outcome_model
            .clone()
            .ok_or_else(|| missing(kind, "outcome_model"))
    };
    let estimator: Box<dyn Estimator> = match kind {
        EstimatorKind::Ipsw => Box::new(
            Ipsw::new(sampling()?)
                .with_fitter(config.fit)
                .with_population(config.population)
                .stabilized(config.stabilized_weights),
        ),
        EstimatorKind::GTransport => Box::new(
            GTransport::new(outcome()?)
                .with_fitter(config.fit)
                .with_population(config.population),
        ),
        EstimatorKind::Aipsw => Box::new(
            Aipsw::new(sampling()?, outcome()?)
                .with_fitter(config.fit)
                .with_population(config.population)
                .stabilized(config.stabilized_weights),
        ),
    };
    Ok(estimator)
}

/// Runs every configured estimator on an in-memory dataset.
pub fn analyze(data: &Dataset, config: &AnalysisConfig) -> Result<Report, AnalysisError> {
    config.validate()?;
    let mut split = partition(data)?;
    log::info!(
        "Partitioned {} records into {} sample and {} target records.",
        data.len(),
        split.n_sample(),
        split.n_target()
    );

    let weighter = treatment_weighter(config);
    let treatment_weighting = match (&weighter, &config.columns.weight) {
        (Some(iptw), _) => {
            let weights = iptw.weights(split.sample())?;
            split = split.with_treatment_weights(weights)?;
            "IPTW".to_string()
        }
        (None, Some(column)) => format!("column '{column}'"),
        (None, None) => "none".to_string(),
    };

    let mut entries = Vec::with_capacity(config.estimators.len());
    for &kind in &config.estimators {
        let estimator = build_estimator(kind, config)?;
        let estimate = estimator.estimate(&split)?;
        log::info!(
            "{}: RD = {:.4}, RR = {:.4}",
            estimator.name(),
            estimate.risk_difference,
            estimate.risk_ratio
        );
        let bootstrap = match &config.bootstrap {
            Some(settings) => Some(paired_bootstrap(
                estimator.as_ref(),
                &split,
                weighter.as_ref().map(|w| w as &dyn TreatmentWeighter),
                &estimate,
                settings,
            )?),
            None => None,
        };
        entries.push(ReportEntry {
            estimator: estimator.name().to_string(),
            estimate,
            bootstrap,
        });
    }

    Ok(Report {
        population: config.population,
        n_sample: split.n_sample(),
        n_target: split.n_target(),
        treatment_weighting,
        entries,
    })
}

/// The IPSW weights of every sample record under the configured sampling model.
pub fn sampling_weight_table(
    data: &Dataset,
    config: &AnalysisConfig,
) -> Result<WeightTable, AnalysisError> {
    let model = config
        .sampling_model
        .clone()
        .ok_or_else(|| missing(EstimatorKind::Ipsw, "sampling_model"))?;
    let mut split = partition(data)?;
    if let Some(iptw) = treatment_weighter(config) {
        let weights = iptw.weights(split.sample())?;
        split = split.with_treatment_weights(weights)?;
    }
    let ipsw = Ipsw::new(model)
        .with_fitter(config.fit)
        .with_population(config.population)
        .stabilized(config.stabilized_weights);
    let weights = ipsw.weights(&split)?;
    let ids = split
        .sample()
        .ids()
        .into_iter()
        .map(str::to_string)
        .collect();
    let treatment = split.treatment_weights().map(|w| w.to_vec());
    Ok(WeightTable::new(ids, &weights, treatment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::BootstrapConfig;
    use crate::config::{DataConfig, TreatmentModelConfig};
    use crate::estimators::Population;
    use crate::fit::IrlsFitter;
    use crate::formula::{ModelSpec, Term};
    use crate::test_fixtures::{cell_study, confounded_cells, roles};
    use approx::assert_abs_diff_eq;
    use std::path::PathBuf;

    fn config() -> AnalysisConfig {
        AnalysisConfig {
            population: Population::Transport,
            estimators: vec![
                EstimatorKind::Ipsw,
                EstimatorKind::GTransport,
                EstimatorKind::Aipsw,
            ],
            sampling_model: Some(ModelSpec::main_effects(&["L"]).unwrap()),
            outcome_model: Some(
                ModelSpec::new(vec![
                    Term::main("A"),
                    Term::main("L"),
                    Term::interaction("A", "L"),
                ])
                .unwrap(),
            ),
            stabilized_weights: false,
            data: DataConfig {
                path: PathBuf::from("unused.tsv"),
                separator: '\t',
            },
            columns: roles(),
            treatment_model: None,
            fit: IrlsFitter::default(),
            bootstrap: None,
        }
    }

    #[test]
    fn test_all_estimators_agree_on_saturated_cells() {
        let data = cell_study();
        let report = analyze(&data, &config()).unwrap();
        assert_eq!(report.entries.len(), 3);
        assert_eq!((report.n_sample, report.n_target), (100, 200));
        for entry in &report.entries {
            assert_abs_diff_eq!(entry.estimate.risk_difference, 0.125, epsilon = 1e-6);
            assert!(entry.bootstrap.is_none());
        }
        assert_eq!(report.treatment_weighting, "none");
    }

    #[test]
    fn test_iptw_weighting_and_bootstrap() {
        let data = confounded_cells();
        let mut settings = config();
        settings.estimators = vec![EstimatorKind::Ipsw];
        settings.treatment_model = Some(TreatmentModelConfig {
            terms: ModelSpec::main_effects(&["L"]).unwrap(),
            stabilized: true,
        });
        settings.bootstrap = Some(BootstrapConfig {
            replicates: 20,
            ..BootstrapConfig::default()
        });

        let report = analyze(&data, &settings).unwrap();
        assert_eq!(report.treatment_weighting, "IPTW");
        let ipsw = report.entry("IPSW").unwrap();
        assert_abs_diff_eq!(ipsw.estimate.risk_treated, 0.45, epsilon = 1e-6);
        let summary = ipsw.bootstrap.as_ref().unwrap();
        assert_eq!(summary.replicates, 20);
        assert!(summary.risk_difference_se.is_finite());
    }

    #[test]
    fn test_weight_table_matches_sample_order() {
        let data = cell_study();
        let table = sampling_weight_table(&data, &config()).unwrap();
        assert_eq!(table.ids.len(), 100);
        assert_eq!(table.ids[0], "s0");
        assert_abs_diff_eq!(table.combined_weights[0], 3.75, epsilon = 1e-6);
        assert!(table.treatment_weights.is_none());
    }

    #[test]
    fn test_invalid_configuration_is_rejected_before_estimation() {
        let data = cell_study();
        let mut settings = config();
        settings.outcome_model = None;
        let err = analyze(&data, &settings).unwrap_err();
        assert!(matches!(
            err,
            AnalysisError::Config(ConfigError::MissingModel { .. })
        ));
    }
}
