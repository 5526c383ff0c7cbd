//! Analysis results: console rendering, TOML persistence and weight export.

use crate::bootstrap::{BootstrapSummary, Interval};
use crate::estimators::{Estimate, IpswWeights, Population};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write output file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to serialize report to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Failed to write weight table: {0}")]
    CsvError(#[from] csv::Error),
}

/// One estimator's point estimate and, when requested, its bootstrap summary.
#[derive(Debug, Clone, Serialize)]
pub struct ReportEntry {
    pub estimator: String,
    pub estimate: Estimate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<BootstrapSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub population: Population,
    pub n_sample: usize,
    pub n_target: usize,
    /// Where treatment weights came from: "none", "IPTW" or the weight column.
    pub treatment_weighting: String,
    pub entries: Vec<ReportEntry>,
}

impl Report {
    pub fn entry(&self, estimator: &str) -> Option<&ReportEntry> {
        self.entries.iter().find(|e| e.estimator == estimator)
    }

    /// Saves the report as TOML.
    pub fn save(&self, path: &Path) -> Result<(), ReportError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }
}

fn interval(i: Option<Interval>) -> String {
    match i {
        Some(i) => format!("[{:.4}, {:.4}]", i.lower, i.upper),
        None => "-".to_string(),
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let population = match self.population {
            Population::Transport => "transport (target records only)",
            Population::Generalize => "generalize (sample and target records)",
        };
        writeln!(f, "Population:        {population}")?;
        writeln!(
            f,
            "Records:           {} sample, {} target",
            self.n_sample, self.n_target
        )?;
        writeln!(f, "Treatment weights: {}", self.treatment_weighting)?;
        writeln!(f)?;
        writeln!(
            f,
            "{:<12} {:>9} {:>9} {:>9} {:<20} {:>9} {:<20} {:>9}",
            "Estimator", "Risk A=1", "Risk A=0", "RD", "RD 95% CI", "RR", "RR 95% CI", "Undefined"
        )?;
        for entry in &self.entries {
            let e = &entry.estimate;
            let boot = entry.bootstrap.as_ref();
            writeln!(
                f,
                "{:<12} {:>9.4} {:>9.4} {:>9.4} {:<20} {:>9.4} {:<20} {:>9}",
                entry.estimator,
                e.risk_treated,
                e.risk_untreated,
                e.risk_difference,
                interval(boot.map(|b| b.risk_difference_interval)),
                e.risk_ratio,
                interval(boot.map(|b| b.risk_ratio_interval)),
                boot.map_or("-".to_string(), |b| format!("{}/{}", b.undefined, b.replicates)),
            )?;
        }
        Ok(())
    }
}

/// Per-record sampling weights for export.
#[derive(Debug, Clone)]
pub struct WeightTable {
    pub ids: Vec<String>,
    pub probabilities: Vec<f64>,
    pub sampling_weights: Vec<f64>,
    pub treatment_weights: Option<Vec<f64>>,
    pub combined_weights: Vec<f64>,
}

impl WeightTable {
    pub fn new(ids: Vec<String>, weights: &IpswWeights, treatment: Option<Vec<f64>>) -> Self {
        Self {
            ids,
            probabilities: weights.sampling.probabilities.to_vec(),
            sampling_weights: weights.sampling.weights.to_vec(),
            treatment_weights: treatment,
            combined_weights: weights.combined.to_vec(),
        }
    }

    /// Writes one tab-separated row per sample record.
    pub fn save_tsv(&self, path: &Path) -> Result<(), ReportError> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(path)?;
        let mut header = vec!["id", "sampling_probability", "sampling_weight"];
        if self.treatment_weights.is_some() {
            header.push("treatment_weight");
        }
        header.push("weight");
        writer.write_record(&header)?;

        for (i, id) in self.ids.iter().enumerate() {
            let mut row = vec![
                id.clone(),
                self.probabilities[i].to_string(),
                self.sampling_weights[i].to_string(),
            ];
            if let Some(t) = &self.treatment_weights {
                row.push(t[i].to_string());
            }
            row.push(self.combined_weights[i].to_string());
            writer.write_record(&row)?;
        }
        writer.flush()?;
        Ok(())
    }
}
