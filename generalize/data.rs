//! # Study Data Loading, Validation and Partitioning
//!
//! This module is the only entry point for user-provided study data. It reads a delimited
//! text file (tab-separated by default), validates it against the roles the user assigned to
//! its columns, and stores it column-wise as `ndarray` vectors.
//!
//! - Explicit Roles: the outcome, treatment and sample-indicator columns are named by
//!   [`ColumnRoles`]. Every other column is a covariate candidate. Non-numeric covariates are
//!   kept as markers and only rejected when a model actually references them.
//! - Structural Missingness: outcome and treatment must be observed for every sample record
//!   and absent for every target record. Any deviation is reported, never coerced.
//! - Immutable Views: [`partition`] splits a dataset into borrowed sample and target views.
//!   Bootstrap resamples are further views over the same rows, so the dataset is never copied.

use ndarray::{Array1, ArrayView1};
use polars::prelude::{
    CsvParseOptions, CsvReadOptions, CsvReader, DataFrame, DataType, PolarsError, SerReader,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Assigns analysis roles to the columns of a study file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnRoles {
    /// Unique record identifier. Sequential 1-based identifiers are generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub outcome: String,
    pub treatment: String,
    /// Sample-membership flag: 1 for sample (trial) records, 0 for target records.
    pub sample: String,
    /// Pre-computed treatment weight (IPTW) for observational samples.
    #[serde(default)]
    pub weight: Option<String>,
}

impl ColumnRoles {
    pub fn new(outcome: &str, treatment: &str, sample: &str) -> Self {
        Self {
            id: None,
            outcome: outcome.to_string(),
            treatment: treatment.to_string(),
            sample: sample.to_string(),
            weight: None,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_weight(mut self, weight: &str) -> Self {
        self.weight = Some(weight.to_string());
        self
    }

    /// Every column name that carries a role, in a stable order.
    fn role_names(&self) -> Vec<&str> {
        let mut names = vec![
            self.outcome.as_str(),
            self.treatment.as_str(),
            self.sample.as_str(),
        ];
        names.extend(self.id.as_deref());
        names.extend(self.weight.as_deref());
        names
    }
}

/// A covariate column as loaded from the input.
#[derive(Debug, Clone, PartialEq)]
pub enum CovariateColumn {
    /// Numeric values, with `NaN` marking missing entries.
    Numeric(Array1<f64>),
    /// A column that could not be read as numbers. Only an error if a model uses it.
    NonNumeric { found_type: String },
}

/// One individual, used to build a [`Dataset`] in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    pub in_sample: bool,
    pub outcome: Option<f64>,
    pub treatment: Option<f64>,
    pub weight: Option<f64>,
    /// Covariate values, in the order of the covariate names given to
    /// [`Dataset::from_records`]. `NaN` marks a missing value.
    pub covariates: Vec<f64>,
}

impl Record {
    /// A sample record with observed treatment and outcome.
    pub fn sample(id: &str, treatment: f64, outcome: f64, covariates: Vec<f64>) -> Self {
        Self {
            id: id.to_string(),
            in_sample: true,
            outcome: Some(outcome),
            treatment: Some(treatment),
            weight: None,
            covariates,
        }
    }

    /// A covariate-only target record.
    pub fn target(id: &str, covariates: Vec<f64>) -> Self {
        Self {
            id: id.to_string(),
            in_sample: false,
            outcome: None,
            treatment: None,
            weight: None,
            covariates,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }
}

/// A validated, column-oriented study dataset.
#[derive(Debug, Clone)]
pub struct Dataset {
    roles: ColumnRoles,
    ids: Vec<String>,
    in_sample: Vec<bool>,
    outcome: Array1<f64>,
    treatment: Array1<f64>,
    weight: Option<Array1<f64>>,
    covariates: Vec<(String, CovariateColumn)>,
}

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to write delimited output: {0}")]
    CsvError(#[from] csv::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The required column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Missing values were found in the required column '{0}'.")]
    MissingValuesFound(String),
    #[error("Column '{column}' has {found} values, but the dataset has {expected} records.")]
    LengthMismatch {
        column: String,
        expected: usize,
        found: usize,
    },
    #[error("Column '{column}' must contain only 0 or 1, but record '{id}' has value {value}.")]
    NonBinaryIndicator {
        column: String,
        id: String,
        value: f64,
    },
    #[error("Sample record '{id}' has no usable value in column '{column}'.")]
    MissingSampleValue { column: String, id: String },
    #[error(
        "Target record '{id}' has an observed value in column '{column}'. Outcome and treatment must be absent outside the sample."
    )]
    ObservedInTarget { column: String, id: String },
    #[error("Sample record '{id}' has a negative weight ({value}).")]
    NegativeWeight { id: String, value: f64 },
    #[error("The identifier '{0}' appears more than once.")]
    DuplicateId(String),
    #[error("The column name '{0}' is used more than once.")]
    DuplicateColumn(String),
    #[error("The {0} subset is empty. Both sample and target records are required.")]
    EmptySubset(&'static str),
}

impl Dataset {
    /// Builds a dataset from column vectors and validates every structural invariant.
    ///
    /// `sample_flag`, `outcome`, `treatment` and `weight` use `NaN` for missing entries.
    pub fn new(
        roles: ColumnRoles,
        ids: Vec<String>,
        sample_flag: Array1<f64>,
        outcome: Array1<f64>,
        treatment: Array1<f64>,
        weight: Option<Array1<f64>>,
        covariates: Vec<(String, CovariateColumn)>,
    ) -> Result<Self, DataError> {
        let n = ids.len();
        let check_len = |column: &str, found: usize| {
            if found == n {
                Ok(())
            } else {
                Err(DataError::LengthMismatch {
                    column: column.to_string(),
                    expected: n,
                    found,
                })
            }
        };
        check_len(&roles.sample, sample_flag.len())?;
        check_len(&roles.outcome, outcome.len())?;
        check_len(&roles.treatment, treatment.len())?;
        if let (Some(name), Some(values)) = (roles.weight.as_deref(), weight.as_ref()) {
            check_len(name, values.len())?;
        }
        for (name, column) in &covariates {
            if let CovariateColumn::Numeric(values) = column {
                check_len(name, values.len())?;
            }
        }

        let mut seen_columns: HashSet<&str> = HashSet::new();
        for name in roles
            .role_names()
            .into_iter()
            .chain(covariates.iter().map(|(name, _)| name.as_str()))
        {
            if !seen_columns.insert(name) {
                return Err(DataError::DuplicateColumn(name.to_string()));
            }
        }

        let mut seen_ids: HashSet<&str> = HashSet::with_capacity(n);
        for id in &ids {
            if !seen_ids.insert(id.as_str()) {
                return Err(DataError::DuplicateId(id.clone()));
            }
        }

        let mut in_sample = Vec::with_capacity(n);
        for (row, &flag) in sample_flag.iter().enumerate() {
            if flag.is_nan() {
                return Err(DataError::MissingValuesFound(roles.sample.clone()));
            }
            in_sample.push(internal::as_indicator(flag).ok_or_else(|| {
                DataError::NonBinaryIndicator {
                    column: roles.sample.clone(),
                    id: ids[row].clone(),
                    value: flag,
                }
            })?);
        }

        for row in 0..n {
            let id = &ids[row];
            if in_sample[row] {
                if !outcome[row].is_finite() {
                    return Err(DataError::MissingSampleValue {
                        column: roles.outcome.clone(),
                        id: id.clone(),
                    });
                }
                let a = treatment[row];
                if a.is_nan() {
                    return Err(DataError::MissingSampleValue {
                        column: roles.treatment.clone(),
                        id: id.clone(),
                    });
                }
                if internal::as_indicator(a).is_none() {
                    return Err(DataError::NonBinaryIndicator {
                        column: roles.treatment.clone(),
                        id: id.clone(),
                        value: a,
                    });
                }
                if let (Some(name), Some(values)) = (roles.weight.as_deref(), weight.as_ref()) {
                    let w = values[row];
                    if !w.is_finite() {
                        return Err(DataError::MissingSampleValue {
                            column: name.to_string(),
                            id: id.clone(),
                        });
                    }
                    if w < 0.0 {
                        return Err(DataError::NegativeWeight {
                            id: id.clone(),
                            value: w,
                        });
                    }
                }
            } else {
                for (column, values) in [(&roles.outcome, &outcome), (&roles.treatment, &treatment)]
                {
                    if !values[row].is_nan() {
                        return Err(DataError::ObservedInTarget {
                            column: column.clone(),
                            id: id.clone(),
                        });
                    }
                }
            }
        }

        // A weight column without a role would be an ordinary covariate.
        let weight = if roles.weight.is_some() { weight } else { None };

        Ok(Self {
            roles,
            ids,
            in_sample,
            outcome,
            treatment,
            weight,
            covariates,
        })
    }

    /// Builds a dataset from in-memory records.
    pub fn from_records(
        roles: ColumnRoles,
        covariate_names: &[&str],
        records: &[Record],
    ) -> Result<Self, DataError> {
        let n = records.len();
        let mut columns: Vec<Vec<f64>> = vec![Vec::with_capacity(n); covariate_names.len()];
        for record in records {
            if record.covariates.len() != covariate_names.len() {
                return Err(DataError::LengthMismatch {
                    column: format!("covariates of record '{}'", record.id),
                    expected: covariate_names.len(),
                    found: record.covariates.len(),
                });
            }
            for (column, &value) in columns.iter_mut().zip(&record.covariates) {
                column.push(value);
            }
        }

        let weight = roles.weight.as_ref().map(|_| {
            records
                .iter()
                .map(|r| r.weight.unwrap_or(f64::NAN))
                .collect::<Array1<f64>>()
        });

        Self::new(
            roles,
            records.iter().map(|r| r.id.clone()).collect(),
            records
                .iter()
                .map(|r| if r.in_sample { 1.0 } else { 0.0 })
                .collect(),
            records.iter().map(|r| r.outcome.unwrap_or(f64::NAN)).collect(),
            records
                .iter()
                .map(|r| r.treatment.unwrap_or(f64::NAN))
                .collect(),
            weight,
            covariate_names
                .iter()
                .zip(columns)
                .map(|(name, values)| {
                    (
                        name.to_string(),
                        CovariateColumn::Numeric(Array1::from_vec(values)),
                    )
                })
                .collect(),
        )
    }

    pub fn roles(&self) -> &ColumnRoles {
        &self.roles
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn id(&self, row: usize) -> &str {
        &self.ids[row]
    }

    pub fn is_sample(&self, row: usize) -> bool {
        self.in_sample[row]
    }

    pub fn outcome(&self) -> ArrayView1<'_, f64> {
        self.outcome.view()
    }

    pub fn treatment(&self) -> ArrayView1<'_, f64> {
        self.treatment.view()
    }

    /// The pre-computed treatment weights, if a weight column was assigned.
    pub fn weights(&self) -> Option<ArrayView1<'_, f64>> {
        self.weight.as_ref().map(|w| w.view())
    }

    pub fn covariate(&self, name: &str) -> Option<&CovariateColumn> {
        self.covariates
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, values)| values)
    }

    pub fn covariate_names(&self) -> impl Iterator<Item = &str> {
        self.covariates.iter().map(|(name, _)| name.as_str())
    }
}

/// A borrowed selection of dataset rows. Rows may repeat (bootstrap resamples).
#[derive(Debug, Clone)]
pub struct Subset<'a> {
    data: &'a Dataset,
    rows: Vec<usize>,
}

impl<'a> Subset<'a> {
    pub fn new(data: &'a Dataset, rows: Vec<usize>) -> Self {
        Self { data, rows }
    }

    pub fn data(&self) -> &'a Dataset {
        self.data
    }

    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn ids(&self) -> Vec<&'a str> {
        let data = self.data;
        self.rows.iter().map(|&row| data.id(row)).collect()
    }

    pub fn outcome(&self) -> Array1<f64> {
        self.gather(self.data.outcome())
    }

    pub fn treatment(&self) -> Array1<f64> {
        self.gather(self.data.treatment())
    }

    /// Sample-membership indicator (1.0 or 0.0) per row.
    pub fn sample_indicator(&self) -> Array1<f64> {
        self.rows
            .iter()
            .map(|&row| if self.data.is_sample(row) { 1.0 } else { 0.0 })
            .collect()
    }

    /// The view formed by the rows at the given positions of this view.
    pub fn select(&self, positions: &[usize]) -> Subset<'a> {
        Subset {
            data: self.data,
            rows: positions.iter().map(|&p| self.rows[p]).collect(),
        }
    }

    /// This view followed by `other`. Both must borrow the same dataset.
    pub fn concat(&self, other: &Subset<'a>) -> Subset<'a> {
        debug_assert!(std::ptr::eq(self.data, other.data));
        let mut rows = Vec::with_capacity(self.len() + other.len());
        rows.extend_from_slice(&self.rows);
        rows.extend_from_slice(&other.rows);
        Subset {
            data: self.data,
            rows,
        }
    }

    pub(crate) fn gather(&self, column: ArrayView1<'_, f64>) -> Array1<f64> {
        self.rows.iter().map(|&row| column[row]).collect()
    }
}

/// The sample and target views of a dataset, plus treatment weights aligned with the sample.
#[derive(Debug, Clone)]
pub struct Partition<'a> {
    sample: Subset<'a>,
    target: Subset<'a>,
    treatment_weights: Option<Array1<f64>>,
}

impl<'a> Partition<'a> {
    pub fn new(
        sample: Subset<'a>,
        target: Subset<'a>,
        treatment_weights: Option<Array1<f64>>,
    ) -> Result<Self, DataError> {
        if sample.is_empty() {
            return Err(DataError::EmptySubset("sample"));
        }
        if target.is_empty() {
            return Err(DataError::EmptySubset("target"));
        }
        if let Some(w) = &treatment_weights {
            if w.len() != sample.len() {
                return Err(DataError::LengthMismatch {
                    column: "treatment weights".to_string(),
                    expected: sample.len(),
                    found: w.len(),
                });
            }
        }
        Ok(Self {
            sample,
            target,
            treatment_weights,
        })
    }

    pub fn sample(&self) -> &Subset<'a> {
        &self.sample
    }

    pub fn target(&self) -> &Subset<'a> {
        &self.target
    }

    pub fn n_sample(&self) -> usize {
        self.sample.len()
    }

    pub fn n_target(&self) -> usize {
        self.target.len()
    }

    pub fn treatment_weights(&self) -> Option<ArrayView1<'_, f64>> {
        self.treatment_weights.as_ref().map(|w| w.view())
    }

    /// Replaces the treatment weights, e.g. with freshly estimated IPTW weights.
    pub fn with_treatment_weights(self, weights: Array1<f64>) -> Result<Self, DataError> {
        Self::new(self.sample, self.target, Some(weights))
    }
}

/// Splits a dataset by its sample-membership flag. Treatment weights come from the
/// dataset's weight column, if one was assigned.
pub fn partition(data: &Dataset) -> Result<Partition<'_>, DataError> {
    let (sample_rows, target_rows): (Vec<usize>, Vec<usize>) =
        (0..data.len()).partition(|&row| data.is_sample(row));
    let sample = Subset::new(data, sample_rows);
    let target = Subset::new(data, target_rows);
    let weights = data.weights().map(|w| sample.gather(w));
    Partition::new(sample, target, weights)
}

/// Loads and validates a study file.
pub fn load_dataset(
    path: &Path,
    roles: &ColumnRoles,
    separator: u8,
) -> Result<Dataset, DataError> {
    log::info!("Loading study data from '{}'", path.display());

    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(separator)),
        )
        .finish()?;

    log::info!(
        "Read {} rows and {} columns.",
        df.height(),
        df.get_column_names().len()
    );

    let column_names: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    let columns_set: HashSet<&str> = column_names.iter().map(|s| s.as_str()).collect();
    for required in roles.role_names() {
        if !columns_set.contains(required) {
            return Err(DataError::ColumnNotFound(required.to_string()));
        }
    }

    let ids = match roles.id.as_deref() {
        Some(id_column) => internal::extract_ids(&df, id_column)?,
        None => (1..=df.height()).map(|i| i.to_string()).collect(),
    };
    let sample_flag = internal::extract_numeric_column(&df, &roles.sample)?;
    let outcome = internal::extract_numeric_column(&df, &roles.outcome)?;
    let treatment = internal::extract_numeric_column(&df, &roles.treatment)?;
    let weight = match roles.weight.as_deref() {
        Some(name) => Some(internal::extract_numeric_column(&df, name)?),
        None => None,
    };

    let role_names = roles.role_names();
    let mut covariates = Vec::new();
    for name in column_names
        .iter()
        .filter(|name| !role_names.contains(&name.as_str()))
    {
        let column = match internal::extract_numeric_column(&df, name) {
            Ok(values) => CovariateColumn::Numeric(values),
            Err(DataError::ColumnWrongType { found_type, .. }) => {
                log::debug!("Column '{name}' is not numeric ({found_type}); kept as a marker.");
                CovariateColumn::NonNumeric { found_type }
            }
            Err(e) => return Err(e),
        };
        covariates.push((name.clone(), column));
    }

    let dataset = Dataset::new(
        roles.clone(),
        ids,
        sample_flag,
        outcome,
        treatment,
        weight,
        covariates,
    )?;
    let n_sample = dataset.in_sample.iter().filter(|&&s| s).count();
    log::info!(
        "Validated {} records: {} in the sample, {} in the target.",
        dataset.len(),
        n_sample,
        dataset.len() - n_sample
    );
    Ok(dataset)
}

/// Writes a dataset as a tab-separated file that [`load_dataset`] reads back.
/// Missing values are written as empty fields. Non-numeric covariates are not written.
pub fn save_dataset(data: &Dataset, path: &Path) -> Result<(), DataError> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)?;

    let roles = data.roles();
    let numeric: Vec<(&str, &Array1<f64>)> = data
        .covariates
        .iter()
        .filter_map(|(name, column)| match column {
            CovariateColumn::Numeric(values) => Some((name.as_str(), values)),
            CovariateColumn::NonNumeric { .. } => None,
        })
        .collect();

    let mut header = vec![
        roles.id.as_deref().unwrap_or("id"),
        roles.sample.as_str(),
        roles.treatment.as_str(),
        roles.outcome.as_str(),
    ];
    header.extend(roles.weight.as_deref());
    header.extend(numeric.iter().map(|(name, _)| *name));
    writer.write_record(&header)?;

    let render = |v: f64| if v.is_nan() { String::new() } else { v.to_string() };
    for row in 0..data.len() {
        let mut fields = vec![
            data.id(row).to_string(),
            if data.is_sample(row) { "1" } else { "0" }.to_string(),
            render(data.treatment[row]),
            render(data.outcome[row]),
        ];
        if let Some(w) = &data.weight {
            fields.push(render(w[row]));
        }
        fields.extend(numeric.iter().map(|(_, values)| render(values[row])));
        writer.write_record(&fields)?;
    }
    writer.flush()?;
    Ok(())
}

/// Internal helpers for column extraction.
mod internal {
    use super::*;

    pub(super) fn as_indicator(value: f64) -> Option<bool> {
        if value == 1.0 {
            Some(true)
        } else if value == 0.0 {
            Some(false)
        } else {
            None
        }
    }

    /// Reads a column as `f64`, mapping nulls to `NaN`. Fails when the cast would turn
    /// present values into nulls, i.e. when the column holds non-numeric text.
    pub(super) fn extract_numeric_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Array1<f64>, DataError> {
        let series = df.column(column_name)?;
        let original_nulls = series.null_count();

        let wrong_type = || DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", series.dtype()),
        };

        let casted = series
            .cast(&DataType::Float64)
            .map_err(|_| wrong_type())?;
        if casted.null_count() > original_nulls {
            return Err(wrong_type());
        }

        let values = casted
            .f64()?
            .into_iter()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect();
        Ok(values)
    }

    pub(super) fn extract_ids(df: &DataFrame, column_name: &str) -> Result<Vec<String>, DataError> {
        let series = df.column(column_name)?;
        if series.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }
        let as_text = series.cast(&DataType::String)?;
        let ids = as_text
            .str()?
            .into_iter()
            .map(|v| v.unwrap_or_default().to_string())
            .collect();
        Ok(ids)
    }
}
