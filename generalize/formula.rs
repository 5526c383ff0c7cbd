//! Typed model specifications and design-matrix construction.
//!
//! A [`ModelSpec`] is an ordered list of [`Term`]s. An intercept column is always present and
//! is not listed. Squares are written as the interaction of a column with itself, so
//! `W + W^2` becomes `[Main("W"), Interaction("W", "W")]`.

use crate::data::{CovariateColumn, Dataset, Subset};
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// One column of a design matrix beyond the intercept.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Term {
    Main(String),
    Interaction(String, String),
}

impl Term {
    pub fn main(column: &str) -> Self {
        Term::Main(column.to_string())
    }

    pub fn interaction(a: &str, b: &str) -> Self {
        Term::Interaction(a.to_string(), b.to_string())
    }

    pub fn columns(&self) -> Vec<&str> {
        match self {
            Term::Main(a) => vec![a.as_str()],
            Term::Interaction(a, b) => vec![a.as_str(), b.as_str()],
        }
    }

    /// Order-insensitive identity, so `a:b` and `b:a` count as the same term.
    fn key(&self) -> (String, String) {
        match self {
            Term::Main(a) => (a.clone(), String::new()),
            Term::Interaction(a, b) if a <= b => (a.clone(), b.clone()),
            Term::Interaction(a, b) => (b.clone(), a.clone()),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Main(a) => write!(f, "{a}"),
            Term::Interaction(a, b) => write!(f, "{a}:{b}"),
        }
    }
}

/// How the treatment column is evaluated while building a design matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TreatmentLevel {
    /// Use each record's recorded treatment.
    Observed,
    /// Force every record to the given treatment value (counterfactual prediction).
    Fixed(f64),
}

#[derive(Error, Debug, PartialEq)]
pub enum FormulaError {
    #[error("A model term has an empty column name.")]
    EmptyColumnName,
    #[error("The term '{0}' appears more than once in the model.")]
    DuplicateTerm(String),
    #[error("The model references column '{0}', which is not in the dataset.")]
    UnknownColumn(String),
    #[error(
        "The model references column '{column}', which is not numeric (found type: {found_type})."
    )]
    NonNumericColumn { column: String, found_type: String },
    #[error("Column '{column}' holds the {role} and cannot be used as a term in the {model}.")]
    ReservedColumn {
        column: String,
        role: &'static str,
        model: &'static str,
    },
    #[error("The outcome model must include the treatment column '{0}' as a term.")]
    MissingTreatmentTerm(String),
    #[error("Column '{column}' has a missing or non-finite value for record '{id}'.")]
    MissingValue { column: String, id: String },
}

/// A validated list of model terms. The intercept is implicit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Term>", into = "Vec<Term>")]
pub struct ModelSpec {
    terms: Vec<Term>,
}

impl TryFrom<Vec<Term>> for ModelSpec {
    type Error = FormulaError;

    fn try_from(terms: Vec<Term>) -> Result<Self, Self::Error> {
        ModelSpec::new(terms)
    }
}

impl From<ModelSpec> for Vec<Term> {
    fn from(spec: ModelSpec) -> Self {
        spec.terms
    }
}

enum ColumnSource<'a> {
    Treatment(ArrayView1<'a, f64>),
    Values(&'a Array1<f64>),
}

impl ModelSpec {
    pub fn new(terms: Vec<Term>) -> Result<Self, FormulaError> {
        let mut seen = HashSet::with_capacity(terms.len());
        for term in &terms {
            if term.columns().iter().any(|c| c.trim().is_empty()) {
                return Err(FormulaError::EmptyColumnName);
            }
            if !seen.insert(term.key()) {
                return Err(FormulaError::DuplicateTerm(term.to_string()));
            }
        }
        Ok(Self { terms })
    }

    /// Main effects for each column, in order.
    pub fn main_effects(columns: &[&str]) -> Result<Self, FormulaError> {
        Self::new(columns.iter().map(|c| Term::main(c)).collect())
    }

    pub fn intercept_only() -> Self {
        Self { terms: Vec::new() }
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    /// Number of design-matrix columns, intercept included.
    pub fn ncols(&self) -> usize {
        self.terms.len() + 1
    }

    pub fn references(&self, column: &str) -> bool {
        self.terms.iter().any(|t| t.columns().contains(&column))
    }

    pub fn column_labels(&self) -> Vec<String> {
        std::iter::once("(intercept)".to_string())
            .chain(self.terms.iter().map(|t| t.to_string()))
            .collect()
    }

    /// Rejects a model that references `column`.
    pub(crate) fn forbid(
        &self,
        column: &str,
        role: &'static str,
        model: &'static str,
    ) -> Result<(), FormulaError> {
        if self.references(column) {
            return Err(FormulaError::ReservedColumn {
                column: column.to_string(),
                role,
                model,
            });
        }
        Ok(())
    }

    /// Builds the design matrix for the rows of `subset`: a leading intercept column
    /// followed by one column per term.
    pub fn design(
        &self,
        subset: &Subset<'_>,
        level: TreatmentLevel,
    ) -> Result<Array2<f64>, FormulaError> {
        let data = subset.data();
        let mut x = Array2::ones((subset.len(), self.ncols()));
        for (j, term) in self.terms.iter().enumerate() {
            let names = term.columns();
            let sources = names
                .iter()
                .map(|name| resolve(data, name))
                .collect::<Result<Vec<_>, _>>()?;
            let mut column = x.column_mut(j + 1);
            for (i, &row) in subset.rows().iter().enumerate() {
                let mut product = 1.0;
                for (source, name) in sources.iter().zip(&names) {
                    product *= value_at(data, source, name, row, level)?;
                }
                column[i] = product;
            }
        }
        Ok(x)
    }
}

fn resolve<'a>(data: &'a Dataset, name: &str) -> Result<ColumnSource<'a>, FormulaError> {
    let roles = data.roles();
    if name == roles.treatment {
        return Ok(ColumnSource::Treatment(data.treatment()));
    }
    let reserved = if name == roles.outcome {
        Some("outcome")
    } else if name == roles.sample {
        Some("sample indicator")
    } else if roles.weight.as_deref() == Some(name) {
        Some("treatment weight")
    } else if roles.id.as_deref() == Some(name) {
        Some("record identifier")
    } else {
        None
    };
    if let Some(role) = reserved {
        return Err(FormulaError::ReservedColumn {
            column: name.to_string(),
            role,
            model: "model",
        });
    }
    match data.covariate(name) {
        Some(CovariateColumn::Numeric(values)) => Ok(ColumnSource::Values(values)),
        Some(CovariateColumn::NonNumeric { found_type }) => Err(FormulaError::NonNumericColumn {
            column: name.to_string(),
            found_type: found_type.clone(),
        }),
        None => Err(FormulaError::UnknownColumn(name.to_string())),
    }
}

fn value_at(
    data: &Dataset,
    source: &ColumnSource<'_>,
    name: &str,
    row: usize,
    level: TreatmentLevel,
) -> Result<f64, FormulaError> {
    let v = match source {
        ColumnSource::Treatment(observed) => match level {
            TreatmentLevel::Observed => observed[row],
            TreatmentLevel::Fixed(a) => a,
        },
        ColumnSource::Values(values) => values[row],
    };
    if v.is_finite() {
        Ok(v)
    } else {
        Err(FormulaError::MissingValue {
            column: name.to_string(),
            id: data.id(row).to_string(),
        })
    }
}
