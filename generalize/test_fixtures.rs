//! Small deterministic studies with hand-computable estimates, and stub fitters.

use crate::data::{ColumnRoles, CovariateColumn, Dataset, Record, Subset};
use crate::fit::{FitError, LinkFunction, RegressionFitter};
use ndarray::{Array1, ArrayView1, ArrayView2};

pub(crate) fn roles() -> ColumnRoles {
    ColumnRoles::new("Y", "A", "S").with_id("id")
}

/// Appends `count` sample records in one (L, A) cell, the first `events` with Y = 1.
fn push_cell(records: &mut Vec<Record>, l: f64, a: f64, count: usize, events: usize) {
    for k in 0..count {
        let id = format!("s{}", records.len());
        let y = if k < events { 1.0 } else { 0.0 };
        records.push(Record::sample(&id, a, y, vec![l]));
    }
}

fn push_targets(records: &mut Vec<Record>, l0: usize, l1: usize) {
    for (l, count) in [(0.0, l0), (1.0, l1)] {
        for _ in 0..count {
            let id = format!("t{}", records.len());
            records.push(Record::target(&id, vec![l]));
        }
    }
}

/// A randomized sample stratified by one binary covariate L:
///
/// | L | A=1 (events/n) | A=0 (events/n) | target n |
/// |---|---|---|---|
/// | 0 | 8/20 | 6/20 | 150 |
/// | 1 | 18/30 | 12/30 | 50 |
///
/// Transported risks are 0.45 and 0.325 (RD 0.125). Generalized risks are 142/300 and
/// 101/300. The unweighted sample risks are 0.52 and 0.36.
pub(crate) fn cell_study() -> Dataset {
    let mut records = Vec::new();
    push_cell(&mut records, 0.0, 1.0, 20, 8);
    push_cell(&mut records, 0.0, 0.0, 20, 6);
    push_cell(&mut records, 1.0, 1.0, 30, 18);
    push_cell(&mut records, 1.0, 0.0, 30, 12);
    push_targets(&mut records, 150, 50);
    Dataset::from_records(roles(), &["L"], &records).unwrap()
}

/// Like [`cell_study`] but with treatment assignment depending on L:
///
/// | L | A=1 (events/n) | A=0 (events/n) | target n |
/// |---|---|---|---|
/// | 0 | 4/10 | 9/30 | 150 |
/// | 1 | 27/45 | 6/15 | 50 |
///
/// Stratum risks match [`cell_study`], so transported risks are again 0.45 and 0.325.
pub(crate) fn confounded_cells() -> Dataset {
    let mut records = Vec::new();
    push_cell(&mut records, 0.0, 1.0, 10, 4);
    push_cell(&mut records, 0.0, 0.0, 30, 9);
    push_cell(&mut records, 1.0, 1.0, 45, 27);
    push_cell(&mut records, 1.0, 0.0, 15, 6);
    push_targets(&mut records, 150, 50);
    Dataset::from_records(roles(), &["L"], &records).unwrap()
}

/// A sample in which every record is treated.
pub(crate) fn single_arm_study() -> Dataset {
    let mut records = Vec::new();
    push_cell(&mut records, 0.0, 1.0, 10, 3);
    push_cell(&mut records, 1.0, 1.0, 10, 6);
    push_targets(&mut records, 10, 10);
    Dataset::from_records(roles(), &["L"], &records).unwrap()
}

/// The numeric covariate `name` gathered over the rows of `subset`.
pub(crate) fn covariate(subset: &Subset<'_>, name: &str) -> Array1<f64> {
    match subset.data().covariate(name) {
        Some(CovariateColumn::Numeric(values)) => subset.gather(values.view()),
        _ => panic!("covariate {name} must be numeric"),
    }
}

/// Returns `intercept` followed by zeros, whatever the data.
pub(crate) struct ConstantFitter {
    pub intercept: f64,
}

impl RegressionFitter for ConstantFitter {
    fn fit(
        &self,
        x: ArrayView2<f64>,
        _: ArrayView1<f64>,
        _: Option<ArrayView1<f64>>,
        _: LinkFunction,
    ) -> Result<Array1<f64>, FitError> {
        let mut beta = Array1::zeros(x.ncols());
        beta[0] = self.intercept;
        Ok(beta)
    }
}

/// Always fails.
pub(crate) struct FailingFitter;

impl RegressionFitter for FailingFitter {
    fn fit(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        _: Option<ArrayView1<f64>>,
        _: LinkFunction,
    ) -> Result<Array1<f64>, FitError> {
        Err(FitError::DimensionMismatch {
            rows: x.nrows(),
            response: y.len() + 1,
        })
    }
}
