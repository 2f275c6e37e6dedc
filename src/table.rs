//! Column-oriented table of recorded traces.
//!
//! [`TraceTable`] is what [`crate::experiment::Experiment::tdms_to_dataframe`] produces: a `time`
//! column followed by one column per recording channel, all of equal length. Column order is
//! preserved through serialization.

use indexmap::IndexMap;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

pub const TIME_COLUMN: &str = "time";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceTable {
    columns: IndexMap<String, Vec<f64>>,
}

impl TraceTable {
    /// Builds a table from a time vector and named traces. Traces longer or shorter than `time`
    /// are truncated or padded with NaN so that every column has `time.len()` rows.
    pub fn new(time: Vec<f64>, traces: impl IntoIterator<Item = (String, Vec<f64>)>) -> Self {
        let n_rows = time.len();
        let mut columns = IndexMap::new();
        columns.insert(TIME_COLUMN.to_string(), time);
        for (name, mut trace) in traces {
            if trace.len() != n_rows {
                log::warn!(
                    "Trace {} has {} samples, table has {} rows",
                    name,
                    trace.len(),
                    n_rows
                );
                trace.resize(n_rows, f64::NAN);
            }
            columns.insert(name, trace);
        }
        Self { columns }
    }

    pub fn n_rows(&self) -> usize {
        self.columns.get(TIME_COLUMN).map_or(0, Vec::len)
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    pub fn time(&self) -> &[f64] {
        self.column(TIME_COLUMN).unwrap_or(&[])
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &[f64])> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Rows are samples, columns follow [`TraceTable::column_names`].
    pub fn to_array2(&self) -> Array2<f64> {
        let n_rows = self.n_rows();
        let n_cols = self.columns.len();
        let mut arr = Array2::from_elem((n_rows, n_cols), f64::NAN);
        for (j, col) in self.columns.values().enumerate() {
            for (i, v) in col.iter().take(n_rows).enumerate() {
                arr[[i, j]] = *v;
            }
        }
        arr
    }
}
