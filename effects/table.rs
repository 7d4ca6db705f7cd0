//! # Estimate Tables
//!
//! The output of every entry point is an `EstimateResult`: a flat,
//! row-oriented `EstimateTable` plus the auxiliary pieces downstream calls
//! need (the Jacobian, the output covariance, the grouping variables and the
//! prediction scale). Hypothesis tests on a previous result read those fields
//! directly instead of re-running the model.

use crate::effects::errors::EffectsResult;
use crate::effects::grid::Value;
use crate::effects::inference::Inference;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Identifying columns of an estimate table, one `Value` per cell.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RowLabels {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl RowLabels {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Vec<Value>) {
        debug_assert_eq!(row.len(), self.columns.len());
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn row(&self, i: usize) -> &[Value] {
        &self.rows[i]
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        self.column_index(column).map(|c| &self.rows[row][c])
    }

    /// Short human-readable name for a row: its label values (without
    /// `rowid`) joined by commas, or `b<i+1>` when there is nothing to show.
    pub fn describe(&self, i: usize) -> String {
        let parts: Vec<String> = self
            .columns
            .iter()
            .zip(&self.rows[i])
            .filter(|(c, _)| c.as_str() != "rowid")
            .map(|(_, v)| v.to_string())
            .collect();
        if parts.is_empty() {
            format!("b{}", i + 1)
        } else {
            parts.join(", ")
        }
    }

    /// A single `hypothesis` column holding the given names.
    pub fn hypotheses(names: Vec<String>) -> Self {
        Self {
            columns: vec!["hypothesis".to_string()],
            rows: names.into_iter().map(|n| vec![Value::Level(n)]).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimandKind {
    Predictions,
    Comparisons,
    Slopes,
    MarginalMeans,
    Hypotheses,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EstimateTable {
    pub labels: RowLabels,
    pub estimate: Array1<f64>,
    pub inference: Inference,
}

impl EstimateTable {
    pub fn nrows(&self) -> usize {
        self.estimate.len()
    }

    pub fn std_error(&self) -> Option<&Array1<f64>> {
        self.inference.std_error.as_ref()
    }

    /// Writes the table as tab-separated values with a header row. Optional
    /// columns are written only when present.
    pub fn write_tsv<W: Write>(&self, writer: W) -> EffectsResult<()> {
        let mut numeric: Vec<(&str, &Array1<f64>)> = vec![("estimate", &self.estimate)];
        let inf = &self.inference;
        for (name, column) in [
            ("std_error", &inf.std_error),
            ("statistic", &inf.statistic),
            ("p_value", &inf.p_value),
            ("s_value", &inf.s_value),
            ("conf_low", &inf.conf_low),
            ("conf_high", &inf.conf_high),
        ] {
            if let Some(values) = column {
                numeric.push((name, values));
            }
        }
        if let Some(eq) = &inf.equivalence {
            numeric.push(("statistic_noninf", &eq.statistic_noninf));
            numeric.push(("statistic_nonsup", &eq.statistic_nonsup));
            numeric.push(("p_value_noninf", &eq.p_value_noninf));
            numeric.push(("p_value_nonsup", &eq.p_value_nonsup));
            numeric.push(("p_value_equiv", &eq.p_value_equiv));
        }

        let mut wtr = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(writer);
        let header: Vec<&str> = self
            .labels
            .columns()
            .iter()
            .map(String::as_str)
            .chain(numeric.iter().map(|(name, _)| *name))
            .collect();
        wtr.write_record(&header)?;
        for i in 0..self.nrows() {
            let record: Vec<String> = self
                .labels
                .row(i)
                .iter()
                .map(Value::to_string)
                .chain(numeric.iter().map(|(_, values)| values[i].to_string()))
                .collect();
            wtr.write_record(&record)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

/// A table of estimates together with everything needed to chain further
/// calculations onto it.
#[derive(Debug, Clone, PartialEq)]
pub struct EstimateResult {
    pub kind: EstimandKind,
    pub table: EstimateTable,
    /// `k x p` derivative of the estimates with respect to the parameters.
    pub jacobian: Option<Array2<f64>>,
    /// `k x k` covariance of the estimates.
    pub vcov: Option<Array2<f64>>,
    pub by: Vec<String>,
    pub scale: String,
    /// `k x n_draws` posterior draws of the estimates, for Bayesian models.
    pub draws: Option<Array2<f64>>,
}

impl EstimateResult {
    pub fn estimate(&self) -> &Array1<f64> {
        &self.table.estimate
    }

    pub fn std_error(&self) -> Option<&Array1<f64>> {
        self.table.std_error()
    }

    pub fn labels(&self) -> &RowLabels {
        &self.table.labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn table() -> EstimateTable {
        let mut labels = RowLabels::new(vec!["rowid".to_string(), "g".to_string()]);
        labels.push(vec![Value::Number(0.0), Value::from("a")]);
        labels.push(vec![Value::Number(1.0), Value::from("b")]);
        EstimateTable {
            labels,
            estimate: array![1.5, -2.0],
            inference: Inference {
                std_error: Some(array![0.5, 0.25]),
                ..Inference::default()
            },
        }
    }

    #[test]
    fn test_write_tsv_includes_only_present_columns() {
        let mut buffer = Vec::new();
        table().write_tsv(&mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "rowid\tg\testimate\tstd_error");
        assert_eq!(lines[1], "0\ta\t1.5\t0.5");
        assert_eq!(lines[2], "1\tb\t-2\t0.25");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_describe_skips_rowid() {
        let t = table();
        assert_eq!(t.labels.describe(1), "b");
        let empty = {
            let mut l = RowLabels::new(Vec::new());
            l.push(Vec::new());
            l
        };
        assert_eq!(empty.describe(0), "b1");
        assert_eq!(t.labels.value(0, "g"), Some(&Value::from("a")));
    }
}
