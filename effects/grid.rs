//! # Covariate Grids
//!
//! A `Grid` is the ordered table of covariate configurations over which
//! predictions, comparisons and slopes are evaluated. Columns are either
//! numeric or categorical; every grid also carries a `rowid` that links each
//! row back to its source row, and optional non-negative `wts` used by the
//! aggregator.
//!
//! Grids are built by the caller (or by the `datagrid`/`balanced_grid`
//! helpers here) and are only read by the rest of the pipeline. Perturbed
//! copies for comparisons and slopes are produced with `Grid::with_column`,
//! which never touches the original.

use ahash::AHashMap;
use itertools::Itertools;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A single grid cell, used to fix grid values and to label output rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Level(String),
}

impl Value {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(v) => Some(*v),
            Value::Level(_) => None,
        }
    }

    pub fn as_level(&self) -> Option<&str> {
        match self {
            Value::Number(_) => None,
            Value::Level(level) => Some(level),
        }
    }

    /// Hashable identity of the value. Numbers compare by bit pattern, so
    /// `0.1 + 0.2` and `0.3` form separate groups.
    pub fn key(&self) -> KeyPart {
        match self {
            Value::Number(v) => KeyPart::Number(v.to_bits()),
            Value::Level(level) => KeyPart::Level(level.clone()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(v) => write!(f, "{v}"),
            Value::Level(level) => write!(f, "{level}"),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<&str> for Value {
    fn from(level: &str) -> Self {
        Value::Level(level.to_string())
    }
}

impl From<String> for Value {
    fn from(level: String) -> Self {
        Value::Level(level)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPart {
    Number(u64),
    Level(String),
}

/// Errors raised while building, querying or weighting grids.
#[derive(Error, Debug)]
pub enum GridError {
    #[error("Column '{name}' was not found in the grid. Available columns: {}", .available.join(", "))]
    ColumnNotFound {
        name: String,
        available: Vec<String>,
    },
    #[error("Column '{name}' has {found} rows, but the grid has {expected}.")]
    LengthMismatch {
        name: String,
        found: usize,
        expected: usize,
    },
    #[error("Column '{name}' is {found}, but {expected} values are required here.")]
    ColumnType {
        name: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("A grid needs at least one column and one row.")]
    EmptySource,
    #[error("Invalid weights: {0}")]
    InvalidWeights(String),
    #[error("Duplicate column name '{0}' in grid.")]
    DuplicateColumn(String),
}

/// One grid column.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Numeric(Array1<f64>),
    Categorical(Vec<String>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Numeric(values) => values.len(),
            Column::Categorical(levels) => levels.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Column::Numeric(_) => "numeric",
            Column::Categorical(_) => "categorical",
        }
    }

    pub fn value(&self, row: usize) -> Value {
        match self {
            Column::Numeric(values) => Value::Number(values[row]),
            Column::Categorical(levels) => Value::Level(levels[row].clone()),
        }
    }

    fn select(&self, rows: &[usize]) -> Column {
        match self {
            Column::Numeric(values) => {
                Column::Numeric(rows.iter().map(|&r| values[r]).collect::<Array1<f64>>())
            }
            Column::Categorical(levels) => {
                Column::Categorical(rows.iter().map(|&r| levels[r].clone()).collect())
            }
        }
    }

    /// The value a "typical" grid uses for this column: the mean of a
    /// numeric column, the most frequent level of a categorical one (ties go
    /// to the level that sorts first).
    fn typical_value(&self) -> Value {
        match self {
            Column::Numeric(values) => Value::Number(values.mean().unwrap_or(f64::NAN)),
            Column::Categorical(levels) => {
                let mut counts: AHashMap<&str, usize> = AHashMap::new();
                for level in levels {
                    *counts.entry(level.as_str()).or_insert(0) += 1;
                }
                let mode = counts
                    .into_iter()
                    .sorted_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)))
                    .map(|(level, _)| level.to_string())
                    .next()
                    .unwrap_or_default();
                Value::Level(mode)
            }
        }
    }

    fn from_values(name: &str, template: &Column, values: &[Value]) -> Result<Column, GridError> {
        match template {
            Column::Numeric(_) => values
                .iter()
                .map(|v| {
                    v.as_number().ok_or_else(|| GridError::ColumnType {
                        name: name.to_string(),
                        expected: "numeric",
                        found: "categorical",
                    })
                })
                .collect::<Result<Array1<f64>, _>>()
                .map(Column::Numeric),
            Column::Categorical(_) => Ok(Column::Categorical(
                values.iter().map(|v| v.to_string()).collect(),
            )),
        }
    }
}

/// How unlisted columns are filled by [`datagrid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridMode {
    /// Unlisted predictors are held at their mean (numeric) or mode
    /// (categorical); one row per combination of listed values.
    Typical,
    /// The full source table is replicated once per combination of listed
    /// values.
    Counterfactual,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    names: Vec<String>,
    columns: Vec<Column>,
    rowid: Vec<usize>,
    wts: Option<Array1<f64>>,
}

impl Grid {
    /// Builds a grid from named columns. All columns must have the same,
    /// non-zero length; `rowid` defaults to `0..n`.
    pub fn from_columns<S: Into<String>>(columns: Vec<(S, Column)>) -> Result<Self, GridError> {
        let mut names = Vec::with_capacity(columns.len());
        let mut cols = Vec::with_capacity(columns.len());
        for (name, column) in columns {
            let name = name.into();
            if names.contains(&name) {
                return Err(GridError::DuplicateColumn(name));
            }
            names.push(name);
            cols.push(column);
        }
        let nrows = cols.first().map(Column::len).unwrap_or(0);
        if nrows == 0 {
            return Err(GridError::EmptySource);
        }
        for (name, column) in names.iter().zip(&cols) {
            if column.len() != nrows {
                return Err(GridError::LengthMismatch {
                    name: name.clone(),
                    found: column.len(),
                    expected: nrows,
                });
            }
        }
        Ok(Self {
            names,
            columns: cols,
            rowid: (0..nrows).collect(),
            wts: None,
        })
    }

    pub fn nrows(&self) -> usize {
        self.rowid.len()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn rowid(&self) -> &[usize] {
        &self.rowid
    }

    pub fn weights(&self) -> Option<&Array1<f64>> {
        self.wts.as_ref()
    }

    pub fn column(&self, name: &str) -> Result<&Column, GridError> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.columns[i])
            .ok_or_else(|| GridError::ColumnNotFound {
                name: name.to_string(),
                available: self.names.clone(),
            })
    }

    pub fn numeric(&self, name: &str) -> Result<&Array1<f64>, GridError> {
        match self.column(name)? {
            Column::Numeric(values) => Ok(values),
            Column::Categorical(_) => Err(GridError::ColumnType {
                name: name.to_string(),
                expected: "numeric",
                found: "categorical",
            }),
        }
    }

    pub fn categorical(&self, name: &str) -> Result<&[String], GridError> {
        match self.column(name)? {
            Column::Categorical(levels) => Ok(levels),
            Column::Numeric(_) => Err(GridError::ColumnType {
                name: name.to_string(),
                expected: "categorical",
                found: "numeric",
            }),
        }
    }

    /// Distinct levels of a categorical column, sorted.
    pub fn levels(&self, name: &str) -> Result<Vec<String>, GridError> {
        Ok(self
            .categorical(name)?
            .iter()
            .cloned()
            .sorted()
            .dedup()
            .collect())
    }

    pub fn row_values(&self, row: usize) -> Vec<Value> {
        self.columns.iter().map(|c| c.value(row)).collect()
    }

    /// Attaches aggregation weights. Weights must be finite and non-negative.
    pub fn with_weights(mut self, wts: Array1<f64>) -> Result<Self, GridError> {
        validate_weights(&wts.to_vec(), self.nrows())?;
        self.wts = Some(wts);
        Ok(self)
    }

    pub fn with_rowid(mut self, rowid: Vec<usize>) -> Result<Self, GridError> {
        if rowid.len() != self.nrows() {
            return Err(GridError::LengthMismatch {
                name: "rowid".to_string(),
                found: rowid.len(),
                expected: self.nrows(),
            });
        }
        self.rowid = rowid;
        Ok(self)
    }

    /// Returns a copy of the grid with `name` replaced (or appended).
    pub fn with_column(&self, name: &str, column: Column) -> Result<Grid, GridError> {
        if column.len() != self.nrows() {
            return Err(GridError::LengthMismatch {
                name: name.to_string(),
                found: column.len(),
                expected: self.nrows(),
            });
        }
        let mut grid = self.clone();
        match grid.names.iter().position(|n| n == name) {
            Some(i) => grid.columns[i] = column,
            None => {
                grid.names.push(name.to_string());
                grid.columns.push(column);
            }
        }
        Ok(grid)
    }

    /// Keeps the given rows (in the given order), carrying rowid and weights.
    pub fn select_rows(&self, rows: &[usize]) -> Grid {
        Grid {
            names: self.names.clone(),
            columns: self.columns.iter().map(|c| c.select(rows)).collect(),
            rowid: rows.iter().map(|&r| self.rowid[r]).collect(),
            wts: self
                .wts
                .as_ref()
                .map(|w| rows.iter().map(|&r| w[r]).collect()),
        }
    }
}

pub(crate) fn validate_weights(wts: &[f64], expected: usize) -> Result<(), GridError> {
    if wts.len() != expected {
        return Err(GridError::InvalidWeights(format!(
            "expected {expected} weights, found {}",
            wts.len()
        )));
    }
    if let Some((i, w)) = wts.iter().enumerate().find(|(_, w)| !w.is_finite() || **w < 0.0) {
        return Err(GridError::InvalidWeights(format!(
            "weight {w} at row {i} is negative or non-finite"
        )));
    }
    Ok(())
}

/// Builds a grid from `source`, fixing the listed columns to the given
/// values and filling the rest according to `mode`.
///
/// Listed columns take every combination of their values, in the order the
/// columns are listed and with the last column varying fastest.
pub fn datagrid(
    source: &Grid,
    fixed: &[(&str, Vec<Value>)],
    mode: GridMode,
) -> Result<Grid, GridError> {
    for (name, values) in fixed {
        source.column(name)?;
        if values.is_empty() {
            return Err(GridError::EmptySource);
        }
    }

    let combinations: Vec<Vec<usize>> = if fixed.is_empty() {
        vec![Vec::new()]
    } else {
        fixed
            .iter()
            .map(|(_, values)| 0..values.len())
            .multi_cartesian_product()
            .collect()
    };

    let fixed_value = |name: &str, combo: &[usize]| -> Option<Value> {
        fixed
            .iter()
            .position(|(n, _)| *n == name)
            .map(|k| fixed[k].1[combo[k]].clone())
    };

    match mode {
        GridMode::Typical => {
            let mut columns = Vec::with_capacity(source.names.len());
            for (name, template) in source.names.iter().zip(&source.columns) {
                let typical = template.typical_value();
                let values: Vec<Value> = combinations
                    .iter()
                    .map(|combo| fixed_value(name, combo).unwrap_or_else(|| typical.clone()))
                    .collect();
                columns.push((name.clone(), Column::from_values(name, template, &values)?));
            }
            Grid::from_columns(columns)
        }
        GridMode::Counterfactual => {
            let n = source.nrows();
            let mut columns = Vec::with_capacity(source.names.len());
            for (name, template) in source.names.iter().zip(&source.columns) {
                let mut values = Vec::with_capacity(n * combinations.len());
                for combo in &combinations {
                    match fixed_value(name, combo) {
                        Some(v) => values.extend(std::iter::repeat_n(v, n)),
                        None => values.extend((0..n).map(|r| template.value(r))),
                    }
                }
                columns.push((name.clone(), Column::from_values(name, template, &values)?));
            }
            let rowid = combinations
                .iter()
                .flat_map(|_| source.rowid.iter().copied())
                .collect();
            let grid = Grid::from_columns(columns)?.with_rowid(rowid)?;
            match &source.wts {
                Some(w) => {
                    let replicated: Array1<f64> =
                        combinations.iter().flat_map(|_| w.iter().copied()).collect();
                    grid.with_weights(replicated)
                }
                None => Ok(grid),
            }
        }
    }
}

/// A balanced grid: every combination of the levels of the categorical
/// columns in `variables`, with numeric columns held at their mean.
/// Used for marginal means.
pub fn balanced_grid(source: &Grid, variables: &[String]) -> Result<Grid, GridError> {
    let mut fixed: Vec<(&str, Vec<Value>)> = Vec::new();
    for name in variables {
        if let Column::Categorical(_) = source.column(name)? {
            let levels = source.levels(name)?;
            fixed.push((name.as_str(), levels.into_iter().map(Value::Level).collect()));
        }
    }
    let typical = datagrid(source, &fixed, GridMode::Typical)?;
    let keep: Vec<(String, Column)> = variables
        .iter()
        .map(|name| Ok((name.clone(), typical.column(name)?.clone())))
        .collect::<Result<_, GridError>>()?;
    Grid::from_columns(keep)
}

/// Aggregation weights, resolved to one non-negative weight per grid row.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightSpec {
    /// The grid's own `wts` when present, otherwise equal weights.
    #[default]
    Grid,
    Equal,
    /// Each grid row weighted by how often its categorical cell occurs in the
    /// source data.
    Cells,
    /// Each grid row weighted by the product of the marginal source
    /// proportions of its non-focal categorical levels.
    Proportional,
    Column(String),
    Values(Vec<f64>),
}

/// Resolves a weight specification against a grid. `source` is required for
/// `Cells` and `Proportional`; `focal` lists the columns excluded from the
/// proportional product.
pub fn resolve_weights(
    spec: &WeightSpec,
    grid: &Grid,
    source: Option<&Grid>,
    focal: &[String],
) -> Result<Array1<f64>, GridError> {
    let n = grid.nrows();
    let weights = match spec {
        WeightSpec::Grid => grid.wts.clone().unwrap_or_else(|| Array1::ones(n)),
        WeightSpec::Equal => Array1::ones(n),
        WeightSpec::Column(name) => grid.numeric(name)?.clone(),
        WeightSpec::Values(values) => Array1::from_vec(values.clone()),
        WeightSpec::Cells | WeightSpec::Proportional => {
            let source = source.ok_or_else(|| {
                GridError::InvalidWeights(
                    "'cells' and 'proportional' weights need the source data".to_string(),
                )
            })?;
            let cells: Vec<&String> = grid
                .names
                .iter()
                .zip(&grid.columns)
                .filter(|(name, col)| {
                    matches!(col, Column::Categorical(_)) && source.contains(name)
                })
                .map(|(name, _)| name)
                .collect();
            if matches!(spec, WeightSpec::Cells) {
                cell_counts(grid, source, &cells)?
            } else {
                let others: Vec<&String> =
                    cells.into_iter().filter(|c| !focal.contains(c)).collect();
                marginal_proportions(grid, source, &others)?
            }
        }
    };
    validate_weights(&weights.to_vec(), n)?;
    Ok(weights)
}

fn cell_counts(grid: &Grid, source: &Grid, cells: &[&String]) -> Result<Array1<f64>, GridError> {
    let mut counts: AHashMap<Vec<String>, f64> = AHashMap::new();
    let source_levels: Vec<&[String]> = cells
        .iter()
        .map(|c| source.categorical(c))
        .collect::<Result<_, _>>()?;
    for r in 0..source.nrows() {
        let key: Vec<String> = source_levels.iter().map(|l| l[r].clone()).collect();
        *counts.entry(key).or_insert(0.0) += 1.0;
    }
    let grid_levels: Vec<&[String]> = cells
        .iter()
        .map(|c| grid.categorical(c))
        .collect::<Result<_, _>>()?;
    Ok((0..grid.nrows())
        .map(|r| {
            let key: Vec<String> = grid_levels.iter().map(|l| l[r].clone()).collect();
            counts.get(&key).copied().unwrap_or(0.0)
        })
        .collect())
}

fn marginal_proportions(
    grid: &Grid,
    source: &Grid,
    columns: &[&String],
) -> Result<Array1<f64>, GridError> {
    let n_source = source.nrows() as f64;
    let mut weights = Array1::<f64>::ones(grid.nrows());
    for column in columns {
        let mut freq: AHashMap<&str, f64> = AHashMap::new();
        for level in source.categorical(column)? {
            *freq.entry(level.as_str()).or_insert(0.0) += 1.0 / n_source;
        }
        for (w, level) in weights.iter_mut().zip(grid.categorical(column)?) {
            *w *= freq.get(level.as_str()).copied().unwrap_or(0.0);
        }
    }
    Ok(weights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn source() -> Grid {
        Grid::from_columns(vec![
            ("x", Column::Numeric(array![1.0, 2.0, 3.0, 6.0])),
            (
                "g",
                Column::Categorical(vec!["b".into(), "a".into(), "b".into(), "c".into()]),
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_from_columns_rejects_ragged_columns() {
        let err = Grid::from_columns(vec![
            ("x", Column::Numeric(array![1.0, 2.0])),
            ("z", Column::Numeric(array![1.0])),
        ])
        .unwrap_err();
        match err {
            GridError::LengthMismatch { name, found, expected } => {
                assert_eq!(name, "z");
                assert_eq!(found, 1);
                assert_eq!(expected, 2);
            }
            other => panic!("Expected LengthMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_typical_grid_uses_mean_and_mode() {
        let grid = datagrid(&source(), &[], GridMode::Typical).unwrap();
        assert_eq!(grid.nrows(), 1);
        assert_abs_diff_eq!(grid.numeric("x").unwrap()[0], 3.0, epsilon = 1e-12);
        assert_eq!(grid.categorical("g").unwrap()[0], "b");
    }

    #[test]
    fn test_typical_grid_crosses_listed_values() {
        let grid = datagrid(
            &source(),
            &[
                ("x", vec![Value::Number(-1.0), Value::Number(1.0)]),
                ("g", vec![Value::from("a"), Value::from("c")]),
            ],
            GridMode::Typical,
        )
        .unwrap();
        assert_eq!(grid.nrows(), 4);
        assert_eq!(grid.numeric("x").unwrap().to_vec(), vec![-1.0, -1.0, 1.0, 1.0]);
        assert_eq!(grid.categorical("g").unwrap(), &["a", "c", "a", "c"]);
    }

    #[test]
    fn test_counterfactual_grid_replicates_source() {
        let grid = datagrid(
            &source(),
            &[("g", vec![Value::from("a"), Value::from("b")])],
            GridMode::Counterfactual,
        )
        .unwrap();
        assert_eq!(grid.nrows(), 8);
        assert_eq!(grid.rowid(), &[0, 1, 2, 3, 0, 1, 2, 3]);
        assert_eq!(grid.categorical("g").unwrap()[..4], ["a", "a", "a", "a"]);
        assert_eq!(grid.numeric("x").unwrap()[5], 2.0);
    }

    #[test]
    fn test_datagrid_rejects_unknown_column() {
        let err = datagrid(&source(), &[("w", vec![Value::Number(1.0)])], GridMode::Typical)
            .unwrap_err();
        assert!(matches!(err, GridError::ColumnNotFound { .. }));
    }

    #[test]
    fn test_numeric_column_rejects_level_values() {
        let err = datagrid(&source(), &[("x", vec![Value::from("high")])], GridMode::Typical)
            .unwrap_err();
        assert!(matches!(err, GridError::ColumnType { .. }));
    }

    #[test]
    fn test_balanced_grid_covers_all_levels() {
        let grid = balanced_grid(&source(), &["g".to_string(), "x".to_string()]).unwrap();
        assert_eq!(grid.nrows(), 3);
        assert_eq!(grid.categorical("g").unwrap(), &["a", "b", "c"]);
        assert!(grid.numeric("x").unwrap().iter().all(|&x| x == 3.0));
    }

    #[test]
    fn test_cells_and_proportional_weights() {
        let src = source();
        let grid = balanced_grid(&src, &["g".to_string()]).unwrap();
        let cells = resolve_weights(&WeightSpec::Cells, &grid, Some(&src), &[]).unwrap();
        assert_eq!(cells.to_vec(), vec![1.0, 2.0, 1.0]);

        let prop = resolve_weights(&WeightSpec::Proportional, &grid, Some(&src), &[]).unwrap();
        assert_abs_diff_eq!(prop[1], 0.5, epsilon = 1e-12);

        let focal_only =
            resolve_weights(&WeightSpec::Proportional, &grid, Some(&src), &["g".to_string()])
                .unwrap();
        assert_eq!(focal_only.to_vec(), vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_negative_weights_rejected() {
        let err = resolve_weights(
            &WeightSpec::Values(vec![1.0, -1.0, 1.0, 1.0]),
            &source(),
            None,
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, GridError::InvalidWeights(_)));
    }
}
