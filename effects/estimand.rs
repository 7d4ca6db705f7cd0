//! # Estimand Functions
//!
//! An `EstimandPlan` fixes everything about an estimand except the parameter
//! vector: the evaluation grid, the prediction scale and, for comparisons and
//! slopes, the pairs of counterfactual grids (`lo`, `hi`) for every focal
//! variable and contrast. `EstimandPlan::evaluate` then maps a parameter
//! vector to per-row estimates (aggregated through an `AggregationPlan`) and
//! is the function the delta-method engine differentiates.
//!
//! Counterfactual grids only replace the focal base column. Every derived
//! design column (powers, logs, interactions) is recomputed by the model from
//! the replaced column, so dependent terms move together. Perturbations are
//! not checked against the observed support of the variable.

use crate::effects::aggregate::AggregationPlan;
use crate::effects::errors::{EffectsError, EffectsResult};
use crate::effects::grid::{Column, Grid, Value};
use crate::effects::inference::quantile;
use crate::effects::model::FittedModel;
use crate::effects::table::{EstimandKind, RowLabels};
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Custom comparison, called as `f(hi, lo)` on whole prediction vectors.
pub type CombineFn = Arc<dyn Fn(ArrayView1<f64>, ArrayView1<f64>) -> Array1<f64> + Send + Sync>;

/// Custom numeric change: maps the focal column to its `(lo, hi)` columns.
pub type ChangeFn = Arc<dyn Fn(ArrayView1<f64>) -> (Array1<f64>, Array1<f64>) + Send + Sync>;

/// How the `hi` and `lo` predictions of a contrast are combined. The `*avg`
/// variants average `hi` and `lo` within each group first and combine the
/// averages.
#[derive(Clone, Default, Serialize, Deserialize)]
pub enum Comparison {
    #[default]
    #[serde(rename = "difference")]
    Difference,
    #[serde(rename = "ratio")]
    Ratio,
    #[serde(rename = "lnratio")]
    LnRatio,
    /// Log odds ratio.
    #[serde(rename = "lnor")]
    LnOr,
    /// Relative change `(hi - lo) / lo`.
    #[serde(rename = "lift")]
    Lift,
    #[serde(rename = "differenceavg")]
    DifferenceAvg,
    #[serde(rename = "ratioavg")]
    RatioAvg,
    #[serde(rename = "lnratioavg")]
    LnRatioAvg,
    #[serde(rename = "lnoravg")]
    LnOrAvg,
    #[serde(rename = "liftavg")]
    LiftAvg,
    #[serde(skip)]
    Custom(CombineFn),
}

impl fmt::Debug for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Comparison::Difference => "Difference",
            Comparison::Ratio => "Ratio",
            Comparison::LnRatio => "LnRatio",
            Comparison::LnOr => "LnOr",
            Comparison::Lift => "Lift",
            Comparison::DifferenceAvg => "DifferenceAvg",
            Comparison::RatioAvg => "RatioAvg",
            Comparison::LnRatioAvg => "LnRatioAvg",
            Comparison::LnOrAvg => "LnOrAvg",
            Comparison::LiftAvg => "LiftAvg",
            Comparison::Custom(_) => "Custom(..)",
        };
        f.write_str(name)
    }
}

fn log_odds(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

impl Comparison {
    pub fn is_averaged(&self) -> bool {
        matches!(
            self,
            Comparison::DifferenceAvg
                | Comparison::RatioAvg
                | Comparison::LnRatioAvg
                | Comparison::LnOrAvg
                | Comparison::LiftAvg
        )
    }

    pub fn combine(&self, hi: ArrayView1<f64>, lo: ArrayView1<f64>) -> Array1<f64> {
        match self {
            Comparison::Difference | Comparison::DifferenceAvg => &hi - &lo,
            Comparison::Ratio | Comparison::RatioAvg => &hi / &lo,
            Comparison::LnRatio | Comparison::LnRatioAvg => (&hi / &lo).mapv(f64::ln),
            Comparison::LnOr | Comparison::LnOrAvg => {
                hi.mapv(log_odds) - lo.mapv(log_odds)
            }
            Comparison::Lift | Comparison::LiftAvg => (&hi - &lo) / &lo,
            Comparison::Custom(f) => f(hi, lo),
        }
    }

    pub fn label(&self, hi: &str, lo: &str) -> String {
        match self {
            Comparison::Difference => format!("{hi} - {lo}"),
            Comparison::Ratio => format!("{hi} / {lo}"),
            Comparison::LnRatio => format!("ln({hi} / {lo})"),
            Comparison::LnOr => format!("ln(odds({hi}) / odds({lo}))"),
            Comparison::Lift => format!("lift({hi}, {lo})"),
            Comparison::DifferenceAvg => format!("mean({hi}) - mean({lo})"),
            Comparison::RatioAvg => format!("mean({hi}) / mean({lo})"),
            Comparison::LnRatioAvg => format!("ln(mean({hi}) / mean({lo}))"),
            Comparison::LnOrAvg => format!("ln(odds(mean({hi})) / odds(mean({lo})))"),
            Comparison::LiftAvg => format!("lift(mean({hi}), mean({lo}))"),
            Comparison::Custom(_) => format!("f({hi}, {lo})"),
        }
    }
}

/// Which derivative `slopes` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlopeKind {
    /// `dy/dx`.
    #[default]
    Dydx,
    /// Elasticity `dy/dx * x / y`.
    Eyex,
    /// Semi-elasticity `dy/dx / y`.
    Eydx,
    /// Semi-elasticity `dy/dx * x`.
    Dyex,
}

impl SlopeKind {
    pub fn label(self) -> &'static str {
        match self {
            SlopeKind::Dydx => "dY/dX",
            SlopeKind::Eyex => "eY/eX",
            SlopeKind::Eydx => "eY/dX",
            SlopeKind::Dyex => "dY/eX",
        }
    }

    fn needs_baseline(self) -> bool {
        matches!(self, SlopeKind::Eyex | SlopeKind::Eydx)
    }

    fn apply(self, dydx: Array1<f64>, x: &Array1<f64>, y: Option<&Array1<f64>>) -> Array1<f64> {
        match (self, y) {
            (SlopeKind::Eyex, Some(y)) => dydx * x / y,
            (SlopeKind::Eydx, Some(y)) => dydx / y,
            (SlopeKind::Dyex, _) => dydx * x,
            _ => dydx,
        }
    }
}

/// Change applied to a numeric focal variable.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericChange {
    /// Centered increment: `lo = x - h/2`, `hi = x + h/2`.
    Increment(f64),
    /// Centered increment of one standard deviation of the column.
    Sd,
    /// First to third quartile of the column.
    Iqr,
    /// Minimum to maximum of the column.
    MinMax,
    /// Fixed `(lo, hi)` values.
    Values(f64, f64),
    #[serde(skip)]
    Custom(ChangeFn),
}

impl Default for NumericChange {
    fn default() -> Self {
        NumericChange::Increment(1.0)
    }
}

impl fmt::Debug for NumericChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NumericChange::Increment(h) => write!(f, "Increment({h})"),
            NumericChange::Sd => f.write_str("Sd"),
            NumericChange::Iqr => f.write_str("Iqr"),
            NumericChange::MinMax => f.write_str("MinMax"),
            NumericChange::Values(lo, hi) => write!(f, "Values({lo}, {hi})"),
            NumericChange::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Contrasts formed between the levels of a categorical focal variable.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelChange {
    /// Every level against the first.
    #[default]
    Reference,
    /// Each level against the previous one.
    Sequential,
    /// Every pair `(i, j)` with `i < j`, as `level_j - level_i`.
    Pairwise,
    /// Every ordered pair of distinct levels.
    All,
    /// One explicit `(lo, hi)` pair.
    Pair(String, String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    Numeric(NumericChange),
    Levels(LevelChange),
}

/// A focal variable and, optionally, how it should be changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FocalVariable {
    pub name: String,
    #[serde(default)]
    pub change: Option<Change>,
}

impl FocalVariable {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            change: None,
        }
    }

    pub fn numeric(name: &str, change: NumericChange) -> Self {
        Self {
            name: name.to_string(),
            change: Some(Change::Numeric(change)),
        }
    }

    pub fn levels(name: &str, change: LevelChange) -> Self {
        Self {
            name: name.to_string(),
            change: Some(Change::Levels(change)),
        }
    }
}

#[derive(Clone)]
enum BlockKind {
    Compare,
    Slope { eps: f64, x: Array1<f64> },
}

/// One focal variable and one contrast: the grid evaluated twice.
#[derive(Clone)]
struct ContrastBlock {
    term: String,
    contrast: String,
    lo: Grid,
    hi: Grid,
    kind: BlockKind,
}

/// A fully specified estimand, ready to be evaluated at any parameters.
#[derive(Clone)]
pub struct EstimandPlan {
    kind: EstimandKind,
    grid: Grid,
    scale: String,
    blocks: Vec<ContrastBlock>,
    comparison: Comparison,
    slope: SlopeKind,
    labels: RowLabels,
}

impl EstimandPlan {
    /// Predictions at every grid row.
    pub fn predictions(grid: &Grid, scale: &str) -> Self {
        let mut columns = vec!["rowid".to_string()];
        columns.extend(grid.names().iter().cloned());
        let mut labels = RowLabels::new(columns);
        for r in 0..grid.nrows() {
            let mut row = vec![Value::Number(grid.rowid()[r] as f64)];
            row.extend(grid.row_values(r));
            labels.push(row);
        }
        Self {
            kind: EstimandKind::Predictions,
            grid: grid.clone(),
            scale: scale.to_string(),
            blocks: Vec::new(),
            comparison: Comparison::Difference,
            slope: SlopeKind::Dydx,
            labels,
        }
    }

    /// Predictions on a balanced grid, to be averaged by the focal variables.
    pub fn marginal_means(grid: &Grid, scale: &str) -> Self {
        Self {
            kind: EstimandKind::MarginalMeans,
            ..Self::predictions(grid, scale)
        }
    }

    /// Comparisons of predictions between `hi` and `lo` values of each focal
    /// variable. An empty `variables` list means every model predictor found
    /// in the grid.
    pub fn comparisons(
        model: &dyn FittedModel,
        grid: &Grid,
        scale: &str,
        variables: &[FocalVariable],
        comparison: Comparison,
    ) -> EffectsResult<Self> {
        let mut blocks = Vec::new();
        for focal in internal::resolve_focal(model, grid, variables)? {
            match grid.column(&focal.name)? {
                Column::Numeric(x) => {
                    let change = match &focal.change {
                        None => NumericChange::default(),
                        Some(Change::Numeric(c)) => c.clone(),
                        Some(Change::Levels(_)) => {
                            return Err(internal::wrong_change(&focal.name, "numeric"));
                        }
                    };
                    let (lo, hi, hi_label, lo_label) =
                        internal::numeric_pair(&focal.name, x, &change)?;
                    blocks.push(ContrastBlock {
                        term: focal.name.clone(),
                        contrast: comparison.label(&hi_label, &lo_label),
                        lo: grid.with_column(&focal.name, Column::Numeric(lo))?,
                        hi: grid.with_column(&focal.name, Column::Numeric(hi))?,
                        kind: BlockKind::Compare,
                    });
                }
                Column::Categorical(_) => {
                    blocks.extend(internal::level_blocks(model, grid, &focal, &comparison)?);
                }
            }
        }
        Ok(Self::with_blocks(
            EstimandKind::Comparisons,
            grid,
            scale,
            blocks,
            comparison,
            SlopeKind::Dydx,
        ))
    }

    /// Numerical partial derivatives of the predictions with respect to each
    /// numeric focal variable, using a symmetric step of `eps` (default
    /// `1e-4` times the range of the variable in the grid). Categorical focal
    /// variables get level contrasts instead.
    pub fn slopes(
        model: &dyn FittedModel,
        grid: &Grid,
        scale: &str,
        variables: &[FocalVariable],
        slope: SlopeKind,
        eps: Option<f64>,
    ) -> EffectsResult<Self> {
        if let Some(e) = eps {
            if !(e.is_finite() && e > 0.0) {
                return Err(EffectsError::invalid_option(
                    "eps",
                    format!("step must be positive and finite, got {e}"),
                ));
            }
        }
        let mut blocks = Vec::new();
        for focal in internal::resolve_focal(model, grid, variables)? {
            match grid.column(&focal.name)? {
                Column::Numeric(x) => {
                    if matches!(focal.change, Some(Change::Levels(_))) {
                        return Err(internal::wrong_change(&focal.name, "numeric"));
                    }
                    let eps = eps.unwrap_or_else(|| internal::default_eps(x));
                    log::debug!("slope step for '{}': {eps:e}", focal.name);
                    let lo = x.mapv(|v| v - eps / 2.0);
                    let hi = x.mapv(|v| v + eps / 2.0);
                    blocks.push(ContrastBlock {
                        term: focal.name.clone(),
                        contrast: slope.label().to_string(),
                        lo: grid.with_column(&focal.name, Column::Numeric(lo))?,
                        hi: grid.with_column(&focal.name, Column::Numeric(hi))?,
                        kind: BlockKind::Slope { eps, x: x.clone() },
                    });
                }
                Column::Categorical(_) => {
                    blocks.extend(internal::level_blocks(
                        model,
                        grid,
                        &focal,
                        &Comparison::Difference,
                    )?);
                }
            }
        }
        Ok(Self::with_blocks(
            EstimandKind::Slopes,
            grid,
            scale,
            blocks,
            Comparison::Difference,
            slope,
        ))
    }

    fn with_blocks(
        kind: EstimandKind,
        grid: &Grid,
        scale: &str,
        blocks: Vec<ContrastBlock>,
        comparison: Comparison,
        slope: SlopeKind,
    ) -> Self {
        let mut columns = vec![
            "rowid".to_string(),
            "term".to_string(),
            "contrast".to_string(),
        ];
        columns.extend(grid.names().iter().cloned());
        let mut labels = RowLabels::new(columns);
        for block in &blocks {
            for r in 0..grid.nrows() {
                let mut row = vec![
                    Value::Number(grid.rowid()[r] as f64),
                    Value::Level(block.term.clone()),
                    Value::Level(block.contrast.clone()),
                ];
                row.extend(grid.row_values(r));
                labels.push(row);
            }
        }
        Self {
            kind,
            grid: grid.clone(),
            scale: scale.to_string(),
            blocks,
            comparison,
            slope,
            labels,
        }
    }

    pub fn kind(&self) -> EstimandKind {
        self.kind
    }

    pub fn scale(&self) -> &str {
        &self.scale
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /// Labels of the unaggregated rows.
    pub fn labels(&self) -> &RowLabels {
        &self.labels
    }

    /// Columns that always separate groups when aggregating.
    pub fn keys(&self) -> &'static [&'static str] {
        match self.kind {
            EstimandKind::Comparisons | EstimandKind::Slopes => &["term", "contrast"],
            _ => &[],
        }
    }

    /// Expands per-grid-row weights to one weight per unaggregated row.
    pub fn row_weights(&self, grid_weights: &Array1<f64>) -> Array1<f64> {
        if self.blocks.is_empty() {
            return grid_weights.clone();
        }
        self.blocks
            .iter()
            .flat_map(|_| grid_weights.iter().copied())
            .collect()
    }

    /// Evaluates the estimand at `params` and aggregates it with `plan`.
    pub fn evaluate(
        &self,
        model: &dyn FittedModel,
        params: ArrayView1<f64>,
        plan: &AggregationPlan,
    ) -> EffectsResult<Array1<f64>> {
        if self.blocks.is_empty() {
            let predictions = model.predict(params, &self.grid, &self.scale)?;
            return Ok(plan.apply(predictions.view()));
        }

        if self.comparison.is_averaged() {
            let n = self.labels.len();
            let mut hi_all = Vec::with_capacity(n);
            let mut lo_all = Vec::with_capacity(n);
            for block in &self.blocks {
                hi_all.extend(model.predict(params, &block.hi, &self.scale)?);
                lo_all.extend(model.predict(params, &block.lo, &self.scale)?);
            }
            let hi = plan.apply(Array1::from_vec(hi_all).view());
            let lo = plan.apply(Array1::from_vec(lo_all).view());
            return Ok(self.comparison.combine(hi.view(), lo.view()));
        }

        let has_slope_blocks = self
            .blocks
            .iter()
            .any(|b| matches!(b.kind, BlockKind::Slope { .. }));
        let baseline = if has_slope_blocks && self.slope.needs_baseline() {
            Some(model.predict(params, &self.grid, &self.scale)?)
        } else {
            None
        };

        let mut rows = Vec::with_capacity(self.labels.len());
        for block in &self.blocks {
            let hi = model.predict(params, &block.hi, &self.scale)?;
            let lo = model.predict(params, &block.lo, &self.scale)?;
            let values = match &block.kind {
                BlockKind::Compare => self.comparison.combine(hi.view(), lo.view()),
                BlockKind::Slope { eps, x } => {
                    let dydx = (hi - lo) / *eps;
                    self.slope.apply(dydx, x, baseline.as_ref())
                }
            };
            rows.extend(values);
        }
        Ok(plan.apply(Array1::from_vec(rows).view()))
    }
}

mod internal {
    use super::*;

    pub(super) fn wrong_change(name: &str, expected: &str) -> EffectsError {
        EffectsError::invalid_option(
            "variables",
            format!("'{name}' is a {expected} column, but a change for the other column type was given"),
        )
    }

    /// Focal variables to use: the requested ones (each must be a model
    /// predictor present in the grid), or all such predictors when none are
    /// requested.
    pub(super) fn resolve_focal(
        model: &dyn FittedModel,
        grid: &Grid,
        variables: &[FocalVariable],
    ) -> EffectsResult<Vec<FocalVariable>> {
        let predictors = model.predictors();
        if variables.is_empty() {
            let all: Vec<FocalVariable> = predictors
                .iter()
                .filter(|p| grid.contains(p))
                .map(|p| FocalVariable::new(p))
                .collect();
            if all.is_empty() {
                return Err(EffectsError::EmptyFocalSet(
                    "none of the model's predictors appear in the grid".to_string(),
                ));
            }
            return Ok(all);
        }
        for focal in variables {
            if !predictors.contains(&focal.name) || !grid.contains(&focal.name) {
                return Err(EffectsError::EmptyFocalSet(format!(
                    "'{}' is not a model predictor present in the grid. Model predictors: {}",
                    focal.name,
                    predictors.join(", ")
                )));
            }
        }
        Ok(variables.to_vec())
    }

    pub(super) fn default_eps(x: &Array1<f64>) -> f64 {
        let (min, max) = x
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        let range = max - min;
        if range.is_finite() && range > 0.0 {
            1e-4 * range
        } else {
            1e-4
        }
    }

    /// Returns `(lo, hi, hi_label, lo_label)` for a numeric change.
    pub(super) fn numeric_pair(
        name: &str,
        x: &Array1<f64>,
        change: &NumericChange,
    ) -> EffectsResult<(Array1<f64>, Array1<f64>, String, String)> {
        let n = x.len();
        if n == 0 {
            return Err(EffectsError::invalid_option(
                "variables",
                format!("cannot change '{name}' on an empty grid"),
            ));
        }
        let constant = |v: f64| Array1::from_elem(n, v);
        let mut sorted = x.to_vec();
        sorted.sort_by(f64::total_cmp);
        Ok(match change {
            NumericChange::Increment(h) => (
                x.mapv(|v| v - h / 2.0),
                x.mapv(|v| v + h / 2.0),
                format!("({name} + {h})"),
                name.to_string(),
            ),
            NumericChange::Sd => {
                if n < 2 {
                    return Err(EffectsError::invalid_option(
                        "variables",
                        format!("a standard-deviation change of '{name}' needs at least two grid rows"),
                    ));
                }
                let sd = x.std(1.0);
                (
                    x.mapv(|v| v - sd / 2.0),
                    x.mapv(|v| v + sd / 2.0),
                    format!("({name} + sd)"),
                    name.to_string(),
                )
            }
            NumericChange::Iqr => (
                constant(quantile(&sorted, 0.25)),
                constant(quantile(&sorted, 0.75)),
                "Q3".to_string(),
                "Q1".to_string(),
            ),
            NumericChange::MinMax => (
                constant(sorted[0]),
                constant(sorted[n - 1]),
                "max".to_string(),
                "min".to_string(),
            ),
            NumericChange::Values(lo, hi) => {
                (constant(*lo), constant(*hi), hi.to_string(), lo.to_string())
            }
            NumericChange::Custom(f) => {
                let (lo, hi) = f(x.view());
                if lo.len() != n || hi.len() != n {
                    return Err(EffectsError::invalid_option(
                        "variables",
                        format!(
                            "custom change of '{name}' returned {} and {} values for {n} rows",
                            lo.len(),
                            hi.len()
                        ),
                    ));
                }
                (lo, hi, "hi".to_string(), "lo".to_string())
            }
        })
    }

    /// `(lo, hi)` level pairs for a categorical change.
    pub(super) fn level_pairs(
        name: &str,
        levels: &[String],
        change: &LevelChange,
    ) -> EffectsResult<Vec<(String, String)>> {
        if levels.len() < 2 {
            return Err(EffectsError::EmptyFocalSet(format!(
                "'{name}' has fewer than two levels, so no contrast can be formed"
            )));
        }
        let k = levels.len();
        let pairs = match change {
            LevelChange::Reference => (1..k).map(|i| (0, i)).collect::<Vec<_>>(),
            LevelChange::Sequential => (1..k).map(|i| (i - 1, i)).collect(),
            LevelChange::Pairwise => (0..k)
                .flat_map(|i| (i + 1..k).map(move |j| (i, j)))
                .collect(),
            LevelChange::All => (0..k)
                .flat_map(|i| (0..k).filter(move |&j| j != i).map(move |j| (i, j)))
                .collect(),
            LevelChange::Pair(lo, hi) => {
                for level in [lo, hi] {
                    if !levels.contains(level) {
                        return Err(EffectsError::invalid_option(
                            "variables",
                            format!(
                                "level '{level}' of '{name}' is unknown. Known levels: {}",
                                levels.join(", ")
                            ),
                        ));
                    }
                }
                return Ok(vec![(lo.clone(), hi.clone())]);
            }
        };
        Ok(pairs
            .into_iter()
            .map(|(i, j)| (levels[i].clone(), levels[j].clone()))
            .collect())
    }

    pub(super) fn level_blocks(
        model: &dyn FittedModel,
        grid: &Grid,
        focal: &FocalVariable,
        comparison: &Comparison,
    ) -> EffectsResult<Vec<ContrastBlock>> {
        let change = match &focal.change {
            None => LevelChange::default(),
            Some(Change::Levels(c)) => c.clone(),
            Some(Change::Numeric(_)) => return Err(wrong_change(&focal.name, "categorical")),
        };
        let levels = match model.levels(&focal.name) {
            Some(levels) => levels,
            None => grid.levels(&focal.name)?,
        };
        let n = grid.nrows();
        level_pairs(&focal.name, &levels, &change)?
            .into_iter()
            .map(|(lo, hi)| -> EffectsResult<ContrastBlock> {
                Ok(ContrastBlock {
                    term: focal.name.clone(),
                    contrast: comparison.label(&hi, &lo),
                    lo: grid.with_column(&focal.name, Column::Categorical(vec![lo; n]))?,
                    hi: grid.with_column(&focal.name, Column::Categorical(vec![hi; n]))?,
                    kind: BlockKind::Compare,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::construction::{Formula, Term};
    use crate::effects::model::{GeneralizedLinearModel, LinkFunction, ScaleRegistry};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn quadratic() -> GeneralizedLinearModel {
        GeneralizedLinearModel::new(
            Formula::new(
                Some("y"),
                vec![
                    Term::Intercept,
                    Term::numeric("x"),
                    Term::power("x", 2),
                    Term::factor("g", &["a", "b", "c"]),
                ],
            ),
            LinkFunction::Identity,
            array![1.0, 1.0, 2.0, 0.5, -1.0],
            None,
            &ScaleRegistry::standard(),
        )
        .unwrap()
    }

    fn grid() -> Grid {
        Grid::from_columns(vec![
            ("x", Column::Numeric(array![-2.0, -1.0, 0.0, 1.0, 2.0])),
            (
                "g",
                Column::Categorical(vec!["a".into(), "b".into(), "c".into(), "a".into(), "b".into()]),
            ),
        ])
        .unwrap()
    }

    fn evaluate(plan: &EstimandPlan, model: &GeneralizedLinearModel) -> Array1<f64> {
        let identity = AggregationPlan::identity(plan.labels().len());
        plan.evaluate(model, model.coefficients().view(), &identity)
            .unwrap()
    }

    #[test]
    fn test_slopes_match_closed_form_derivative() {
        let model = quadratic();
        let plan = EstimandPlan::slopes(
            &model,
            &grid(),
            "response",
            &[FocalVariable::new("x")],
            SlopeKind::Dydx,
            None,
        )
        .unwrap();
        let slopes = evaluate(&plan, &model);
        for (i, x) in [-2.0, -1.0, 0.0, 1.0, 2.0].iter().enumerate() {
            assert_abs_diff_eq!(slopes[i], 1.0 + 4.0 * x, epsilon = 1e-6);
        }
        assert_eq!(plan.labels().value(0, "contrast"), Some(&Value::from("dY/dX")));
    }

    #[test]
    fn test_swapped_pair_negates_difference() {
        let model = quadratic();
        let forward = EstimandPlan::comparisons(
            &model,
            &grid(),
            "response",
            &[FocalVariable::numeric("x", NumericChange::Values(0.0, 3.0))],
            Comparison::Difference,
        )
        .unwrap();
        let backward = EstimandPlan::comparisons(
            &model,
            &grid(),
            "response",
            &[FocalVariable::numeric("x", NumericChange::Values(3.0, 0.0))],
            Comparison::Difference,
        )
        .unwrap();
        let a = evaluate(&forward, &model);
        let b = evaluate(&backward, &model);
        for (u, v) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(*u, -*v, epsilon = 1e-12);
        }
        // y(3) - y(0) = 3 + 18
        assert_abs_diff_eq!(a[0], 21.0, epsilon = 1e-12);
    }

    #[test]
    fn test_categorical_reference_contrasts_use_model_levels() {
        let model = quadratic();
        let plan = EstimandPlan::comparisons(
            &model,
            &grid(),
            "response",
            &[FocalVariable::new("g")],
            Comparison::Difference,
        )
        .unwrap();
        assert_eq!(plan.labels().len(), 10);
        let values = evaluate(&plan, &model);
        assert_abs_diff_eq!(values[0], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(values[5], -1.0, epsilon = 1e-12);
        assert_eq!(plan.labels().value(5, "contrast"), Some(&Value::from("c - a")));
    }

    #[test]
    fn test_pairwise_and_all_level_changes() {
        let levels: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let pairwise = internal::level_pairs("g", &levels, &LevelChange::Pairwise).unwrap();
        assert_eq!(pairwise.len(), 6);
        assert_eq!(pairwise[0], ("a".to_string(), "b".to_string()));
        let all = internal::level_pairs("g", &levels, &LevelChange::All).unwrap();
        assert_eq!(all.len(), 12);
        let sequential = internal::level_pairs("g", &levels, &LevelChange::Sequential).unwrap();
        assert_eq!(sequential[2], ("c".to_string(), "d".to_string()));
        assert!(
            internal::level_pairs("g", &levels, &LevelChange::Pair("a".into(), "z".into()))
                .is_err()
        );
    }

    #[test]
    fn test_centered_increment_and_ratio() {
        let model = quadratic();
        let plan = EstimandPlan::comparisons(
            &model,
            &grid(),
            "response",
            &[FocalVariable::numeric("x", NumericChange::Increment(2.0))],
            Comparison::Ratio,
        )
        .unwrap();
        let values = evaluate(&plan, &model);
        // Row 2 (x = 0, g = c): y(1) / y(-1) = (1 + 1 + 2 - 1) / (1 - 1 + 2 - 1)
        assert_abs_diff_eq!(values[2], 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_averaged_comparison_combines_group_means() {
        let model = quadratic();
        let plan = EstimandPlan::comparisons(
            &model,
            &grid(),
            "response",
            &[FocalVariable::numeric("x", NumericChange::Values(0.0, 1.0))],
            Comparison::RatioAvg,
        )
        .unwrap();
        let (agg, _) = AggregationPlan::build(
            plan.labels(),
            plan.keys(),
            &crate::effects::aggregate::By::All,
            Array1::ones(5).view(),
        )
        .unwrap();
        let value = plan
            .evaluate(&model, model.coefficients().view(), &agg)
            .unwrap();
        // Group offsets average to (0 + 0.5 - 1 + 0 + 0.5) / 5 = 0
        assert_abs_diff_eq!(value[0], 4.0 / 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_unknown_focal_variable_is_rejected() {
        let model = quadratic();
        let err = EstimandPlan::comparisons(
            &model,
            &grid(),
            "response",
            &[FocalVariable::new("z")],
            Comparison::Difference,
        )
        .err()
        .unwrap();
        assert!(matches!(err, EffectsError::EmptyFocalSet(_)));
    }

    #[test]
    fn test_elasticity_scales_by_x_over_y() {
        let model = quadratic();
        let single = Grid::from_columns(vec![
            ("x", Column::Numeric(array![1.0])),
            ("g", Column::Categorical(vec!["a".into()])),
        ])
        .unwrap();
        let plan = EstimandPlan::slopes(
            &model,
            &single,
            "response",
            &[FocalVariable::new("x")],
            SlopeKind::Eyex,
            Some(1e-5),
        )
        .unwrap();
        let value = evaluate(&plan, &model);
        // dy/dx = 5, y = 4, x = 1
        assert_abs_diff_eq!(value[0], 5.0 / 4.0, epsilon = 1e-6);
    }
}
