//! # By-Group Aggregation
//!
//! Aggregation collapses per-row estimates into weighted group means. The
//! grouping is resolved once into an `AggregationPlan` (member rows and their
//! normalized weights for every group); the plan is then re-applied verbatim
//! at every perturbed parameter vector, so the delta-method Jacobian sees the
//! exact same averaging as the point estimate.

use crate::effects::errors::{EffectsError, EffectsResult};
use crate::effects::grid::{GridError, KeyPart};
use crate::effects::table::RowLabels;
use ahash::AHashMap;
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

/// Grouping specification for aggregated estimates.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum By {
    /// One output row per input row.
    #[default]
    None,
    /// Average everything (within each term and contrast).
    All,
    /// Average within each combination of the named columns.
    Columns(Vec<String>),
}

impl By {
    pub fn columns(&self) -> Vec<String> {
        match self {
            By::Columns(cols) => cols.clone(),
            By::None | By::All => Vec::new(),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, By::None)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Group {
    members: Vec<usize>,
    weights: Vec<f64>,
}

/// Resolved grouping: for each output row, the contributing input rows and
/// their weights (summing to one). Rows with zero weight are left out.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationPlan {
    groups: Vec<Group>,
    n_input: usize,
}

impl AggregationPlan {
    pub fn identity(n: usize) -> Self {
        Self {
            groups: (0..n)
                .map(|i| Group {
                    members: vec![i],
                    weights: vec![1.0],
                })
                .collect(),
            n_input: n,
        }
    }

    /// Groups rows of `labels` by the `keys` columns that are present (for
    /// example `term` and `contrast`) followed by the `by` columns. Groups are
    /// emitted in order of first appearance. Returns the plan together with
    /// the labels of the aggregated rows.
    pub fn build(
        labels: &RowLabels,
        keys: &[&str],
        by: &By,
        weights: ArrayView1<f64>,
    ) -> EffectsResult<(Self, RowLabels)> {
        let n = labels.len();
        if weights.len() != n {
            return Err(GridError::InvalidWeights(format!(
                "expected {n} weights, found {}",
                weights.len()
            ))
            .into());
        }
        if by.is_none() {
            return Ok((Self::identity(n), labels.clone()));
        }

        let mut group_columns: Vec<String> = keys
            .iter()
            .filter(|k| labels.column_index(k).is_some())
            .map(|k| k.to_string())
            .collect();
        for column in by.columns() {
            if !group_columns.contains(&column) {
                group_columns.push(column);
            }
        }
        let indices = group_columns
            .iter()
            .map(|c| {
                labels.column_index(c).ok_or_else(|| GridError::ColumnNotFound {
                    name: c.clone(),
                    available: labels.columns().to_vec(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut lookup: AHashMap<Vec<KeyPart>, usize> = AHashMap::new();
        let mut raw: Vec<(Vec<usize>, Vec<f64>)> = Vec::new();
        let mut out_labels = RowLabels::new(group_columns.clone());
        for row in 0..n {
            let values: Vec<_> = indices.iter().map(|&c| labels.row(row)[c].clone()).collect();
            let key: Vec<KeyPart> = values.iter().map(|v| v.key()).collect();
            let slot = *lookup.entry(key).or_insert_with(|| {
                raw.push((Vec::new(), Vec::new()));
                out_labels.push(values);
                raw.len() - 1
            });
            let w = weights[row];
            if w > 0.0 {
                raw[slot].0.push(row);
                raw[slot].1.push(w);
            }
        }

        let mut groups = Vec::with_capacity(raw.len());
        for (g, (members, w)) in raw.into_iter().enumerate() {
            let total: f64 = w.iter().sum();
            if !(total > 0.0) {
                return Err(EffectsError::ZeroWeightGroup(out_labels.describe(g)));
            }
            groups.push(Group {
                members,
                weights: w.into_iter().map(|x| x / total).collect(),
            });
        }
        log::debug!(
            "aggregation plan: {n} rows into {} groups by [{}]",
            groups.len(),
            group_columns.join(", ")
        );
        Ok((
            Self {
                groups,
                n_input: n,
            },
            out_labels,
        ))
    }

    pub fn n_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn n_input(&self) -> usize {
        self.n_input
    }

    /// Weighted group means of `values`.
    pub fn apply(&self, values: ArrayView1<f64>) -> Array1<f64> {
        self.groups
            .iter()
            .map(|g| {
                g.members
                    .iter()
                    .zip(&g.weights)
                    .map(|(&i, &w)| w * values[i])
                    .sum()
            })
            .collect()
    }
}
