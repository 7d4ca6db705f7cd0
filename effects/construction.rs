//! # Design Matrix Construction
//!
//! A `Formula` is an ordered list of terms over named base variables. The
//! design matrix is always rebuilt from the base columns of the grid being
//! evaluated, so a perturbed base variable flows through every term derived
//! from it: polynomial powers, logs and interactions all see the same shifted
//! value. Nothing is cached between grids.

use crate::effects::grid::{Column, Grid};
use crate::effects::model::ModelError;
use itertools::Itertools;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// A single model term. Each term expands to one or more design columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Term {
    Intercept,
    Numeric {
        variable: String,
    },
    Power {
        variable: String,
        degree: i32,
    },
    Log {
        variable: String,
    },
    /// Treatment-coded factor. The first level is the reference and gets no
    /// column.
    Factor {
        variable: String,
        levels: Vec<String>,
    },
    Interaction {
        terms: Vec<Term>,
    },
}

impl Term {
    pub fn numeric(variable: &str) -> Self {
        Term::Numeric {
            variable: variable.to_string(),
        }
    }

    pub fn power(variable: &str, degree: i32) -> Self {
        Term::Power {
            variable: variable.to_string(),
            degree,
        }
    }

    pub fn log(variable: &str) -> Self {
        Term::Log {
            variable: variable.to_string(),
        }
    }

    pub fn factor(variable: &str, levels: &[&str]) -> Self {
        Term::Factor {
            variable: variable.to_string(),
            levels: levels.iter().map(|l| l.to_string()).collect(),
        }
    }

    pub fn interaction(terms: Vec<Term>) -> Self {
        Term::Interaction { terms }
    }

    /// Base variables this term reads, in first-use order.
    pub fn variables(&self) -> Vec<String> {
        match self {
            Term::Intercept => Vec::new(),
            Term::Numeric { variable }
            | Term::Power { variable, .. }
            | Term::Log { variable }
            | Term::Factor { variable, .. } => vec![variable.clone()],
            Term::Interaction { terms } => terms
                .iter()
                .flat_map(Term::variables)
                .unique()
                .collect(),
        }
    }

    pub fn column_names(&self) -> Vec<String> {
        match self {
            Term::Intercept => vec!["(Intercept)".to_string()],
            Term::Numeric { variable } => vec![variable.clone()],
            Term::Power { variable, degree } => vec![format!("{variable}^{degree}")],
            Term::Log { variable } => vec![format!("log({variable})")],
            Term::Factor { variable, levels } => levels
                .iter()
                .skip(1)
                .map(|level| format!("{variable}{level}"))
                .collect(),
            Term::Interaction { terms } => terms
                .iter()
                .map(Term::column_names)
                .multi_cartesian_product()
                .map(|parts| parts.join(":"))
                .collect(),
        }
    }

    pub fn ncols(&self) -> usize {
        match self {
            Term::Intercept | Term::Numeric { .. } | Term::Power { .. } | Term::Log { .. } => 1,
            Term::Factor { levels, .. } => levels.len().saturating_sub(1),
            Term::Interaction { terms } => terms.iter().map(Term::ncols).product(),
        }
    }

    /// Levels of a factor variable, if this term (or any interaction member)
    /// encodes it.
    pub fn levels_of(&self, name: &str) -> Option<&[String]> {
        match self {
            Term::Factor { variable, levels } if variable == name => Some(levels),
            Term::Interaction { terms } => terms.iter().find_map(|t| t.levels_of(name)),
            _ => None,
        }
    }

    fn columns(&self, grid: &Grid) -> Result<Vec<Array1<f64>>, ModelError> {
        let n = grid.nrows();
        match self {
            Term::Intercept => Ok(vec![Array1::ones(n)]),
            Term::Numeric { variable } => Ok(vec![numeric_column(grid, variable)?.clone()]),
            Term::Power { variable, degree } => {
                let x = numeric_column(grid, variable)?;
                Ok(vec![x.mapv(|v| v.powi(*degree))])
            }
            Term::Log { variable } => {
                let x = numeric_column(grid, variable)?;
                if let Some(bad) = x.iter().find(|v| v.is_nan() || **v <= 0.0) {
                    return Err(ModelError::DomainError(format!(
                        "log({variable}) is undefined at {variable} = {bad}"
                    )));
                }
                Ok(vec![x.mapv(f64::ln)])
            }
            Term::Factor { variable, levels } => {
                let observed = categorical_column(grid, variable)?;
                if let Some(unknown) = observed.iter().find(|l| !levels.contains(*l)) {
                    return Err(ModelError::UnknownLevel {
                        variable: variable.clone(),
                        level: unknown.clone(),
                        known: levels.clone(),
                    });
                }
                Ok(levels
                    .iter()
                    .skip(1)
                    .map(|level| {
                        observed
                            .iter()
                            .map(|l| if l == level { 1.0 } else { 0.0 })
                            .collect()
                    })
                    .collect())
            }
            Term::Interaction { terms } => {
                let parts = terms
                    .iter()
                    .map(|t| t.columns(grid))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(parts
                    .iter()
                    .map(|cols| cols.iter())
                    .multi_cartesian_product()
                    .map(|combo| {
                        combo
                            .into_iter()
                            .fold(Array1::ones(n), |acc: Array1<f64>, col| acc * col)
                    })
                    .collect())
            }
        }
    }
}

fn numeric_column<'a>(grid: &'a Grid, variable: &str) -> Result<&'a Array1<f64>, ModelError> {
    match grid.column(variable) {
        Ok(Column::Numeric(values)) => Ok(values),
        Ok(other) => Err(ModelError::ColumnType {
            variable: variable.to_string(),
            expected: "numeric",
            found: other.kind(),
        }),
        Err(_) => Err(ModelError::MissingPredictor(variable.to_string())),
    }
}

fn categorical_column<'a>(grid: &'a Grid, variable: &str) -> Result<&'a [String], ModelError> {
    match grid.column(variable) {
        Ok(Column::Categorical(levels)) => Ok(levels),
        Ok(other) => Err(ModelError::ColumnType {
            variable: variable.to_string(),
            expected: "categorical",
            found: other.kind(),
        }),
        Err(_) => Err(ModelError::MissingPredictor(variable.to_string())),
    }
}

/// An ordered set of terms plus the name of the response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Formula {
    pub response: Option<String>,
    pub terms: Vec<Term>,
}

impl Formula {
    pub fn new(response: Option<&str>, terms: Vec<Term>) -> Self {
        Self {
            response: response.map(str::to_string),
            terms,
        }
    }

    pub fn ncols(&self) -> usize {
        self.terms.iter().map(Term::ncols).sum()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.terms.iter().flat_map(Term::column_names).collect()
    }

    /// Distinct base variables read by the formula.
    pub fn predictors(&self) -> Vec<String> {
        self.terms
            .iter()
            .flat_map(Term::variables)
            .unique()
            .collect()
    }

    pub fn levels(&self, variable: &str) -> Option<Vec<String>> {
        self.terms
            .iter()
            .find_map(|t| t.levels_of(variable))
            .map(<[String]>::to_vec)
    }

    /// Builds the `n x ncols` design matrix for `grid`, in term order.
    pub fn design_matrix(&self, grid: &Grid) -> Result<Array2<f64>, ModelError> {
        let n = grid.nrows();
        let mut x = Array2::<f64>::zeros((n, self.ncols()));
        let mut offset = 0;
        for term in &self.terms {
            for column in term.columns(grid)? {
                x.column_mut(offset).assign(&column);
                offset += 1;
            }
        }
        Ok(x)
    }
}
