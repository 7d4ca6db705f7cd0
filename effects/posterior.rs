//! # Posterior and Black-Box Adapters
//!
//! `PosteriorModel` wraps any adapter together with a matrix of posterior
//! parameter draws. It has no covariance matrix: the pipeline evaluates the
//! estimand once per draw and summarizes the resulting distribution instead
//! of running the delta method.
//!
//! `BlackBoxModel` wraps an arbitrary prediction closure with no parameters
//! at all, for estimate-only output from models that expose nothing but
//! `predict`.

use crate::effects::grid::Grid;
use crate::effects::model::{FittedModel, ModelError, ScaleRegistry, ScaleSet};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use std::fmt;
use std::sync::Arc;

pub struct PosteriorModel<M: FittedModel> {
    inner: M,
    draws: Array2<f64>,
}

impl<M: FittedModel> PosteriorModel<M> {
    /// `draws` has one row per posterior draw and one column per parameter.
    pub fn new(inner: M, draws: Array2<f64>) -> Result<Self, ModelError> {
        let p = inner.coefficients().len();
        if draws.ncols() != p {
            return Err(ModelError::DrawShape {
                found: draws.ncols(),
                expected: p,
            });
        }
        if draws.nrows() == 0 {
            return Err(ModelError::PredictionFailed(
                "posterior draw matrix has no rows".to_string(),
            ));
        }
        Ok(Self { inner, draws })
    }

    pub fn n_draws(&self) -> usize {
        self.draws.nrows()
    }
}

impl<M: FittedModel> FittedModel for PosteriorModel<M> {
    fn class_name(&self) -> &str {
        self.inner.class_name()
    }

    /// Posterior mean of the draws.
    fn coefficients(&self) -> Array1<f64> {
        self.draws
            .mean_axis(Axis(0))
            .unwrap_or_else(|| self.inner.coefficients())
    }

    fn vcov(&self) -> Result<Array2<f64>, ModelError> {
        Err(ModelError::NoCovariance {
            class: self.class_name().to_string(),
        })
    }

    fn predict(
        &self,
        params: ArrayView1<f64>,
        grid: &Grid,
        scale: &str,
    ) -> Result<Array1<f64>, ModelError> {
        self.inner.predict(params, grid, scale)
    }

    fn predictors(&self) -> Vec<String> {
        self.inner.predictors()
    }

    fn response(&self) -> Option<String> {
        self.inner.response()
    }

    fn scales(&self) -> &ScaleSet {
        self.inner.scales()
    }

    fn levels(&self, variable: &str) -> Option<Vec<String>> {
        self.inner.levels(variable)
    }

    fn posterior_draws(&self) -> Option<ArrayView2<'_, f64>> {
        Some(self.draws.view())
    }
}

pub type PredictFn = Arc<dyn Fn(&Grid) -> Result<Array1<f64>, ModelError> + Send + Sync>;

/// A model known only through its predictions.
pub struct BlackBoxModel {
    predictors: Vec<String>,
    response: Option<String>,
    scales: ScaleSet,
    predict_fn: PredictFn,
}

impl fmt::Debug for BlackBoxModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlackBoxModel")
            .field("predictors", &self.predictors)
            .field("response", &self.response)
            .finish_non_exhaustive()
    }
}

impl BlackBoxModel {
    pub fn new(
        predictors: &[&str],
        response: Option<&str>,
        predict_fn: PredictFn,
        registry: &ScaleRegistry,
    ) -> Result<Self, ModelError> {
        Ok(Self {
            predictors: predictors.iter().map(|p| p.to_string()).collect(),
            response: response.map(str::to_string),
            scales: registry.get("blackbox")?,
            predict_fn,
        })
    }
}

impl FittedModel for BlackBoxModel {
    fn class_name(&self) -> &str {
        "blackbox"
    }

    fn coefficients(&self) -> Array1<f64> {
        Array1::zeros(0)
    }

    fn vcov(&self) -> Result<Array2<f64>, ModelError> {
        Err(ModelError::NoCovariance {
            class: self.class_name().to_string(),
        })
    }

    fn predict(
        &self,
        params: ArrayView1<f64>,
        grid: &Grid,
        scale: &str,
    ) -> Result<Array1<f64>, ModelError> {
        if !params.is_empty() {
            return Err(ModelError::ParameterLength {
                found: params.len(),
                expected: 0,
            });
        }
        self.resolve_scale(Some(scale))?;
        let predictions = (self.predict_fn)(grid)?;
        if predictions.len() != grid.nrows() {
            return Err(ModelError::PredictionFailed(format!(
                "black-box predictor returned {} values for a grid of {} rows",
                predictions.len(),
                grid.nrows()
            )));
        }
        Ok(predictions)
    }

    fn predictors(&self) -> Vec<String> {
        self.predictors.clone()
    }

    fn response(&self) -> Option<String> {
        self.response.clone()
    }

    fn scales(&self) -> &ScaleSet {
        &self.scales
    }

    fn levels(&self, _: &str) -> Option<Vec<String>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::construction::{Formula, Term};
    use crate::effects::grid::Column;
    use crate::effects::model::{GeneralizedLinearModel, LinkFunction};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn linear() -> GeneralizedLinearModel {
        GeneralizedLinearModel::new(
            Formula::new(Some("y"), vec![Term::Intercept, Term::numeric("x")]),
            LinkFunction::Identity,
            array![0.0, 0.0],
            None,
            &ScaleRegistry::standard(),
        )
        .unwrap()
    }

    #[test]
    fn test_posterior_coefficients_are_draw_means() {
        let model = PosteriorModel::new(linear(), array![[1.0, 2.0], [3.0, 4.0]]).unwrap();
        assert_eq!(model.coefficients(), array![2.0, 3.0]);
        assert!(matches!(model.vcov(), Err(ModelError::NoCovariance { .. })));
        assert_eq!(model.posterior_draws().map(|d| d.nrows()), Some(2));
        assert_eq!(model.n_draws(), 2);
    }

    #[test]
    fn test_posterior_rejects_wrong_width() {
        assert!(matches!(
            PosteriorModel::new(linear(), Array2::zeros((5, 3))),
            Err(ModelError::DrawShape { found: 3, expected: 2 })
        ));
    }

    #[test]
    fn test_black_box_predicts_without_parameters() {
        let model = BlackBoxModel::new(
            &["x"],
            Some("y"),
            Arc::new(|grid: &Grid| -> Result<Array1<f64>, ModelError> {
                let x = grid.numeric("x")?;
                Ok(x.mapv(|v| v * v))
            }),
            &ScaleRegistry::standard(),
        )
        .unwrap();
        let grid = Grid::from_columns(vec![("x", Column::Numeric(array![2.0, 3.0]))]).unwrap();
        let y = model
            .predict(model.coefficients().view(), &grid, "response")
            .unwrap();
        assert_abs_diff_eq!(y[1], 9.0, epsilon = 1e-12);
        assert!(model.predict(array![1.0].view(), &grid, "response").is_err());
        assert!(model.levels("x").is_none());
    }
}
