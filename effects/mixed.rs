//! # Random-Intercept Mixed Models
//!
//! A generalized linear model with one grouping factor whose per-group
//! intercepts (the conditional modes, or BLUPs) were estimated alongside the
//! fixed effects. Only the fixed effects are parameters: the coefficient
//! vector and covariance exposed to the delta-method engine are those of the
//! fixed part, and the random intercepts are held constant under perturbation.

use crate::effects::grid::Grid;
use crate::effects::model::{
    FittedModel, GeneralizedLinearModel, ModelError, ScaleRegistry, ScaleSet,
};
use ndarray::{Array1, Array2, ArrayView1};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomInterceptModel {
    fixed: GeneralizedLinearModel,
    group: String,
    intercepts: AHashMap<String, f64>,
    scales: ScaleSet,
    /// When false, predictions are population-level (random effects set to
    /// zero) and the grouping variable is not required in the grid.
    pub include_random_effects: bool,
}

impl RandomInterceptModel {
    pub fn new(
        fixed: GeneralizedLinearModel,
        group: &str,
        intercepts: AHashMap<String, f64>,
        registry: &ScaleRegistry,
    ) -> Result<Self, ModelError> {
        Ok(Self {
            fixed,
            group: group.to_string(),
            intercepts,
            scales: registry.get("mixed")?,
            include_random_effects: true,
        })
    }

    pub fn population_level(mut self) -> Self {
        self.include_random_effects = false;
        self
    }

    fn random_part(&self, grid: &Grid) -> Result<Array1<f64>, ModelError> {
        if !self.include_random_effects {
            return Ok(Array1::zeros(grid.nrows()));
        }
        let groups = grid
            .categorical(&self.group)
            .map_err(|_| ModelError::MissingPredictor(self.group.clone()))?;
        // Groups not seen at fit time get the population mean of zero.
        Ok(groups
            .iter()
            .map(|g| self.intercepts.get(g).copied().unwrap_or(0.0))
            .collect())
    }
}

impl FittedModel for RandomInterceptModel {
    fn class_name(&self) -> &str {
        "mixed"
    }

    fn coefficients(&self) -> Array1<f64> {
        self.fixed.coefficients()
    }

    fn vcov(&self) -> Result<Array2<f64>, ModelError> {
        self.fixed.vcov.clone().ok_or_else(|| ModelError::NoCovariance {
            class: self.class_name().to_string(),
        })
    }

    fn predict(
        &self,
        params: ArrayView1<f64>,
        grid: &Grid,
        scale: &str,
    ) -> Result<Array1<f64>, ModelError> {
        let scale = self.resolve_scale(Some(scale))?;
        let eta = self.fixed.linear_predictor(params, grid)? + self.random_part(grid)?;
        Ok(self.fixed.apply_scale(eta, &scale))
    }

    fn predictors(&self) -> Vec<String> {
        let mut predictors = self.fixed.predictors();
        if self.include_random_effects && !predictors.contains(&self.group) {
            predictors.push(self.group.clone());
        }
        predictors
    }

    fn response(&self) -> Option<String> {
        self.fixed.response()
    }

    fn scales(&self) -> &ScaleSet {
        &self.scales
    }

    fn levels(&self, variable: &str) -> Option<Vec<String>> {
        if variable == self.group {
            let mut groups: Vec<String> = self.intercepts.keys().cloned().collect();
            groups.sort();
            return Some(groups);
        }
        self.fixed.levels(variable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::construction::{Formula, Term};
    use crate::effects::grid::Column;
    use crate::effects::model::LinkFunction;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn model() -> RandomInterceptModel {
        let registry = ScaleRegistry::standard();
        let fixed = GeneralizedLinearModel::new(
            Formula::new(Some("y"), vec![Term::Intercept, Term::numeric("x")]),
            LinkFunction::Logit,
            array![0.2, 0.8],
            Some(array![[0.01, 0.0], [0.0, 0.02]]),
            &registry,
        )
        .unwrap();
        let intercepts: AHashMap<String, f64> = [("s2".to_string(), -0.5), ("s1".to_string(), 0.5)]
            .into_iter()
            .collect();
        RandomInterceptModel::new(fixed, "subject", intercepts, &registry).unwrap()
    }

    fn grid() -> Grid {
        Grid::from_columns(vec![
            ("x", Column::Numeric(array![1.0, 1.0, 1.0])),
            (
                "subject",
                Column::Categorical(vec!["s1".into(), "s2".into(), "s9".into()]),
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_conditional_predictions_add_group_intercepts() {
        let m = model();
        let eta = m.predict(m.coefficients().view(), &grid(), "link").unwrap();
        assert_abs_diff_eq!(eta[0], 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(eta[1], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(eta[2], 1.0, epsilon = 1e-12);
        assert!(m.predictors().contains(&"subject".to_string()));
    }

    #[test]
    fn test_population_level_ignores_groups() {
        let m = model().population_level();
        let no_groups =
            Grid::from_columns(vec![("x", Column::Numeric(array![1.0, 2.0]))]).unwrap();
        let mu = m
            .predict(m.coefficients().view(), &no_groups, "response")
            .unwrap();
        assert_abs_diff_eq!(mu[0], LinkFunction::Logit.inverse(1.0), epsilon = 1e-12);
        assert_eq!(m.predictors(), vec!["x".to_string()]);
    }

    #[test]
    fn test_missing_group_column_is_reported() {
        let m = model();
        let no_groups = Grid::from_columns(vec![("x", Column::Numeric(array![1.0]))]).unwrap();
        assert!(matches!(
            m.predict(m.coefficients().view(), &no_groups, "link"),
            Err(ModelError::MissingPredictor(name)) if name == "subject"
        ));
    }

    #[test]
    fn test_group_intercepts_survive_toml() {
        let m = model();
        assert_eq!(
            m.levels("subject"),
            Some(vec!["s1".to_string(), "s2".to_string()])
        );
        let text = toml::to_string(&m).unwrap();
        let restored: RandomInterceptModel = toml::from_str(&text).unwrap();
        assert_eq!(restored.intercepts, m.intercepts);
        let eta = restored
            .predict(restored.coefficients().view(), &grid(), "link")
            .unwrap();
        assert_abs_diff_eq!(eta[1], 0.5, epsilon = 1e-12);
    }
}
