//! # Model Adapters
//!
//! Every fitted model reaches the estimand layer through the `FittedModel`
//! capability trait: its parameter vector, its parameter covariance (which may
//! be unavailable) and a prediction function that accepts arbitrary candidate
//! parameters. Adapters never mutate the model they wrap.
//!
//! Which prediction scales a model class supports is declared in an explicit
//! `ScaleRegistry` handed to each adapter when it is built.

use crate::effects::construction::Formula;
use crate::effects::grid::{Grid, GridError};
use ahash::AHashMap;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;
use std::fs;
use std::io::{BufWriter, Write};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error(
        "Prediction scale '{requested}' is not supported for models of class '{class}'. Valid choices: {}",
        .valid.join(", ")
    )]
    UnsupportedScale {
        requested: String,
        class: String,
        valid: Vec<String>,
    },
    #[error("No prediction scales are registered for model class '{0}'.")]
    UnknownModelClass(String),
    #[error(
        "Model of class '{class}' has no parameter covariance matrix; only point estimates are available."
    )]
    NoCovariance { class: String },
    #[error("Parameter vector has {found} entries, but the model has {expected} coefficients.")]
    ParameterLength { found: usize, expected: usize },
    #[error("Covariance matrix has shape {found:?}, but {expected}x{expected} is required.")]
    CovarianceShape {
        found: (usize, usize),
        expected: usize,
    },
    #[error("Predictor '{0}' is required by the model but missing from the grid.")]
    MissingPredictor(String),
    #[error("Predictor '{variable}' must be {expected}, but the grid column is {found}.")]
    ColumnType {
        variable: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error(
        "Level '{level}' of factor '{variable}' was not seen when the model was fitted. Known levels: {}",
        .known.join(", ")
    )]
    UnknownLevel {
        variable: String,
        level: String,
        known: Vec<String>,
    },
    #[error("Numerical domain error: {0}")]
    DomainError(String),
    #[error("Prediction failed: {0}")]
    PredictionFailed(String),
    #[error("Posterior draw matrix has {found} columns, but the model has {expected} coefficients.")]
    DrawShape { found: usize, expected: usize },
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error(transparent)]
    Grid(#[from] GridError),
}

/// The prediction scales one model class accepts, and the one used when the
/// caller does not ask for a specific scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleSet {
    pub allowed: Vec<String>,
    pub default: String,
}

impl ScaleSet {
    pub fn new(allowed: &[&str], default: &str) -> Self {
        Self {
            allowed: allowed.iter().map(|s| s.to_string()).collect(),
            default: default.to_string(),
        }
    }

    pub fn resolve(&self, class: &str, requested: Option<&str>) -> Result<String, ModelError> {
        match requested {
            None => Ok(self.default.clone()),
            Some(scale) if self.allowed.iter().any(|s| s == scale) => Ok(scale.to_string()),
            Some(scale) => Err(ModelError::UnsupportedScale {
                requested: scale.to_string(),
                class: class.to_string(),
                valid: self.allowed.clone(),
            }),
        }
    }
}

/// Model class to supported-scale table.
#[derive(Debug, Clone, Default)]
pub struct ScaleRegistry {
    classes: AHashMap<String, ScaleSet>,
}

impl ScaleRegistry {
    /// The built-in table: `lm` and `blackbox` predict on the response scale
    /// only, `glm` and `mixed` also expose the linear predictor as `link`.
    pub fn standard() -> Self {
        Self::default()
            .with_class("lm", ScaleSet::new(&["response"], "response"))
            .with_class("glm", ScaleSet::new(&["response", "link"], "response"))
            .with_class("mixed", ScaleSet::new(&["response", "link"], "response"))
            .with_class("blackbox", ScaleSet::new(&["response"], "response"))
    }

    pub fn with_class(mut self, class: &str, scales: ScaleSet) -> Self {
        self.classes.insert(class.to_string(), scales);
        self
    }

    pub fn get(&self, class: &str) -> Result<ScaleSet, ModelError> {
        self.classes
            .get(class)
            .cloned()
            .ok_or_else(|| ModelError::UnknownModelClass(class.to_string()))
    }
}

/// What every model family must provide to the estimand and delta-method
/// layers.
///
/// `predict` must accept any parameter vector of the right length, not only
/// the fitted one, and must be a deterministic function of its inputs. It is
/// assumed (not checked) to be differentiable in the parameters near the
/// fitted values.
pub trait FittedModel: Send + Sync {
    fn class_name(&self) -> &str;

    fn coefficients(&self) -> Array1<f64>;

    /// Parameter covariance, or `ModelError::NoCovariance` when the model
    /// does not carry one.
    fn vcov(&self) -> Result<Array2<f64>, ModelError>;

    fn predict(
        &self,
        params: ArrayView1<f64>,
        grid: &Grid,
        scale: &str,
    ) -> Result<Array1<f64>, ModelError>;

    fn predictors(&self) -> Vec<String>;

    fn response(&self) -> Option<String>;

    fn scales(&self) -> &ScaleSet;

    /// Known levels of a categorical predictor, in reference-first order.
    fn levels(&self, variable: &str) -> Option<Vec<String>>;

    /// Posterior draws (`n_draws x p`) for Bayesian models.
    fn posterior_draws(&self) -> Option<ArrayView2<'_, f64>> {
        None
    }

    fn resolve_scale(&self, requested: Option<&str>) -> Result<String, ModelError> {
        self.scales().resolve(self.class_name(), requested)
    }
}

/// Defines the link function, connecting the linear predictor to the mean response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkFunction {
    /// The identity link, for continuous outcomes (e.g., Gaussian regression).
    Identity,
    /// The logit link, for binary or proportional outcomes (e.g., logistic regression).
    Logit,
    Probit,
    Log,
    Cloglog,
    Inverse,
}

impl LinkFunction {
    /// Maps a linear predictor value to the response scale.
    pub fn inverse(self, eta: f64) -> f64 {
        match self {
            LinkFunction::Identity => eta,
            LinkFunction::Logit => {
                // exp() overflows past |eta| = 709.
                let eta = eta.clamp(-700.0, 700.0);
                if eta >= 0.0 {
                    1.0 / (1.0 + (-eta).exp())
                } else {
                    let e = eta.exp();
                    e / (1.0 + e)
                }
            }
            LinkFunction::Probit => 0.5 * erfc(-eta / std::f64::consts::SQRT_2),
            LinkFunction::Log => eta.exp(),
            LinkFunction::Cloglog => 1.0 - (-eta.exp()).exp(),
            LinkFunction::Inverse => 1.0 / eta,
        }
    }
}

/// A fitted linear or generalized linear model: a formula, a link, the
/// coefficient vector and (optionally) its covariance matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralizedLinearModel {
    pub formula: Formula,
    pub link: LinkFunction,
    pub coefficients: Array1<f64>,
    pub scales: ScaleSet,
    pub vcov: Option<Array2<f64>>,
}

impl GeneralizedLinearModel {
    /// Builds the adapter, checking that the coefficient vector and the
    /// covariance matrix match the formula's design width.
    pub fn new(
        formula: Formula,
        link: LinkFunction,
        coefficients: Array1<f64>,
        vcov: Option<Array2<f64>>,
        registry: &ScaleRegistry,
    ) -> Result<Self, ModelError> {
        let p = formula.ncols();
        if coefficients.len() != p {
            return Err(ModelError::ParameterLength {
                found: coefficients.len(),
                expected: p,
            });
        }
        if let Some(v) = &vcov {
            internal::check_covariance_shape(v.dim(), p)?;
        }
        let class = internal::class_for_link(link);
        Ok(Self {
            formula,
            link,
            coefficients,
            scales: registry.get(class)?,
            vcov,
        })
    }

    /// The linear predictor `X(grid) * params`.
    pub fn linear_predictor(
        &self,
        params: ArrayView1<f64>,
        grid: &Grid,
    ) -> Result<Array1<f64>, ModelError> {
        if params.len() != self.coefficients.len() {
            return Err(ModelError::ParameterLength {
                found: params.len(),
                expected: self.coefficients.len(),
            });
        }
        let x = self.formula.design_matrix(grid)?;
        Ok(x.dot(&params))
    }

    pub(crate) fn apply_scale(&self, eta: Array1<f64>, scale: &str) -> Array1<f64> {
        match scale {
            "link" => eta,
            _ => eta.mapv(|v| self.link.inverse(v)),
        }
    }

    /// Saves the fitted model to a TOML file.
    pub fn save(&self, path: &str) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads a fitted model from a TOML file.
    pub fn load(path: &str) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model: Self = toml::from_str(&toml_string)?;
        if let Some(v) = &model.vcov {
            internal::check_covariance_shape(v.dim(), model.coefficients.len())?;
        }
        Ok(model)
    }
}

impl FittedModel for GeneralizedLinearModel {
    fn class_name(&self) -> &str {
        internal::class_for_link(self.link)
    }

    fn coefficients(&self) -> Array1<f64> {
        self.coefficients.clone()
    }

    fn vcov(&self) -> Result<Array2<f64>, ModelError> {
        self.vcov.clone().ok_or_else(|| ModelError::NoCovariance {
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
        let eta = self.linear_predictor(params, grid)?;
        Ok(self.apply_scale(eta, &scale))
    }

    fn predictors(&self) -> Vec<String> {
        self.formula.predictors()
    }

    fn response(&self) -> Option<String> {
        self.formula.response.clone()
    }

    fn scales(&self) -> &ScaleSet {
        &self.scales
    }

    fn levels(&self, variable: &str) -> Option<Vec<String>> {
        self.formula.levels(variable)
    }
}

/// Internal module for adapter implementation details.
mod internal {
    use super::*;

    pub(super) fn class_for_link(link: LinkFunction) -> &'static str {
        match link {
            LinkFunction::Identity => "lm",
            _ => "glm",
        }
    }

    pub(crate) fn check_covariance_shape(
        found: (usize, usize),
        p: usize,
    ) -> Result<(), ModelError> {
        if found != (p, p) {
            return Err(ModelError::CovarianceShape {
                found,
                expected: p,
            });
        }
        Ok(())
    }
}

pub(crate) use internal::check_covariance_shape;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::construction::Term;
    use crate::effects::grid::Column;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use tempfile::NamedTempFile;

    fn logistic_model() -> GeneralizedLinearModel {
        GeneralizedLinearModel::new(
            Formula::new(Some("y"), vec![Term::Intercept, Term::numeric("x")]),
            LinkFunction::Logit,
            array![-0.5, 1.5],
            Some(array![[0.04, -0.01], [-0.01, 0.09]]),
            &ScaleRegistry::standard(),
        )
        .unwrap()
    }

    fn grid() -> Grid {
        Grid::from_columns(vec![("x", Column::Numeric(array![-1.0, 0.0, 2.0]))]).unwrap()
    }

    #[test]
    fn test_predict_on_link_and_response_scales() {
        let model = logistic_model();
        let theta = model.coefficients();
        let eta = model.predict(theta.view(), &grid(), "link").unwrap();
        assert_abs_diff_eq!(eta[0], -2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(eta[2], 2.5, epsilon = 1e-12);

        let mu = model.predict(theta.view(), &grid(), "response").unwrap();
        assert_abs_diff_eq!(mu[1], 1.0 / (1.0 + 0.5f64.exp()), epsilon = 1e-12);
    }

    #[test]
    fn test_predict_uses_candidate_parameters() {
        let model = logistic_model();
        let eta = model
            .predict(array![1.0, 0.0].view(), &grid(), "link")
            .unwrap();
        assert_eq!(eta.to_vec(), vec![1.0, 1.0, 1.0]);
        assert_eq!(model.coefficients(), array![-0.5, 1.5]);
    }

    #[test]
    fn test_unsupported_scale_lists_valid_choices() {
        let model = GeneralizedLinearModel::new(
            Formula::new(Some("y"), vec![Term::Intercept]),
            LinkFunction::Identity,
            array![1.0],
            None,
            &ScaleRegistry::standard(),
        )
        .unwrap();
        let err = model
            .predict(array![1.0].view(), &grid(), "link")
            .unwrap_err();
        match &err {
            ModelError::UnsupportedScale { class, valid, .. } => {
                assert_eq!(class, "lm");
                assert_eq!(valid, &vec!["response".to_string()]);
            }
            other => panic!("Expected UnsupportedScale, got {other:?}"),
        }
        assert!(err.to_string().contains("Valid choices: response"));
        assert!(matches!(model.vcov(), Err(ModelError::NoCovariance { .. })));
    }

    #[test]
    fn test_link_inverses_are_finite_at_extremes() {
        for link in [
            LinkFunction::Logit,
            LinkFunction::Probit,
            LinkFunction::Cloglog,
        ] {
            for eta in [-1e6, -30.0, 0.0, 30.0, 1e6] {
                let mu = link.inverse(eta);
                assert!(
                    (0.0..=1.0).contains(&mu),
                    "{link:?} inverse of {eta} gave {mu}"
                );
            }
        }
        assert_abs_diff_eq!(LinkFunction::Probit.inverse(0.0), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(
            LinkFunction::Probit.inverse(1.959963984540054),
            0.975,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_rejects_mismatched_dimensions() {
        let registry = ScaleRegistry::standard();
        let formula = Formula::new(Some("y"), vec![Term::Intercept, Term::numeric("x")]);
        assert!(matches!(
            GeneralizedLinearModel::new(
                formula.clone(),
                LinkFunction::Identity,
                array![1.0],
                None,
                &registry
            ),
            Err(ModelError::ParameterLength { found: 1, expected: 2 })
        ));
        assert!(matches!(
            GeneralizedLinearModel::new(
                formula,
                LinkFunction::Identity,
                array![1.0, 2.0],
                Some(Array2::eye(3)),
                &registry
            ),
            Err(ModelError::CovarianceShape { expected: 2, .. })
        ));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let model = GeneralizedLinearModel::new(
            Formula::new(
                Some("y"),
                vec![Term::Intercept, Term::factor("g", &["a", "b"]), Term::power("x", 2)],
            ),
            LinkFunction::Log,
            array![0.1, -0.2, 0.3],
            Some(Array2::eye(3) * 0.01),
            &ScaleRegistry::standard(),
        )
        .unwrap();
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        model.save(path).unwrap();
        let loaded = GeneralizedLinearModel::load(path).unwrap();

        assert_eq!(loaded.formula, model.formula);
        assert_eq!(loaded.link, LinkFunction::Log);
        assert_eq!(loaded.coefficients, model.coefficients);
        assert_eq!(loaded.vcov, model.vcov);
        assert_eq!(loaded.levels("g"), Some(vec!["a".to_string(), "b".to_string()]));
    }
}
