//! # Delta-Method Engine
//!
//! Standard errors for any quantity computed from the model parameters. The
//! caller hands in a closure `h(theta) -> R^k` (the whole estimand, aggregation
//! and transform pipeline); the engine differentiates it numerically with
//! respect to every parameter and propagates the parameter covariance:
//!
//! ```text
//! J[r, i]  = (h(theta + d_i e_i)[r] - h(theta - d_i e_i)[r]) / (2 d_i)
//! Cov(h)   = J Sigma J^T
//! SE(h)[r] = sqrt(Cov(h)[r, r])
//! ```
//!
//! Each Jacobian column needs its own pipeline evaluations and depends on
//! nothing else, so columns are computed in parallel once the parameter
//! count passes `parallel_threshold`. The result is identical in either mode,
//! and when several columns fail the lowest parameter index is reported.

use crate::effects::errors::{EffectsError, EffectsResult};
use crate::effects::model::check_covariance_shape;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// The pipeline being differentiated.
pub type Pipeline<'a> = Box<dyn Fn(ArrayView1<f64>) -> EffectsResult<Array1<f64>> + Sync + 'a>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FiniteDifference {
    #[default]
    Central,
    Forward,
}

/// How the perturbation for parameter `i` is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepSize {
    /// `max(|theta_i|, 1) * factor`.
    Relative(f64),
    Absolute(f64),
}

impl Default for StepSize {
    fn default() -> Self {
        StepSize::Relative(1e-4)
    }
}

impl StepSize {
    pub fn for_parameter(self, theta_i: f64) -> f64 {
        match self {
            StepSize::Relative(factor) => theta_i.abs().max(1.0) * factor,
            StepSize::Absolute(step) => step,
        }
    }

    fn validate(self) -> EffectsResult<()> {
        let value = match self {
            StepSize::Relative(v) | StepSize::Absolute(v) => v,
        };
        if !(value.is_finite() && value > 0.0) {
            return Err(EffectsError::invalid_option(
                "delta_method.step",
                format!("step must be positive and finite, got {value}"),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaMethodConfig {
    pub method: FiniteDifference,
    pub step: StepSize,
    /// Minimum parameter count before columns are evaluated in parallel.
    pub parallel_threshold: usize,
}

impl Default for DeltaMethodConfig {
    fn default() -> Self {
        Self {
            method: FiniteDifference::Central,
            step: StepSize::default(),
            parallel_threshold: 8,
        }
    }
}

impl DeltaMethodConfig {
    pub fn validate(&self) -> EffectsResult<()> {
        self.step.validate()
    }
}

/// Everything the engine produces for one pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaMethodOutput {
    pub estimate: Array1<f64>,
    pub jacobian: Array2<f64>,
    pub vcov: Array2<f64>,
    pub std_error: Array1<f64>,
}

/// Numerical Jacobian (`k x p`) of `h` at `theta`. `baseline` must be
/// `h(theta)`; it fixes the output length and is reused by forward
/// differences.
///
/// A non-finite `baseline` fails with `NonFiniteEstimate` before any
/// parameter is perturbed. Estimate-only output never reaches this point and
/// reports such values as they are.
pub fn numerical_jacobian<F>(
    h: F,
    theta: ArrayView1<f64>,
    baseline: ArrayView1<f64>,
    config: &DeltaMethodConfig,
) -> EffectsResult<Array2<f64>>
where
    F: Fn(ArrayView1<f64>) -> EffectsResult<Array1<f64>> + Sync,
{
    config.validate()?;
    let p = theta.len();
    let k = baseline.len();
    if let Some(row) = baseline.iter().position(|v| !v.is_finite()) {
        return Err(EffectsError::NonFiniteEstimate {
            row,
            value: baseline[row],
        });
    }

    let column = |i: usize| -> EffectsResult<Array1<f64>> {
        let delta = config.step.for_parameter(theta[i]);
        let mut shifted = theta.to_owned();
        shifted[i] = theta[i] + delta;
        let plus_step = shifted[i] - theta[i];
        let upper = internal::evaluate(&h, shifted.view(), i, k)?;
        match config.method {
            FiniteDifference::Forward => Ok((upper - &baseline) / plus_step),
            FiniteDifference::Central => {
                shifted[i] = theta[i] - delta;
                let span = plus_step + (theta[i] - shifted[i]);
                let lower = internal::evaluate(&h, shifted.view(), i, k)?;
                Ok((upper - lower) / span)
            }
        }
    };

    let columns: Vec<EffectsResult<Array1<f64>>> = if p >= config.parallel_threshold {
        (0..p).into_par_iter().map(column).collect()
    } else {
        (0..p).map(column).collect()
    };

    let mut jacobian = Array2::<f64>::zeros((k, p));
    for (i, col) in columns.into_iter().enumerate() {
        jacobian.column_mut(i).assign(&col?);
    }
    log::debug!("numerical Jacobian: {k} outputs x {p} parameters");
    Ok(jacobian)
}

/// `J Sigma J^T`.
pub fn propagate(jacobian: ArrayView2<f64>, sigma: ArrayView2<f64>) -> EffectsResult<Array2<f64>> {
    check_covariance_shape(sigma.dim(), jacobian.ncols())?;
    Ok(jacobian.dot(&sigma).dot(&jacobian.t()))
}

/// Square roots of the diagonal. Tiny negative variances from rounding are
/// treated as zero; anything clearly negative becomes NaN with a warning.
pub fn standard_errors(vcov: ArrayView2<f64>) -> Array1<f64> {
    let scale = vcov
        .diag()
        .iter()
        .fold(0.0f64, |acc, v| acc.max(v.abs()))
        .max(1.0);
    vcov.diag().mapv(|v| {
        if v >= 0.0 {
            v.sqrt()
        } else if v > -1e-12 * scale {
            0.0
        } else {
            log::warn!("negative variance {v} in propagated covariance; standard error set to NaN");
            f64::NAN
        }
    })
}

/// Runs the full engine: baseline, Jacobian, propagation, standard errors.
pub fn delta_method<F>(
    h: F,
    theta: ArrayView1<f64>,
    sigma: ArrayView2<f64>,
    config: &DeltaMethodConfig,
) -> EffectsResult<DeltaMethodOutput>
where
    F: Fn(ArrayView1<f64>) -> EffectsResult<Array1<f64>> + Sync,
{
    let estimate = h(theta)?;
    let jacobian = numerical_jacobian(&h, theta, estimate.view(), config)?;
    let vcov = propagate(jacobian.view(), sigma)?;
    let std_error = standard_errors(vcov.view());
    Ok(DeltaMethodOutput {
        estimate,
        jacobian,
        vcov,
        std_error,
    })
}

/// Evaluates `h` at every row of `draws` (`n_draws x p`) and returns the
/// `k x n_draws` matrix of results.
pub fn evaluate_draws<F>(h: F, draws: ArrayView2<f64>, k: usize) -> EffectsResult<Array2<f64>>
where
    F: Fn(ArrayView1<f64>) -> EffectsResult<Array1<f64>> + Sync,
{
    let results: Vec<EffectsResult<Array1<f64>>> = draws
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|draw| h(draw))
        .collect();
    let mut out = Array2::<f64>::zeros((k, draws.nrows()));
    for (d, values) in results.into_iter().enumerate() {
        let values = values?;
        if values.len() != k {
            return Err(EffectsError::JacobianEvaluation {
                parameter: 0,
                row: None,
                reason: format!(
                    "posterior draw {d} produced {} estimates instead of {k}",
                    values.len()
                ),
            });
        }
        out.column_mut(d).assign(&values);
    }
    Ok(out)
}

mod internal {
    use super::*;

    pub(super) fn evaluate<F>(
        h: &F,
        params: ArrayView1<f64>,
        parameter: usize,
        k: usize,
    ) -> EffectsResult<Array1<f64>>
    where
        F: Fn(ArrayView1<f64>) -> EffectsResult<Array1<f64>>,
    {
        let values = h(params).map_err(|e| EffectsError::JacobianEvaluation {
            parameter,
            row: None,
            reason: e.to_string(),
        })?;
        if values.len() != k {
            return Err(EffectsError::JacobianEvaluation {
                parameter,
                row: None,
                reason: format!(
                    "pipeline returned {} values after perturbation, expected {k}",
                    values.len()
                ),
            });
        }
        if let Some(row) = values.iter().position(|v| !v.is_finite()) {
            return Err(EffectsError::JacobianEvaluation {
                parameter,
                row: Some(row),
                reason: format!("non-finite estimate {}", values[row]),
            });
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn quadratic(theta: ArrayView1<f64>) -> EffectsResult<Array1<f64>> {
        Ok(array![
            theta[0] * theta[0] + theta[1],
            theta[0] * theta[1],
            (theta[1]).exp()
        ])
    }

    #[test]
    fn test_central_jacobian_matches_analytic_derivatives() {
        let theta = array![1.5, -0.5];
        let baseline = quadratic(theta.view()).unwrap();
        let j = numerical_jacobian(quadratic, theta.view(), baseline.view(), &DeltaMethodConfig::default())
            .unwrap();
        let expected = array![
            [3.0, 1.0],
            [-0.5, 1.5],
            [0.0, (-0.5f64).exp()]
        ];
        for (a, e) in j.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*a, *e, epsilon = 1e-7);
        }
    }

    #[test]
    fn test_forward_differences_are_first_order() {
        let theta = array![1.5, -0.5];
        let baseline = quadratic(theta.view()).unwrap();
        let config = DeltaMethodConfig {
            method: FiniteDifference::Forward,
            ..DeltaMethodConfig::default()
        };
        let j = numerical_jacobian(quadratic, theta.view(), baseline.view(), &config).unwrap();
        assert_abs_diff_eq!(j[[0, 0]], 3.0, epsilon = 1e-3);
        assert_abs_diff_eq!(j[[1, 1]], 1.5, epsilon = 1e-9);
    }

    #[test]
    fn test_parallel_and_serial_columns_agree() {
        let theta = Array1::linspace(-2.0, 2.0, 12);
        let h = |t: ArrayView1<f64>| -> EffectsResult<Array1<f64>> {
            Ok(array![t.mapv(|v| v.sin()).sum(), t.dot(&t)])
        };
        let baseline = h(theta.view()).unwrap();
        let serial = DeltaMethodConfig {
            parallel_threshold: usize::MAX,
            ..DeltaMethodConfig::default()
        };
        let parallel = DeltaMethodConfig {
            parallel_threshold: 1,
            ..DeltaMethodConfig::default()
        };
        let a = numerical_jacobian(h, theta.view(), baseline.view(), &serial).unwrap();
        let b = numerical_jacobian(h, theta.view(), baseline.view(), &parallel).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_failing_evaluation_names_lowest_parameter() {
        let theta = array![0.0, 1.0, 2.0, 3.0];
        let h = |t: ArrayView1<f64>| -> EffectsResult<Array1<f64>> {
            if t[2] != 2.0 || t[3] != 3.0 {
                Ok(array![f64::NAN])
            } else {
                Ok(array![t.sum()])
            }
        };
        let baseline = h(theta.view()).unwrap();
        let config = DeltaMethodConfig {
            parallel_threshold: 1,
            ..DeltaMethodConfig::default()
        };
        match numerical_jacobian(h, theta.view(), baseline.view(), &config) {
            Err(EffectsError::JacobianEvaluation { parameter, row, .. }) => {
                assert_eq!(parameter, 2);
                assert_eq!(row, Some(0));
            }
            other => panic!("Expected JacobianEvaluation, got {other:?}"),
        }
    }

    #[test]
    fn test_non_finite_baseline_is_not_blamed_on_a_parameter() {
        let theta = array![1.0, -2.0];
        let h = |t: ArrayView1<f64>| -> EffectsResult<Array1<f64>> {
            Ok(array![t[0], (t[0] + t[1]).ln()])
        };
        let baseline = h(theta.view()).unwrap();
        match numerical_jacobian(h, theta.view(), baseline.view(), &DeltaMethodConfig::default()) {
            Err(EffectsError::NonFiniteEstimate { row, value }) => {
                assert_eq!(row, 1);
                assert!(value.is_nan());
            }
            other => panic!("Expected NonFiniteEstimate, got {other:?}"),
        }
    }

    #[test]
    fn test_propagation_of_linear_map_is_exact() {
        let sigma = array![[0.04, 0.01], [0.01, 0.09]];
        let h = |t: ArrayView1<f64>| -> EffectsResult<Array1<f64>> {
            Ok(array![t[0] + 2.0 * t[1], t[0] - t[1]])
        };
        let out = delta_method(h, array![1.0, 2.0].view(), sigma.view(), &DeltaMethodConfig::default())
            .unwrap();
        let l = array![[1.0, 2.0], [1.0, -1.0]];
        let exact = l.dot(&sigma).dot(&l.t());
        for (a, e) in out.vcov.iter().zip(exact.iter()) {
            assert_abs_diff_eq!(*a, *e, epsilon = 1e-10);
        }
        assert_abs_diff_eq!(out.std_error[0], exact[[0, 0]].sqrt(), epsilon = 1e-10);
        assert_abs_diff_eq!(out.estimate[0], 5.0, epsilon = 1e-12);
    }

    #[test]
    fn test_covariance_shape_is_checked() {
        let j = Array2::<f64>::zeros((3, 2));
        assert!(propagate(j.view(), Array2::<f64>::eye(3).view()).is_err());
    }

    #[test]
    fn test_non_positive_step_is_rejected() {
        let config = DeltaMethodConfig {
            step: StepSize::Absolute(0.0),
            ..DeltaMethodConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EffectsError::InvalidOption { option: "delta_method.step", .. })
        ));
    }
}
