//! # Entry Points
//!
//! Every entry point builds the same pipeline:
//!
//! 1. resolve the scale and the estimand plan (predictions, comparisons,
//!    slopes or marginal means) for the grid;
//! 2. resolve weights and the aggregation plan once;
//! 3. compose estimand, aggregation and transform into a single closure of
//!    the parameter vector;
//! 4. differentiate that closure (or evaluate it once per posterior draw);
//! 5. apply the hypothesis through the chain rule;
//! 6. finalize inference.
//!
//! Option validation runs before the model is evaluated at all.

use crate::effects::aggregate::{AggregationPlan, By};
use crate::effects::errors::{EffectsError, EffectsResult};
use crate::effects::estimand::EstimandPlan;
use crate::effects::grid::{Column, Grid, Value, balanced_grid, resolve_weights};
use crate::effects::hypothesis::{Hypothesis, HypothesisSpec};
use crate::effects::inference::{finalize, finalize_draws};
use crate::effects::jacobian::{Pipeline, delta_method, evaluate_draws, standard_errors};
use crate::effects::model::{FittedModel, ModelError, check_covariance_shape};
use crate::effects::options::{EstimateOptions, VcovSource};
use crate::effects::table::{EstimandKind, EstimateResult, EstimateTable, RowLabels};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

/// Adjusted predictions at every grid row (or averaged by `options.by`).
pub fn predictions(
    model: &dyn FittedModel,
    grid: &Grid,
    options: &EstimateOptions,
) -> EffectsResult<EstimateResult> {
    options.validate()?;
    let scale = model.resolve_scale(options.scale.as_deref())?;
    let plan = EstimandPlan::predictions(grid, &scale);
    let weights = internal::grid_weights(grid, None, &[], options)?;
    internal::run(model, plan, weights, options)
}

/// Predictions averaged over the grid, or within `options.by` groups.
pub fn avg_predictions(
    model: &dyn FittedModel,
    grid: &Grid,
    options: &EstimateOptions,
) -> EffectsResult<EstimateResult> {
    predictions(model, grid, &internal::averaged(options))
}

/// Differences (or ratios, lifts, ...) between predictions under two values
/// of each focal variable.
pub fn comparisons(
    model: &dyn FittedModel,
    grid: &Grid,
    options: &EstimateOptions,
) -> EffectsResult<EstimateResult> {
    options.validate()?;
    let scale = model.resolve_scale(options.scale.as_deref())?;
    let plan = EstimandPlan::comparisons(
        model,
        grid,
        &scale,
        &options.variables,
        options.comparison.clone(),
    )?;
    let focal = internal::focal_names(options);
    let weights = internal::grid_weights(grid, None, &focal, options)?;
    internal::run(model, plan, weights, options)
}

pub fn avg_comparisons(
    model: &dyn FittedModel,
    grid: &Grid,
    options: &EstimateOptions,
) -> EffectsResult<EstimateResult> {
    comparisons(model, grid, &internal::averaged(options))
}

/// Partial derivatives (or elasticities) of the predictions with respect to
/// each focal variable.
pub fn slopes(
    model: &dyn FittedModel,
    grid: &Grid,
    options: &EstimateOptions,
) -> EffectsResult<EstimateResult> {
    options.validate()?;
    let scale = model.resolve_scale(options.scale.as_deref())?;
    let plan = EstimandPlan::slopes(
        model,
        grid,
        &scale,
        &options.variables,
        options.slope,
        options.eps,
    )?;
    let focal = internal::focal_names(options);
    let weights = internal::grid_weights(grid, None, &focal, options)?;
    internal::run(model, plan, weights, options)
}

pub fn avg_slopes(
    model: &dyn FittedModel,
    grid: &Grid,
    options: &EstimateOptions,
) -> EffectsResult<EstimateResult> {
    slopes(model, grid, &internal::averaged(options))
}

/// Marginal means: predictions on a balanced grid built from `data` (every
/// combination of the categorical predictors, numeric predictors at their
/// mean), averaged within each combination of the `focal` variables. With no
/// focal variables, every categorical predictor is focal.
///
/// `options.by`, when set, replaces the focal grouping. Weights default to
/// equal; `cells` and `proportional` are computed against `data`.
pub fn marginal_means(
    model: &dyn FittedModel,
    data: &Grid,
    focal: &[String],
    options: &EstimateOptions,
) -> EffectsResult<EstimateResult> {
    options.validate()?;
    let scale = model.resolve_scale(options.scale.as_deref())?;
    let predictors: Vec<String> = model
        .predictors()
        .into_iter()
        .filter(|p| data.contains(p))
        .collect();
    let focal: Vec<String> = if focal.is_empty() {
        predictors
            .iter()
            .filter(|p| matches!(data.column(p), Ok(Column::Categorical(_))))
            .cloned()
            .collect()
    } else {
        focal.to_vec()
    };
    if focal.is_empty() {
        return Err(EffectsError::EmptyFocalSet(
            "marginal means need at least one categorical predictor".to_string(),
        ));
    }
    for name in &focal {
        if !predictors.contains(name) {
            return Err(EffectsError::EmptyFocalSet(format!(
                "'{name}' is not a model predictor present in the data. Model predictors: {}",
                predictors.join(", ")
            )));
        }
        if !matches!(data.column(name)?, Column::Categorical(_)) {
            return Err(EffectsError::EmptyFocalSet(format!(
                "'{name}' is numeric; marginal means are defined for categorical predictors"
            )));
        }
    }

    let grid = balanced_grid(data, &predictors)?;
    log::info!(
        "marginal means: balanced grid of {} rows over [{}]",
        grid.nrows(),
        predictors.join(", ")
    );
    let mut options = options.clone();
    if options.by.is_none() {
        options.by = By::Columns(focal.clone());
    }
    let weights = internal::grid_weights(&grid, Some(data), &focal, &options)?;
    let plan = EstimandPlan::marginal_means(&grid, &scale);
    internal::run(model, plan, weights, &options)
}

/// Applies a hypothesis to a previous result, reusing its Jacobian and
/// covariance (or its posterior draws) without touching the model.
pub fn hypotheses(
    result: &EstimateResult,
    spec: &HypothesisSpec,
    options: &EstimateOptions,
) -> EffectsResult<EstimateResult> {
    options.validate()?;
    let hypothesis = Hypothesis::resolve(spec, result.labels())?;
    if let Some(draws) = &result.draws {
        return internal::finish_draws(
            EstimandKind::Hypotheses,
            Some(&hypothesis),
            result.labels(),
            draws.view(),
            &result.scale,
            Vec::new(),
            options,
        );
    }
    let out = hypothesis.propagate(
        result.estimate().view(),
        result.jacobian.as_ref().map(|j| j.view()),
        result.vcov.as_ref().map(|v| v.view()),
        &options.delta_method,
    )?;
    internal::finish(
        EstimandKind::Hypotheses,
        out.labels,
        out.estimate,
        out.jacobian,
        out.vcov,
        Vec::new(),
        &result.scale,
        options,
    )
}

/// Tests on the model coefficients themselves, named `b1..bp`. Without a
/// hypothesis in `options` this is the coefficient table.
pub fn model_hypotheses(
    model: &dyn FittedModel,
    options: &EstimateOptions,
) -> EffectsResult<EstimateResult> {
    options.validate()?;
    let theta = model.coefficients();
    let p = theta.len();
    let mut labels = RowLabels::new(vec!["term".to_string()]);
    for i in 1..=p {
        labels.push(vec![Value::Level(format!("b{i}"))]);
    }

    let base = if let Some(draws) = model.posterior_draws() {
        let draws = draws.t().to_owned();
        let (estimate, inference) = finalize_draws(draws.view(), &options.inference)?;
        EstimateResult {
            kind: EstimandKind::Hypotheses,
            table: EstimateTable {
                labels,
                estimate,
                inference,
            },
            jacobian: None,
            vcov: None,
            by: Vec::new(),
            scale: "coefficient".to_string(),
            draws: Some(draws),
        }
    } else {
        let vcov = internal::covariance(model, options, p)?;
        let jacobian = vcov.as_ref().map(|_| Array2::eye(p));
        internal::finish(
            EstimandKind::Hypotheses,
            labels,
            theta,
            jacobian,
            vcov,
            Vec::new(),
            "coefficient",
            options,
        )?
    };
    match &options.hypothesis {
        Some(spec) => hypotheses(&base, spec, options),
        None => Ok(base),
    }
}

mod internal {
    use super::*;

    pub(super) fn averaged(options: &EstimateOptions) -> EstimateOptions {
        let mut options = options.clone();
        if options.by.is_none() {
            options.by = By::All;
        }
        options
    }

    pub(super) fn focal_names(options: &EstimateOptions) -> Vec<String> {
        options.variables.iter().map(|v| v.name.clone()).collect()
    }

    /// Per-grid-row weights. Without grouping the weights cannot matter, so
    /// they are not resolved.
    pub(super) fn grid_weights(
        grid: &Grid,
        source: Option<&Grid>,
        focal: &[String],
        options: &EstimateOptions,
    ) -> EffectsResult<Array1<f64>> {
        if options.by.is_none() {
            return Ok(Array1::ones(grid.nrows()));
        }
        Ok(resolve_weights(&options.weights, grid, source, focal)?)
    }

    /// The covariance to propagate, or `None` for estimate-only output.
    pub(super) fn covariance(
        model: &dyn FittedModel,
        options: &EstimateOptions,
        p: usize,
    ) -> EffectsResult<Option<Array2<f64>>> {
        match &options.vcov {
            VcovSource::Disabled => Ok(None),
            VcovSource::Matrix(sigma) => {
                check_covariance_shape(sigma.dim(), p)?;
                Ok(Some(sigma.clone()))
            }
            VcovSource::Model => match model.vcov() {
                Ok(sigma) => {
                    check_covariance_shape(sigma.dim(), p)?;
                    Ok(Some(sigma))
                }
                Err(ModelError::NoCovariance { class }) => {
                    log::warn!(
                        "model class '{class}' has no parameter covariance; reporting estimates without standard errors"
                    );
                    Ok(None)
                }
                Err(e) => Err(e.into()),
            },
        }
    }

    pub(super) fn run(
        model: &dyn FittedModel,
        plan: EstimandPlan,
        grid_weights: Array1<f64>,
        options: &EstimateOptions,
    ) -> EffectsResult<EstimateResult> {
        let kind = plan.kind();
        let scale = plan.scale().to_string();
        let row_weights = plan.row_weights(&grid_weights);
        let (aggregation, labels) =
            AggregationPlan::build(plan.labels(), plan.keys(), &options.by, row_weights.view())?;
        let theta = model.coefficients();
        log::info!(
            "{kind:?}: {} grid rows, {} estimand rows into {} outputs, {} parameters, scale '{scale}'",
            plan.grid().nrows(),
            aggregation.n_input(),
            aggregation.n_groups(),
            theta.len()
        );

        let pipeline: Pipeline<'_> = Box::new(|params: ArrayView1<'_, f64>| {
            let values = plan.evaluate(model, params, &aggregation)?;
            Ok(match &options.transform {
                Some(transform) => transform.apply(values),
                None => values,
            })
        });

        if let Some(draws) = model.posterior_draws() {
            if options.vcov != VcovSource::Model {
                log::warn!(
                    "'vcov' is ignored for posterior models; uncertainty comes from the {} draws",
                    draws.nrows()
                );
            }
            log::info!("evaluating {} posterior draws", draws.nrows());
            let estimates = evaluate_draws(&pipeline, draws, aggregation.n_groups())?;
            let hypothesis = options
                .hypothesis
                .as_ref()
                .map(|spec| Hypothesis::resolve(spec, &labels))
                .transpose()?;
            let (kind, by) = match hypothesis {
                Some(_) => (EstimandKind::Hypotheses, Vec::new()),
                None => (kind, options.by.columns()),
            };
            return finish_draws(
                kind,
                hypothesis.as_ref(),
                &labels,
                estimates.view(),
                &scale,
                by,
                options,
            );
        }

        let (estimate, jacobian, vcov) = match covariance(model, options, theta.len())? {
            Some(sigma) => {
                let out = delta_method(&pipeline, theta.view(), sigma.view(), &options.delta_method)?;
                (out.estimate, Some(out.jacobian), Some(out.vcov))
            }
            None => (pipeline(theta.view())?, None, None),
        };

        match &options.hypothesis {
            Some(spec) => {
                let out = Hypothesis::resolve(spec, &labels)?.propagate(
                    estimate.view(),
                    jacobian.as_ref().map(|j| j.view()),
                    vcov.as_ref().map(|v| v.view()),
                    &options.delta_method,
                )?;
                finish(
                    EstimandKind::Hypotheses,
                    out.labels,
                    out.estimate,
                    out.jacobian,
                    out.vcov,
                    Vec::new(),
                    &scale,
                    options,
                )
            }
            None => finish(
                kind,
                labels,
                estimate,
                jacobian,
                vcov,
                options.by.columns(),
                &scale,
                options,
            ),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn finish(
        kind: EstimandKind,
        labels: RowLabels,
        estimate: Array1<f64>,
        jacobian: Option<Array2<f64>>,
        vcov: Option<Array2<f64>>,
        by: Vec<String>,
        scale: &str,
        options: &EstimateOptions,
    ) -> EffectsResult<EstimateResult> {
        let std_error = vcov.as_ref().map(|v| standard_errors(v.view()));
        let inference = finalize(
            estimate.view(),
            std_error.as_ref().map(|s| s.view()),
            &options.inference,
        )?;
        Ok(EstimateResult {
            kind,
            table: EstimateTable {
                labels,
                estimate,
                inference,
            },
            jacobian,
            vcov,
            by,
            scale: scale.to_string(),
            draws: None,
        })
    }

    /// Summarizes `k x n_draws` estimates, applying `hypothesis` to every
    /// draw first.
    pub(super) fn finish_draws(
        kind: EstimandKind,
        hypothesis: Option<&Hypothesis>,
        labels: &RowLabels,
        draws: ArrayView2<f64>,
        scale: &str,
        by: Vec<String>,
        options: &EstimateOptions,
    ) -> EffectsResult<EstimateResult> {
        let (draws, labels) = match hypothesis {
            None => (draws.to_owned(), labels.clone()),
            Some(h) => {
                let columns = draws
                    .columns()
                    .into_iter()
                    .map(|c| h.apply(c))
                    .collect::<EffectsResult<Vec<_>>>()?;
                let k_out = columns.first().map_or(0, |c| c.len());
                let mut out = Array2::zeros((k_out, columns.len()));
                for (d, column) in columns.iter().enumerate() {
                    if column.len() != k_out {
                        return Err(EffectsError::InvalidHypothesisSpec(format!(
                            "hypothesis returned {} values for draw {d} but {k_out} for the first draw",
                            column.len()
                        )));
                    }
                    out.column_mut(d).assign(column);
                }
                (out, h.labels(k_out))
            }
        };
        let (estimate, inference) = finalize_draws(draws.view(), &options.inference)?;
        Ok(EstimateResult {
            kind,
            table: EstimateTable {
                labels,
                estimate,
                inference,
            },
            jacobian: None,
            vcov: None,
            by,
            scale: scale.to_string(),
            draws: Some(draws),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::construction::{Formula, Term};
    use crate::effects::estimand::FocalVariable;
    use crate::effects::grid::WeightSpec;
    use crate::effects::inference::InferenceOptions;
    use crate::effects::model::{GeneralizedLinearModel, LinkFunction, ScaleRegistry};
    use crate::effects::posterior::PosteriorModel;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn linear() -> GeneralizedLinearModel {
        GeneralizedLinearModel::new(
            Formula::new(
                Some("y"),
                vec![Term::Intercept, Term::numeric("x"), Term::factor("g", &["a", "b"])],
            ),
            LinkFunction::Identity,
            array![1.0, 2.0, 3.0],
            Some(array![[0.5, 0.1, 0.0], [0.1, 0.2, 0.0], [0.0, 0.0, 1.0]]),
            &ScaleRegistry::standard(),
        )
        .unwrap()
    }

    fn data() -> Grid {
        Grid::from_columns(vec![
            ("x", Column::Numeric(array![0.0, 1.0, 2.0, 3.0])),
            (
                "g",
                Column::Categorical(vec!["a".into(), "b".into(), "a".into(), "a".into()]),
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_linear_predictions_have_exact_standard_errors() {
        let model = linear();
        let result = predictions(&model, &data(), &EstimateOptions::default()).unwrap();
        assert_eq!(result.kind, EstimandKind::Predictions);
        // Row 1: (1, 1, 1) against the covariance.
        let var: f64 = 0.5 + 0.2 + 1.0 + 2.0 * 0.1;
        assert_abs_diff_eq!(result.estimate()[1], 6.0, epsilon = 1e-10);
        assert_abs_diff_eq!(result.std_error().unwrap()[1], var.sqrt(), epsilon = 1e-8);
        assert_eq!(result.jacobian.as_ref().unwrap().dim(), (4, 3));
    }

    #[test]
    fn test_avg_comparisons_and_pairwise_hypothesis() {
        let model = linear();
        let options =
            EstimateOptions::default().with_variables(vec![FocalVariable::new("g")]);
        let result = avg_comparisons(&model, &data(), &options).unwrap();
        assert_eq!(result.table.nrows(), 1);
        assert_abs_diff_eq!(result.estimate()[0], 3.0, epsilon = 1e-10);
        assert_abs_diff_eq!(result.std_error().unwrap()[0], 1.0, epsilon = 1e-8);

        let by_g = avg_predictions(
            &model,
            &data(),
            &EstimateOptions::default().with_by(By::Columns(vec!["g".to_string()])),
        )
        .unwrap();
        assert_eq!(by_g.table.nrows(), 2);
        let diff = hypotheses(
            &by_g,
            &"pairwise".parse().unwrap(),
            &EstimateOptions::default(),
        )
        .unwrap();
        // mean over g = a (x = 0, 2, 3) is 1 + 2 * 5/3; g = b is 1 + 2 + 3
        assert_abs_diff_eq!(diff.estimate()[0], 6.0 - (1.0 + 10.0 / 3.0), epsilon = 1e-10);
        assert_eq!(diff.kind, EstimandKind::Hypotheses);
    }

    #[test]
    fn test_disabled_vcov_gives_estimates_only() {
        let model = linear();
        let options = EstimateOptions::default().with_vcov(VcovSource::Disabled);
        let result = slopes(&model, &data(), &options).unwrap();
        assert!(result.std_error().is_none());
        assert!(result.jacobian.is_none());
        assert_eq!(result.table.nrows(), 8);
    }

    #[test]
    fn test_marginal_means_average_balanced_grid() {
        let model = linear();
        let result = marginal_means(&model, &data(), &[], &EstimateOptions::default()).unwrap();
        assert_eq!(result.kind, EstimandKind::MarginalMeans);
        assert_eq!(result.table.nrows(), 2);
        // x is held at its mean 1.5
        assert_abs_diff_eq!(result.estimate()[0], 4.0, epsilon = 1e-10);
        assert_abs_diff_eq!(result.estimate()[1], 7.0, epsilon = 1e-10);
        assert_eq!(result.by, vec!["g".to_string()]);

        let weighted = marginal_means(
            &model,
            &data(),
            &[],
            &EstimateOptions::default().with_weights(WeightSpec::Cells),
        )
        .unwrap();
        assert_eq!(weighted.table.nrows(), 2);
    }

    #[test]
    fn test_model_hypotheses_on_coefficients() {
        let model = linear();
        let options = EstimateOptions::default()
            .with_hypothesis("b2 = b3".parse().unwrap())
            .with_inference(InferenceOptions {
                df: Some(10.0),
                ..InferenceOptions::default()
            });
        let result = model_hypotheses(&model, &options).unwrap();
        assert_abs_diff_eq!(result.estimate()[0], -1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(result.std_error().unwrap()[0], 1.2f64.sqrt(), epsilon = 1e-6);
        assert_eq!(result.labels().describe(0), "b2 = b3");
    }

    #[test]
    fn test_posterior_model_summarizes_draws() {
        let draws = array![[1.0, 2.0, 3.0], [1.0, 2.5, 3.0], [1.0, 3.0, 3.0]];
        let model = PosteriorModel::new(linear(), draws).unwrap();
        let grid = Grid::from_columns(vec![
            ("x", Column::Numeric(array![1.0])),
            ("g", Column::Categorical(vec!["a".into()])),
        ])
        .unwrap();
        let result = predictions(&model, &grid, &EstimateOptions::default()).unwrap();
        assert_abs_diff_eq!(result.estimate()[0], 3.5, epsilon = 1e-12);
        assert!(result.std_error().is_none());
        assert_eq!(result.draws.as_ref().unwrap().dim(), (1, 3));
        assert!(result.table.inference.conf_low.is_some());
    }

    #[test]
    fn test_posterior_hypothesis_rows_carry_no_grouping() {
        let draws = array![[1.0, 2.0, 3.0], [1.0, 2.5, 3.0], [1.0, 3.0, 3.0]];
        let model = PosteriorModel::new(linear(), draws).unwrap();
        let options = EstimateOptions::default()
            .with_by(By::Columns(vec!["g".to_string()]))
            .with_hypothesis("pairwise".parse().unwrap());
        for vcov in [VcovSource::Disabled, VcovSource::Matrix(Array2::eye(2))] {
            let result = avg_predictions(&model, &data(), &options.clone().with_vcov(vcov)).unwrap();
            assert_eq!(result.kind, EstimandKind::Hypotheses);
            assert!(result.by.is_empty());
            // b - a is 3 - 2/3 * b1; the median draw has b1 = 2.5.
            assert_abs_diff_eq!(result.estimate()[0], 3.0 - 5.0 / 3.0, epsilon = 1e-12);
            assert!(result.table.inference.conf_low.is_some());
        }
    }

    #[test]
    fn test_wrong_covariance_shape_is_rejected() {
        let model = linear();
        let options =
            EstimateOptions::default().with_vcov(VcovSource::Matrix(Array2::eye(2)));
        let err = predictions(&model, &data(), &options).unwrap_err();
        assert!(matches!(
            err,
            EffectsError::Model(ModelError::CovarianceShape { .. })
        ));
    }
}
