#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

#[path = "../effects/mod.rs"]
pub mod effects;

pub use effects::aggregate::{AggregationPlan, By};
pub use effects::construction::{Formula, Term};
pub use effects::errors::{EffectsError, EffectsResult};
pub use effects::estimand::{
    Change, Comparison, FocalVariable, LevelChange, NumericChange, SlopeKind,
};
pub use effects::grid::{
    Column, Grid, GridError, GridMode, Value, WeightSpec, balanced_grid, datagrid,
};
pub use effects::hypothesis::{HypothesisSpec, Shorthand, Transform};
pub use effects::inference::{InferenceOptions, NullValue, PAdjust};
pub use effects::jacobian::{DeltaMethodConfig, FiniteDifference, StepSize, delta_method};
pub use effects::margins::{
    avg_comparisons, avg_predictions, avg_slopes, comparisons, hypotheses, marginal_means,
    model_hypotheses, predictions, slopes,
};
pub use effects::mixed::RandomInterceptModel;
pub use effects::model::{
    FittedModel, GeneralizedLinearModel, LinkFunction, ModelError, ScaleRegistry, ScaleSet,
};
pub use effects::options::{EstimateOptions, VcovSource};
pub use effects::posterior::{BlackBoxModel, PosteriorModel, PredictFn};
pub use effects::table::{EstimandKind, EstimateResult, EstimateTable, RowLabels};
