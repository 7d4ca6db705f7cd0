//! Options shared by every entry point, loadable from TOML.
//!
//! Fields holding closures (custom comparisons, transforms, hypotheses,
//! numeric changes) can only be set from code; TOML covers everything else.

use crate::effects::aggregate::By;
use crate::effects::errors::{EffectsError, EffectsResult};
use crate::effects::estimand::{Comparison, FocalVariable, SlopeKind};
use crate::effects::grid::WeightSpec;
use crate::effects::hypothesis::{HypothesisSpec, Transform};
use crate::effects::inference::InferenceOptions;
use crate::effects::jacobian::DeltaMethodConfig;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Where the parameter covariance comes from. Posterior models summarize
/// their draws instead and ignore this setting.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VcovSource {
    /// The model's own covariance; estimate-only output when it has none.
    #[default]
    Model,
    /// Skip the delta-method engine entirely.
    Disabled,
    /// A caller-supplied `p x p` covariance (for example a robust one).
    Matrix(Array2<f64>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimateOptions {
    /// Prediction scale; the model's default when absent.
    pub scale: Option<String>,
    pub by: By,
    pub weights: WeightSpec,
    pub vcov: VcovSource,
    pub hypothesis: Option<HypothesisSpec>,
    pub transform: Option<Transform>,
    pub comparison: Comparison,
    pub slope: SlopeKind,
    /// Step for numerical slopes; `1e-4` times the range of the variable when
    /// absent.
    pub eps: Option<f64>,
    /// Focal variables; every predictor found in the grid when empty.
    pub variables: Vec<FocalVariable>,
    pub delta_method: DeltaMethodConfig,
    pub inference: InferenceOptions,
}

impl EstimateOptions {
    pub fn from_toml_str(text: &str) -> EffectsResult<Self> {
        let options: Self = toml::from_str(text)?;
        options.validate()?;
        Ok(options)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> EffectsResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Argument checks that do not need the model or the data.
    pub fn validate(&self) -> EffectsResult<()> {
        self.inference.validate()?;
        self.delta_method.validate()?;
        if let Some(eps) = self.eps {
            if !(eps.is_finite() && eps > 0.0) {
                return Err(EffectsError::invalid_option(
                    "eps",
                    format!("step must be positive and finite, got {eps}"),
                ));
            }
        }
        if matches!(self.vcov, VcovSource::Disabled) && self.inference.equivalence.is_some() {
            return Err(EffectsError::ConflictingOptions(
                "'equivalence' needs standard errors, but 'vcov' is disabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_scale(mut self, scale: &str) -> Self {
        self.scale = Some(scale.to_string());
        self
    }

    pub fn with_by(mut self, by: By) -> Self {
        self.by = by;
        self
    }

    pub fn with_weights(mut self, weights: WeightSpec) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_vcov(mut self, vcov: VcovSource) -> Self {
        self.vcov = vcov;
        self
    }

    pub fn with_hypothesis(mut self, hypothesis: HypothesisSpec) -> Self {
        self.hypothesis = Some(hypothesis);
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn with_comparison(mut self, comparison: Comparison) -> Self {
        self.comparison = comparison;
        self
    }

    pub fn with_slope(mut self, slope: SlopeKind) -> Self {
        self.slope = slope;
        self
    }

    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = Some(eps);
        self
    }

    pub fn with_variables(mut self, variables: Vec<FocalVariable>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_delta_method(mut self, config: DeltaMethodConfig) -> Self {
        self.delta_method = config;
        self
    }

    pub fn with_inference(mut self, inference: InferenceOptions) -> Self {
        self.inference = inference;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::estimand::{Change, NumericChange};
    use crate::effects::hypothesis::Shorthand;
    use crate::effects::inference::PAdjust;
    use crate::effects::jacobian::{FiniteDifference, StepSize};
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_from_empty_toml() {
        let options = EstimateOptions::from_toml_str("").unwrap();
        assert_eq!(options.by, By::None);
        assert_eq!(options.vcov, VcovSource::Model);
        assert_eq!(options.inference.conf_level, 0.95);
        assert_eq!(options.delta_method.step, StepSize::Relative(1e-4));
        assert!(options.hypothesis.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
scale = "link"
by = {{ columns = ["g"] }}
weights = "cells"
vcov = "disabled"
comparison = "lnratio"
slope = "eyex"
eps = 0.001
hypothesis = {{ shorthand = "pairwise" }}
transform = "exp"

[[variables]]
name = "x"
change = {{ numeric = "sd" }}

[delta_method]
method = "forward"
step = {{ absolute = 1e-6 }}

[inference]
conf_level = 0.9
df = 12.0
p_adjust = "fdr"
"#
        )
        .unwrap();
        let options = EstimateOptions::load(file.path()).unwrap();
        assert_eq!(options.scale.as_deref(), Some("link"));
        assert_eq!(options.by, By::Columns(vec!["g".to_string()]));
        assert_eq!(options.weights, WeightSpec::Cells);
        assert_eq!(options.vcov, VcovSource::Disabled);
        assert!(matches!(options.comparison, Comparison::LnRatio));
        assert_eq!(options.slope, SlopeKind::Eyex);
        assert!(matches!(
            options.hypothesis,
            Some(HypothesisSpec::Shorthand(Shorthand::Pairwise))
        ));
        assert!(matches!(options.transform, Some(Transform::Exp)));
        assert!(matches!(
            options.variables[0].change,
            Some(Change::Numeric(NumericChange::Sd))
        ));
        assert_eq!(options.delta_method.method, FiniteDifference::Forward);
        assert_eq!(options.inference.p_adjust, Some(PAdjust::Bh));
        assert_eq!(options.inference.df, Some(12.0));
    }

    #[test]
    fn test_conflicting_options_fail_validation() {
        let err = EstimateOptions::from_toml_str(
            r#"
[inference]
p_adjust = "holm"
equivalence = [-1.0, 1.0]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, EffectsError::ConflictingOptions(_)));

        let err = EstimateOptions::default().with_eps(-1.0).validate().unwrap_err();
        assert!(matches!(err, EffectsError::InvalidOption { option: "eps", .. }));
    }
}
