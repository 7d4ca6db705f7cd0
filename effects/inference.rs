//! # Inference Finalizer
//!
//! Turns estimates and standard errors into test statistics, two-sided
//! p-values, confidence intervals, S-values and (optionally) two one-sided
//! equivalence tests. The reference distribution is the standard normal when
//! no degrees of freedom are given and Student's t otherwise.
//!
//! Multiple-comparison adjustment follows the usual step-up/step-down
//! definitions and applies to the p-values only; intervals are unadjusted.

use crate::effects::errors::{EffectsError, EffectsResult};
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal, StudentsT};

/// Multiple-comparison adjustment of p-values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PAdjust {
    Holm,
    Hochberg,
    Bonferroni,
    /// Benjamini-Hochberg false discovery rate.
    #[serde(alias = "fdr")]
    Bh,
    /// Benjamini-Yekutieli.
    By,
}

/// The value each estimate is tested against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NullValue {
    Scalar(f64),
    PerRow(Vec<f64>),
}

impl Default for NullValue {
    fn default() -> Self {
        NullValue::Scalar(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceOptions {
    pub conf_level: f64,
    /// Degrees of freedom for Student's t; `None` means normal.
    pub df: Option<f64>,
    pub p_adjust: Option<PAdjust>,
    /// Equivalence bounds `(lower, upper)` for the TOST columns.
    pub equivalence: Option<(f64, f64)>,
    pub null: NullValue,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            conf_level: 0.95,
            df: None,
            p_adjust: None,
            equivalence: None,
            null: NullValue::default(),
        }
    }
}

impl InferenceOptions {
    /// Checks the options on their own, before anything is computed.
    pub fn validate(&self) -> EffectsResult<()> {
        if self.p_adjust.is_some() && self.equivalence.is_some() {
            return Err(EffectsError::ConflictingOptions(
                "'p_adjust' and 'equivalence' cannot be used together; drop one of them"
                    .to_string(),
            ));
        }
        if !(self.conf_level > 0.0 && self.conf_level < 1.0) {
            return Err(EffectsError::invalid_option(
                "conf_level",
                format!("must lie strictly between 0 and 1, got {}", self.conf_level),
            ));
        }
        if let Some(df) = self.df {
            if !(df > 0.0) {
                return Err(EffectsError::invalid_option(
                    "df",
                    format!("degrees of freedom must be positive, got {df}"),
                ));
            }
        }
        if let Some((lower, upper)) = self.equivalence {
            if !(lower <= upper) {
                return Err(EffectsError::invalid_option(
                    "equivalence",
                    format!("lower bound {lower} exceeds upper bound {upper}"),
                ));
            }
        }
        Ok(())
    }

    fn null_vector(&self, k: usize) -> EffectsResult<Array1<f64>> {
        match &self.null {
            NullValue::Scalar(v) => Ok(Array1::from_elem(k, *v)),
            NullValue::PerRow(values) if values.len() == k => Ok(Array1::from_vec(values.clone())),
            NullValue::PerRow(values) => Err(EffectsError::invalid_option(
                "null",
                format!("{} null values supplied for {k} estimates", values.len()),
            )),
        }
    }
}

/// Two one-sided tests against the equivalence bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct Equivalence {
    pub statistic_noninf: Array1<f64>,
    pub statistic_nonsup: Array1<f64>,
    pub p_value_noninf: Array1<f64>,
    pub p_value_nonsup: Array1<f64>,
    pub p_value_equiv: Array1<f64>,
}

/// Uncertainty columns for a set of estimates. Everything is optional so
/// estimate-only output simply leaves them empty.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Inference {
    pub std_error: Option<Array1<f64>>,
    pub statistic: Option<Array1<f64>>,
    pub p_value: Option<Array1<f64>>,
    pub s_value: Option<Array1<f64>>,
    pub conf_low: Option<Array1<f64>>,
    pub conf_high: Option<Array1<f64>>,
    pub equivalence: Option<Equivalence>,
}

enum Reference {
    Normal(Normal),
    StudentsT(StudentsT),
}

impl Reference {
    fn new(df: Option<f64>) -> EffectsResult<Self> {
        match df {
            None => Normal::new(0.0, 1.0)
                .map(Reference::Normal)
                .map_err(|e| EffectsError::invalid_option("df", e.to_string())),
            Some(df) => StudentsT::new(0.0, 1.0, df)
                .map(Reference::StudentsT)
                .map_err(|e| EffectsError::invalid_option("df", e.to_string())),
        }
    }

    fn cdf(&self, x: f64) -> f64 {
        match self {
            Reference::Normal(d) => d.cdf(x),
            Reference::StudentsT(d) => d.cdf(x),
        }
    }

    fn sf(&self, x: f64) -> f64 {
        match self {
            Reference::Normal(d) => d.sf(x),
            Reference::StudentsT(d) => d.sf(x),
        }
    }

    fn quantile(&self, p: f64) -> f64 {
        match self {
            Reference::Normal(d) => d.inverse_cdf(p),
            Reference::StudentsT(d) => d.inverse_cdf(p),
        }
    }
}

/// Builds the inference columns for `estimate` given its standard errors.
/// With no standard errors the result carries no uncertainty columns.
pub fn finalize(
    estimate: ArrayView1<f64>,
    std_error: Option<ArrayView1<f64>>,
    options: &InferenceOptions,
) -> EffectsResult<Inference> {
    options.validate()?;
    let Some(se) = std_error else {
        return Ok(Inference::default());
    };
    let k = estimate.len();
    let null = options.null_vector(k)?;
    let reference = Reference::new(options.df)?;

    let statistic: Array1<f64> = (&estimate - &null) / &se;
    let raw_p = statistic.mapv(|z| 2.0 * reference.sf(z.abs()));
    let p_value = match options.p_adjust {
        Some(method) => adjust_p_values(raw_p.view(), method),
        None => raw_p,
    };
    let s_value = p_value.mapv(|p| -p.log2());

    let q = reference.quantile(1.0 - (1.0 - options.conf_level) / 2.0);
    let conf_low = &estimate - &(q * &se);
    let conf_high = &estimate + &(q * &se);

    let equivalence = options.equivalence.map(|(lower, upper)| {
        let statistic_noninf = (&estimate - lower) / &se;
        let statistic_nonsup = (&estimate - upper) / &se;
        let p_value_noninf = statistic_noninf.mapv(|z| reference.sf(z));
        let p_value_nonsup = statistic_nonsup.mapv(|z| reference.cdf(z));
        let p_value_equiv = ndarray::Zip::from(&p_value_noninf)
            .and(&p_value_nonsup)
            .map_collect(|a, b| a.max(*b));
        Equivalence {
            statistic_noninf,
            statistic_nonsup,
            p_value_noninf,
            p_value_nonsup,
            p_value_equiv,
        }
    });

    Ok(Inference {
        std_error: Some(se.to_owned()),
        statistic: Some(statistic),
        p_value: Some(p_value),
        s_value: Some(s_value),
        conf_low: Some(conf_low),
        conf_high: Some(conf_high),
        equivalence,
    })
}

/// Summarizes posterior draws (`k x n_draws`): the estimate is the median of
/// each row and the interval uses equal-tailed quantiles. No standard errors
/// or p-values are produced.
pub fn finalize_draws(
    draws: ArrayView2<f64>,
    options: &InferenceOptions,
) -> EffectsResult<(Array1<f64>, Inference)> {
    options.validate()?;
    if options.p_adjust.is_some() || options.equivalence.is_some() {
        log::warn!("p_adjust and equivalence are ignored for posterior draws");
    }
    let alpha = 1.0 - options.conf_level;
    let mut estimate = Array1::zeros(draws.nrows());
    let mut conf_low = Array1::zeros(draws.nrows());
    let mut conf_high = Array1::zeros(draws.nrows());
    for (i, row) in draws.axis_iter(Axis(0)).enumerate() {
        let mut sorted = row.to_vec();
        sorted.sort_by(f64::total_cmp);
        estimate[i] = quantile(&sorted, 0.5);
        conf_low[i] = quantile(&sorted, alpha / 2.0);
        conf_high[i] = quantile(&sorted, 1.0 - alpha / 2.0);
    }
    Ok((
        estimate,
        Inference {
            conf_low: Some(conf_low),
            conf_high: Some(conf_high),
            ..Inference::default()
        },
    ))
}

/// Linearly interpolated quantile of already sorted values.
pub(crate) fn quantile(sorted: &[f64], prob: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let h = (n - 1) as f64 * prob.clamp(0.0, 1.0);
            let lo = h.floor() as usize;
            let hi = (lo + 1).min(n - 1);
            sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
        }
    }
}

/// Adjusts a vector of p-values for multiple comparisons. Missing (NaN)
/// p-values stay missing and do not count towards the number of tests.
pub fn adjust_p_values(p: ArrayView1<f64>, method: PAdjust) -> Array1<f64> {
    let mut adjusted = p.to_owned();
    let mut present: Vec<usize> = (0..p.len()).filter(|&i| !p[i].is_nan()).collect();
    let n = present.len();
    if n == 0 {
        return adjusted;
    }
    let nf = n as f64;

    match method {
        PAdjust::Bonferroni => {
            for &i in &present {
                adjusted[i] = (nf * p[i]).min(1.0);
            }
        }
        PAdjust::Holm => {
            present.sort_by(|&a, &b| p[a].total_cmp(&p[b]));
            let mut running = 0.0f64;
            for (rank, &i) in present.iter().enumerate() {
                running = running.max((nf - rank as f64) * p[i]);
                adjusted[i] = running.min(1.0);
            }
        }
        PAdjust::Hochberg | PAdjust::Bh | PAdjust::By => {
            present.sort_by(|&a, &b| p[b].total_cmp(&p[a]));
            let harmonic: f64 = (1..=n).map(|j| 1.0 / j as f64).sum();
            let mut running = f64::INFINITY;
            for (rank, &i) in present.iter().enumerate() {
                let ascending_rank = (n - rank) as f64;
                let factor = match method {
                    PAdjust::Hochberg => rank as f64 + 1.0,
                    PAdjust::Bh => nf / ascending_rank,
                    _ => harmonic * nf / ascending_rank,
                };
                running = running.min(factor * p[i]);
                adjusted[i] = running.min(1.0);
            }
        }
    }
    adjusted
}
