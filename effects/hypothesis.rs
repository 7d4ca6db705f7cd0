//! # Hypothesis and Transform Layer
//!
//! Hypotheses combine the rows of an estimate vector. Linear hypotheses
//! (shorthands, coefficient matrices and vectors) are applied exactly through
//! the chain rule: estimate `L b`, Jacobian `L J`, covariance `L V L^T`.
//! Equations and custom functions are differentiated numerically with respect
//! to the estimates, using the same finite-difference discipline as the
//! delta-method engine, and then composed with `J` in the same way.
//!
//! Transforms act element-wise and are placed inside the differentiated
//! closure, so their derivative is picked up by the parameter Jacobian.

use crate::effects::errors::{EffectsError, EffectsResult};
use crate::effects::jacobian::{DeltaMethodConfig, numerical_jacobian};
use crate::effects::table::RowLabels;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub type HypothesisFn = Arc<dyn Fn(ArrayView1<f64>) -> Array1<f64> + Send + Sync>;
pub type TransformFn = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

/// Named row-contrast policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shorthand {
    /// `b[j] - b[i]` for every `i < j`.
    Pairwise,
    /// `b[i] - b[j]` for every `i < j`.
    Revpairwise,
    /// `b[i+1] - b[i]`.
    Sequential,
    /// `b[i] - b[i+1]`.
    Revsequential,
    /// `b[i] - b[0]` for `i >= 1`.
    Reference,
    /// `b[0] - b[i]` for `i >= 1`.
    Revreference,
    /// `b[i] - mean(b)`.
    Meandev,
}

impl FromStr for Shorthand {
    type Err = EffectsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "pairwise" => Ok(Shorthand::Pairwise),
            "revpairwise" => Ok(Shorthand::Revpairwise),
            "sequential" => Ok(Shorthand::Sequential),
            "revsequential" => Ok(Shorthand::Revsequential),
            "reference" => Ok(Shorthand::Reference),
            "revreference" => Ok(Shorthand::Revreference),
            "meandev" => Ok(Shorthand::Meandev),
            other => Err(EffectsError::InvalidHypothesisSpec(format!(
                "unknown shorthand '{other}'. Valid: pairwise, revpairwise, sequential, revsequential, reference, revreference, meandev"
            ))),
        }
    }
}

/// A hypothesis to apply to the rows of an estimate table.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HypothesisSpec {
    Shorthand(Shorthand),
    /// Equations such as `"b2 = b1"` or `"b1 / b2 = 1"`, one output row each.
    Equations(Vec<String>),
    /// `k_out x k_in` coefficient matrix; each row is one combination.
    Matrix(Array2<f64>),
    /// A single linear combination.
    Vector(Vec<f64>),
    #[serde(skip)]
    Function(HypothesisFn),
}

impl fmt::Debug for HypothesisSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HypothesisSpec::Shorthand(s) => write!(f, "Shorthand({s:?})"),
            HypothesisSpec::Equations(e) => write!(f, "Equations({e:?})"),
            HypothesisSpec::Matrix(m) => write!(f, "Matrix({}x{})", m.nrows(), m.ncols()),
            HypothesisSpec::Vector(v) => write!(f, "Vector({v:?})"),
            HypothesisSpec::Function(_) => f.write_str("Function(..)"),
        }
    }
}

/// Parses a shorthand name, or otherwise `;`-separated equations.
impl FromStr for HypothesisSpec {
    type Err = EffectsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(shorthand) = s.parse::<Shorthand>() {
            return Ok(HypothesisSpec::Shorthand(shorthand));
        }
        let equations: Vec<String> = s
            .split(';')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string)
            .collect();
        if equations.is_empty() || equations.iter().any(|e| !e.contains('=')) {
            return Err(EffectsError::InvalidHypothesisSpec(format!(
                "'{s}' is neither a known shorthand nor a list of equations of the form 'lhs = rhs'"
            )));
        }
        Ok(HypothesisSpec::Equations(equations))
    }
}

/// Element-wise back-transformation of estimates.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    Exp,
    Ln,
    Logistic,
    #[serde(skip)]
    Custom(TransformFn),
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Transform::Exp => "Exp",
            Transform::Ln => "Ln",
            Transform::Logistic => "Logistic",
            Transform::Custom(_) => "Custom(..)",
        })
    }
}

impl Transform {
    pub fn apply(&self, values: Array1<f64>) -> Array1<f64> {
        match self {
            Transform::Exp => values.mapv_into(f64::exp),
            Transform::Ln => values.mapv_into(f64::ln),
            Transform::Logistic => values.mapv_into(|v| 1.0 / (1.0 + (-v).exp())),
            Transform::Custom(f) => values.mapv_into(|v| f(v)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Function {
    Exp,
    Log,
    Sqrt,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    /// Zero-based estimate index.
    Coef(usize),
    Neg(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Pow(Box<Expr>, Box<Expr>),
    Call(Function, Box<Expr>),
}

impl Expr {
    fn eval(&self, b: ArrayView1<f64>) -> f64 {
        match self {
            Expr::Number(v) => *v,
            Expr::Coef(i) => b[*i],
            Expr::Neg(e) => -e.eval(b),
            Expr::Add(l, r) => l.eval(b) + r.eval(b),
            Expr::Sub(l, r) => l.eval(b) - r.eval(b),
            Expr::Mul(l, r) => l.eval(b) * r.eval(b),
            Expr::Div(l, r) => l.eval(b) / r.eval(b),
            Expr::Pow(l, r) => l.eval(b).powf(r.eval(b)),
            Expr::Call(Function::Exp, e) => e.eval(b).exp(),
            Expr::Call(Function::Log, e) => e.eval(b).ln(),
            Expr::Call(Function::Sqrt, e) => e.eval(b).sqrt(),
        }
    }

    fn max_coef(&self) -> Option<usize> {
        match self {
            Expr::Number(_) => None,
            Expr::Coef(i) => Some(*i),
            Expr::Neg(e) | Expr::Call(_, e) => e.max_coef(),
            Expr::Add(l, r)
            | Expr::Sub(l, r)
            | Expr::Mul(l, r)
            | Expr::Div(l, r)
            | Expr::Pow(l, r) => l.max_coef().max(r.max_coef()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Equation {
    text: String,
    lhs: Expr,
    rhs: Expr,
}

impl Equation {
    fn parse(text: &str) -> EffectsResult<Self> {
        let sides: Vec<&str> = text.split('=').collect();
        if sides.len() != 2 {
            return Err(EffectsError::InvalidHypothesisSpec(format!(
                "equation '{text}' must contain exactly one '='"
            )));
        }
        Ok(Self {
            text: text.trim().to_string(),
            lhs: parser::parse(sides[0])?,
            rhs: parser::parse(sides[1])?,
        })
    }

    fn eval(&self, b: ArrayView1<f64>) -> f64 {
        self.lhs.eval(b) - self.rhs.eval(b)
    }
}

mod parser {
    use super::{Expr, Function};
    use crate::effects::errors::{EffectsError, EffectsResult};
    use std::fmt;

    #[derive(Debug, Clone, PartialEq)]
    enum Token {
        Number(f64),
        Ident(String),
        Op(char),
    }

    fn invalid(source: &str, message: impl fmt::Display) -> EffectsError {
        EffectsError::InvalidHypothesisSpec(format!("cannot parse '{}': {message}", source.trim()))
    }

    fn tokenize(source: &str) -> EffectsResult<Vec<Token>> {
        let chars: Vec<char> = source.chars().collect();
        let mut tokens = Vec::new();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if c.is_whitespace() {
                i += 1;
            } else if c.is_ascii_digit() || c == '.' {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // Exponent: `e` or `E`, an optional sign, then at least one digit.
                if i < chars.len() && matches!(chars[i], 'e' | 'E') {
                    let sign = usize::from(matches!(chars.get(i + 1), Some('+' | '-')));
                    if chars.get(i + 1 + sign).is_some_and(|d| d.is_ascii_digit()) {
                        i += 1 + sign;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| invalid(source, format!("bad number '{text}'")))?;
                tokens.push(Token::Number(value));
            } else if c.is_alphabetic() {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            } else if "+-*/^()".contains(c) {
                tokens.push(Token::Op(c));
                i += 1;
            } else {
                return Err(invalid(source, format!("unexpected character '{c}'")));
            }
        }
        Ok(tokens)
    }

    struct Parser<'a> {
        source: &'a str,
        tokens: Vec<Token>,
        pos: usize,
    }

    impl Parser<'_> {
        fn peek_op(&self) -> Option<char> {
            match self.tokens.get(self.pos) {
                Some(Token::Op(c)) => Some(*c),
                _ => None,
            }
        }

        fn expect(&mut self, op: char) -> EffectsResult<()> {
            if self.peek_op() == Some(op) {
                self.pos += 1;
                Ok(())
            } else {
                Err(invalid(self.source, format!("expected '{op}'")))
            }
        }

        fn expression(&mut self) -> EffectsResult<Expr> {
            let mut left = self.term()?;
            while let Some(op @ ('+' | '-')) = self.peek_op() {
                self.pos += 1;
                let right = self.term()?;
                left = if op == '+' {
                    Expr::Add(Box::new(left), Box::new(right))
                } else {
                    Expr::Sub(Box::new(left), Box::new(right))
                };
            }
            Ok(left)
        }

        fn term(&mut self) -> EffectsResult<Expr> {
            let mut left = self.unary()?;
            while let Some(op @ ('*' | '/')) = self.peek_op() {
                self.pos += 1;
                let right = self.unary()?;
                left = if op == '*' {
                    Expr::Mul(Box::new(left), Box::new(right))
                } else {
                    Expr::Div(Box::new(left), Box::new(right))
                };
            }
            Ok(left)
        }

        fn unary(&mut self) -> EffectsResult<Expr> {
            if self.peek_op() == Some('-') {
                self.pos += 1;
                return Ok(Expr::Neg(Box::new(self.unary()?)));
            }
            let base = self.atom()?;
            if self.peek_op() == Some('^') {
                self.pos += 1;
                let exponent = self.unary()?;
                return Ok(Expr::Pow(Box::new(base), Box::new(exponent)));
            }
            Ok(base)
        }

        fn atom(&mut self) -> EffectsResult<Expr> {
            let token = self
                .tokens
                .get(self.pos)
                .cloned()
                .ok_or_else(|| invalid(self.source, "unexpected end of expression"))?;
            self.pos += 1;
            match token {
                Token::Number(v) => Ok(Expr::Number(v)),
                Token::Op('(') => {
                    let inner = self.expression()?;
                    self.expect(')')?;
                    Ok(inner)
                }
                Token::Op(c) => Err(invalid(self.source, format!("unexpected '{c}'"))),
                Token::Ident(name) => {
                    let function = match name.as_str() {
                        "exp" => Some(Function::Exp),
                        "log" | "ln" => Some(Function::Log),
                        "sqrt" => Some(Function::Sqrt),
                        _ => None,
                    };
                    if let Some(function) = function {
                        self.expect('(')?;
                        let argument = self.expression()?;
                        self.expect(')')?;
                        return Ok(Expr::Call(function, Box::new(argument)));
                    }
                    match name.strip_prefix('b').map(str::parse::<usize>) {
                        Some(Ok(index)) if index >= 1 => Ok(Expr::Coef(index - 1)),
                        _ => Err(invalid(
                            self.source,
                            format!("unknown name '{name}'; refer to estimates as b1, b2, ..."),
                        )),
                    }
                }
            }
        }
    }

    pub(super) fn parse(source: &str) -> EffectsResult<Expr> {
        let mut parser = Parser {
            source,
            tokens: tokenize(source)?,
            pos: 0,
        };
        let expr = parser.expression()?;
        if parser.pos != parser.tokens.len() {
            return Err(invalid(source, "trailing input"));
        }
        Ok(expr)
    }
}

enum Kind {
    Linear(Array2<f64>),
    Equations(Vec<Equation>),
    Function(HypothesisFn),
}

/// A hypothesis resolved against a concrete set of input rows.
pub struct Hypothesis {
    kind: Kind,
    names: Vec<String>,
    k_in: usize,
}

/// Estimates, Jacobian and covariance after a hypothesis.
#[derive(Debug, Clone, PartialEq)]
pub struct HypothesisOutput {
    pub estimate: Array1<f64>,
    pub jacobian: Option<Array2<f64>>,
    pub vcov: Option<Array2<f64>>,
    pub labels: RowLabels,
}

impl Hypothesis {
    /// Resolves `spec` against the rows described by `labels`.
    pub fn resolve(spec: &HypothesisSpec, labels: &RowLabels) -> EffectsResult<Self> {
        let k = labels.len();
        let (kind, names) = match spec {
            HypothesisSpec::Shorthand(shorthand) => {
                let (matrix, names) = internal::expand_shorthand(*shorthand, labels)?;
                (Kind::Linear(matrix), names)
            }
            HypothesisSpec::Matrix(matrix) => {
                internal::check_columns(matrix.ncols(), k)?;
                let names: Vec<String> =
                    matrix.rows().into_iter().map(internal::linear_label).collect();
                (Kind::Linear(matrix.clone()), names)
            }
            HypothesisSpec::Vector(weights) => {
                internal::check_columns(weights.len(), k)?;
                let row = Array1::from_vec(weights.clone());
                let names = vec![internal::linear_label(row.view())];
                (Kind::Linear(row.insert_axis(ndarray::Axis(0))), names)
            }
            HypothesisSpec::Equations(texts) => {
                let equations = texts
                    .iter()
                    .map(|t| Equation::parse(t))
                    .collect::<EffectsResult<Vec<_>>>()?;
                for eq in &equations {
                    let highest = eq.lhs.max_coef().max(eq.rhs.max_coef());
                    if let Some(i) = highest.filter(|&i| i >= k) {
                        return Err(EffectsError::InvalidHypothesisSpec(format!(
                            "'{}' refers to b{} but there are only {k} estimates",
                            eq.text,
                            i + 1
                        )));
                    }
                }
                let names: Vec<String> = equations.iter().map(|e| e.text.clone()).collect();
                (Kind::Equations(equations), names)
            }
            HypothesisSpec::Function(f) => (Kind::Function(f.clone()), Vec::new()),
        };
        Ok(Self {
            kind,
            names,
            k_in: k,
        })
    }

    /// Evaluates the hypothesis on one estimate vector.
    pub fn apply(&self, estimate: ArrayView1<f64>) -> EffectsResult<Array1<f64>> {
        if estimate.len() != self.k_in {
            return Err(EffectsError::InvalidHypothesisSpec(format!(
                "hypothesis was built for {} estimates, got {}",
                self.k_in,
                estimate.len()
            )));
        }
        Ok(match &self.kind {
            Kind::Linear(matrix) => matrix.dot(&estimate),
            Kind::Equations(equations) => equations.iter().map(|e| e.eval(estimate)).collect(),
            Kind::Function(f) => f(estimate),
        })
    }

    /// Derivative of the hypothesis output with respect to its inputs,
    /// evaluated at `estimate` (`k_out x k_in`).
    fn derivative(
        &self,
        estimate: ArrayView1<f64>,
        value: ArrayView1<f64>,
        config: &DeltaMethodConfig,
    ) -> EffectsResult<Array2<f64>> {
        match &self.kind {
            Kind::Linear(matrix) => Ok(matrix.clone()),
            _ => {
                let result = numerical_jacobian(|b| self.apply(b), estimate, value, config);
                result.map_err(|e| match e {
                    EffectsError::JacobianEvaluation {
                        parameter, reason, ..
                    } => EffectsError::InvalidHypothesisSpec(format!(
                        "hypothesis cannot be differentiated with respect to b{}: {reason}",
                        parameter + 1
                    )),
                    other => other,
                })
            }
        }
    }

    /// Applies the hypothesis and carries `jacobian` (`k_in x p`) and `vcov`
    /// (`k_in x k_in`) through it.
    pub fn propagate(
        &self,
        estimate: ArrayView1<f64>,
        jacobian: Option<ArrayView2<f64>>,
        vcov: Option<ArrayView2<f64>>,
        config: &DeltaMethodConfig,
    ) -> EffectsResult<HypothesisOutput> {
        let value = self.apply(estimate)?;
        let labels = self.labels(value.len());
        if jacobian.is_none() && vcov.is_none() {
            return Ok(HypothesisOutput {
                estimate: value,
                jacobian: None,
                vcov: None,
                labels,
            });
        }
        let d = self.derivative(estimate, value.view(), config)?;
        log::debug!(
            "hypothesis derivative: {} outputs x {} inputs",
            d.nrows(),
            d.ncols()
        );
        Ok(HypothesisOutput {
            jacobian: jacobian.map(|j| d.dot(&j)),
            vcov: vcov.map(|v| d.dot(&v).dot(&d.t())),
            estimate: value,
            labels,
        })
    }

    /// Labels of the output rows.
    pub fn labels(&self, k_out: usize) -> RowLabels {
        if self.names.len() == k_out {
            RowLabels::hypotheses(self.names.clone())
        } else {
            RowLabels::hypotheses((1..=k_out).map(|i| format!("f{i}")).collect())
        }
    }
}

mod internal {
    use super::*;

    pub(super) fn check_columns(found: usize, k: usize) -> EffectsResult<()> {
        if found != k {
            return Err(EffectsError::InvalidHypothesisSpec(format!(
                "hypothesis has {found} columns but the estimate table has {k} rows"
            )));
        }
        Ok(())
    }

    /// Text such as `b1 - 0.5*b3` for one row of coefficients.
    pub(super) fn linear_label(row: ArrayView1<f64>) -> String {
        let mut out = String::new();
        for (i, &w) in row.iter().enumerate().filter(|(_, w)| **w != 0.0) {
            let magnitude = w.abs();
            let sign = if w < 0.0 { "-" } else { "+" };
            if out.is_empty() {
                if w < 0.0 {
                    out.push('-');
                }
            } else {
                out.push_str(&format!(" {sign} "));
            }
            if magnitude == 1.0 {
                out.push_str(&format!("b{}", i + 1));
            } else {
                out.push_str(&format!("{magnitude}*b{}", i + 1));
            }
        }
        if out.is_empty() { "0".to_string() } else { out }
    }

    pub(super) fn expand_shorthand(
        shorthand: Shorthand,
        labels: &RowLabels,
    ) -> EffectsResult<(Array2<f64>, Vec<String>)> {
        let k = labels.len();
        let minimum = if shorthand == Shorthand::Meandev { 1 } else { 2 };
        if k < minimum {
            return Err(EffectsError::InvalidHypothesisSpec(format!(
                "'{shorthand:?}' needs at least {minimum} estimates, found {k}"
            )));
        }
        let desc: Vec<String> = (0..k).map(|i| labels.describe(i)).collect();
        let pair_name = |a: usize, b: usize| format!("({}) - ({})", desc[a], desc[b]);

        // (plus, minus) index pairs; meandev is handled separately.
        let pairs: Vec<(usize, usize)> = match shorthand {
            Shorthand::Pairwise => (0..k)
                .flat_map(|i| (i + 1..k).map(move |j| (j, i)))
                .collect(),
            Shorthand::Revpairwise => (0..k)
                .flat_map(|i| (i + 1..k).map(move |j| (i, j)))
                .collect(),
            Shorthand::Sequential => (0..k - 1).map(|i| (i + 1, i)).collect(),
            Shorthand::Revsequential => (0..k - 1).map(|i| (i, i + 1)).collect(),
            Shorthand::Reference => (1..k).map(|i| (i, 0)).collect(),
            Shorthand::Revreference => (1..k).map(|i| (0, i)).collect(),
            Shorthand::Meandev => {
                let mut matrix = Array2::from_elem((k, k), -1.0 / k as f64);
                for i in 0..k {
                    matrix[[i, i]] += 1.0;
                }
                let names = desc.iter().map(|d| format!("({d}) - mean")).collect();
                return Ok((matrix, names));
            }
        };
        let mut matrix = Array2::zeros((pairs.len(), k));
        let mut names = Vec::with_capacity(pairs.len());
        for (row, &(plus, minus)) in pairs.iter().enumerate() {
            matrix[[row, plus]] = 1.0;
            matrix[[row, minus]] = -1.0;
            names.push(pair_name(plus, minus));
        }
        Ok((matrix, names))
    }
}
