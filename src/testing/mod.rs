//! # Testing & Assertions
//!
//! Declarative assertions over an HTTP response. Each assertion names a
//! target inside the response (`status`, `body`, `body.<path>`,
//! `headers.<name>`, `duration`) and an operator. Evaluation is independent
//! per assertion: one failure never hides the result of another.
//!
//! A target that cannot be located resolves to [`MISSING`], and every
//! operator fails against it.

use std::fmt::{self, Display};

use regex::Regex;
use serde_json::Value;

use crate::http::HttpResponse;

/// Resolved value of a target that cannot be located in the response.
pub const MISSING: &str = "<missing>";

/// Target of an assertion within the HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssertionTarget {
    Status,
    Body,
    /// Dot-separated path into a JSON body.
    BodyPath(String),
    Header(String),
    Duration,
}

impl Display for AssertionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssertionTarget::Status => write!(f, "status"),
            AssertionTarget::Body => write!(f, "body"),
            AssertionTarget::BodyPath(path) => write!(f, "body.{path}"),
            AssertionTarget::Header(name) => write!(f, "headers.{name}"),
            AssertionTarget::Duration => write!(f, "duration"),
        }
    }
}

/// Comparison operator for an assertion, with its literal operand.
///
/// Duration thresholds are kept as written (`500ms`, `0.5s`) so that
/// `{{var}}` substitution can apply to them before they are parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssertionOperator {
    Equals(String),
    Contains(String),
    Exists,
    Matches(String),
    LessThan(String),
    GreaterThan(String),
}

impl AssertionOperator {
    /// The literal operand, if the operator carries one.
    pub fn operand(&self) -> Option<&str> {
        match self {
            AssertionOperator::Equals(value)
            | AssertionOperator::Contains(value)
            | AssertionOperator::Matches(value)
            | AssertionOperator::LessThan(value)
            | AssertionOperator::GreaterThan(value) => Some(value),
            AssertionOperator::Exists => None,
        }
    }

    /// Apply `f` to the literal operand, leaving `Exists` untouched.
    pub fn map_operand(&self, f: impl FnOnce(&str) -> String) -> Self {
        match self {
            AssertionOperator::Equals(value) => AssertionOperator::Equals(f(value)),
            AssertionOperator::Contains(value) => AssertionOperator::Contains(f(value)),
            AssertionOperator::Matches(value) => AssertionOperator::Matches(f(value)),
            AssertionOperator::LessThan(value) => AssertionOperator::LessThan(f(value)),
            AssertionOperator::GreaterThan(value) => AssertionOperator::GreaterThan(f(value)),
            AssertionOperator::Exists => AssertionOperator::Exists,
        }
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            AssertionOperator::Equals(_) => "equals",
            AssertionOperator::Contains(_) => "contains",
            AssertionOperator::Exists => "exists",
            AssertionOperator::Matches(_) => "matches",
            AssertionOperator::LessThan(_) => "lessThan",
            AssertionOperator::GreaterThan(_) => "greaterThan",
        }
    }
}

/// A single assertion that can be evaluated against a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assertion {
    pub target: AssertionTarget,
    pub operator: AssertionOperator,
}

impl Assertion {
    pub fn new(target: AssertionTarget, operator: AssertionOperator) -> Self {
        Self { target, operator }
    }

    /// Text shown as the expected side of a result.
    pub fn expected(&self) -> String {
        match &self.operator {
            AssertionOperator::Equals(value)
            | AssertionOperator::Contains(value)
            | AssertionOperator::Matches(value) => value.clone(),
            AssertionOperator::Exists => "exists".to_string(),
            AssertionOperator::LessThan(value) => format!("< {value}"),
            AssertionOperator::GreaterThan(value) => format!("> {value}"),
        }
    }
}

impl Display for Assertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.operator {
            AssertionOperator::Equals(value) => write!(f, "{} = {value}", self.target),
            AssertionOperator::Contains(value) => write!(f, "{} contains \"{value}\"", self.target),
            AssertionOperator::Exists => write!(f, "{} exists", self.target),
            AssertionOperator::Matches(value) => write!(f, "{} matches \"{value}\"", self.target),
            AssertionOperator::LessThan(value) => write!(f, "{} < {value}", self.target),
            AssertionOperator::GreaterThan(value) => write!(f, "{} > {value}", self.target),
        }
    }
}

/// Result of evaluating an assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionResult {
    pub assertion: Assertion,
    pub passed: bool,
    pub expected: String,
    pub actual: String,
}

/// Evaluate every assertion against `response`, in order.
pub fn evaluate(response: &HttpResponse, assertions: &[Assertion]) -> Vec<AssertionResult> {
    assertions
        .iter()
        .map(|assertion| evaluate_one(response, assertion))
        .collect()
}

pub fn evaluate_one(response: &HttpResponse, assertion: &Assertion) -> AssertionResult {
    let expected = assertion.expected();
    let actual = resolve_target(response, &assertion.target);

    let passed = match actual.as_deref() {
        None => false,
        Some(actual) => match &assertion.operator {
            AssertionOperator::Exists => true,
            AssertionOperator::Equals(value) => actual == value,
            AssertionOperator::Contains(value) => {
                actual.to_lowercase().contains(&value.to_lowercase())
            }
            AssertionOperator::Matches(pattern) => Regex::new(pattern)
                .map(|regex| regex.is_match(actual))
                .unwrap_or(false),
            AssertionOperator::LessThan(threshold) => {
                compare_millis(response, &assertion.target, actual, threshold, |a, t| a < t)
            }
            AssertionOperator::GreaterThan(threshold) => {
                compare_millis(response, &assertion.target, actual, threshold, |a, t| a > t)
            }
        },
    };

    AssertionResult {
        assertion: assertion.clone(),
        passed,
        expected,
        actual: actual.unwrap_or_else(|| MISSING.to_string()),
    }
}

fn compare_millis(
    response: &HttpResponse,
    target: &AssertionTarget,
    actual: &str,
    threshold: &str,
    cmp: impl Fn(f64, f64) -> bool,
) -> bool {
    let Some(threshold) = parse_duration_ms(threshold) else {
        return false;
    };
    let actual = match target {
        AssertionTarget::Duration => response.duration.as_secs_f64() * 1000.0,
        _ => match actual.trim().parse::<f64>() {
            Ok(value) => value,
            Err(_) => return false,
        },
    };
    cmp(actual, threshold)
}

/// Resolve a target to its textual value, `None` when it cannot be located.
pub fn resolve_target(response: &HttpResponse, target: &AssertionTarget) -> Option<String> {
    match target {
        AssertionTarget::Status => Some(response.status_code.to_string()),
        AssertionTarget::Body => Some(response.body.clone()),
        AssertionTarget::BodyPath(path) => json_path(&response.body, path),
        AssertionTarget::Header(name) => response.header(name).map(str::to_string),
        AssertionTarget::Duration => Some(format!("{}ms", response.duration_ms())),
    }
}

/// Walk a dot-separated path through JSON object members.
fn json_path(body: &str, path: &str) -> Option<String> {
    let root: Value = serde_json::from_str(body).ok()?;
    let mut current = &root;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }

    Some(match current {
        Value::String(text) => text.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(value) => value.to_string(),
        Value::Number(number) => number.to_string(),
        Value::Array(_) | Value::Object(_) => current.to_string(),
    })
}

/// Parse a `<number>ms` or `<number>s` literal into milliseconds.
/// A bare number is taken as milliseconds.
pub fn parse_duration_ms(literal: &str) -> Option<f64> {
    let literal = literal.trim();
    let (number, scale) = if let Some(number) = literal.strip_suffix("ms") {
        (number, 1.0)
    } else if let Some(number) = literal.strip_suffix('s') {
        (number, 1000.0)
    } else {
        (literal, 1.0)
    };
    let value: f64 = number.trim().parse().ok()?;
    (value.is_finite() && value >= 0.0).then_some(value * scale)
}
