use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::json;

use crate::runner::{StepKind, StepResult};
use crate::testing::AssertionResult;

/// Serialized shape of one step. Response fields are present only for
/// request steps that received a response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport<'a> {
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<&'a str>,
    pub kind: &'static str,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<&'a BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub assertions: Vec<AssertionReport<'a>>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    pub log: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a str>,
}

#[derive(Debug, Serialize)]
pub struct AssertionReport<'a> {
    pub target: String,
    pub operator: &'static str,
    pub expected: &'a str,
    pub actual: &'a str,
    pub passed: bool,
}

impl<'a> From<&'a AssertionResult> for AssertionReport<'a> {
    fn from(result: &'a AssertionResult) -> Self {
        Self {
            target: result.assertion.target.to_string(),
            operator: result.assertion.operator.keyword(),
            expected: &result.expected,
            actual: &result.actual,
            passed: result.passed,
        }
    }
}

impl<'a> From<&'a StepResult> for StepReport<'a> {
    fn from(result: &'a StepResult) -> Self {
        let response = result.response.as_ref();
        Self {
            file: result.file.display().to_string(),
            name: result.name.as_deref(),
            kind: match result.kind {
                StepKind::Request => "request",
                StepKind::Script => "script",
            },
            passed: result.passed,
            method: result.request.as_ref().map(|request| request.method.to_string()),
            url: result.request.as_ref().map(|request| request.url.as_str()),
            status_code: response.map(|response| response.status_code),
            duration: response.map(|response| response.duration.as_millis() as u64),
            headers: response.map(|response| &response.headers),
            body: response.map(|response| response.body.as_str()),
            assertions: result.assertions.iter().map(AssertionReport::from).collect(),
            log: &result.log,
            error: result.error.as_deref(),
        }
    }
}

/// A single step renders as an object, several as an array.
pub fn render_json(results: &[StepResult]) -> String {
    let reports: Vec<StepReport<'_>> = results.iter().map(StepReport::from).collect();
    let rendered = match reports.as_slice() {
        [single] => serde_json::to_string_pretty(single),
        _ => serde_json::to_string_pretty(&reports),
    };
    rendered.unwrap_or_default()
}

pub fn render_ndjson_line(result: &StepResult) -> String {
    serde_json::to_string(&StepReport::from(result)).unwrap_or_default()
}

/// Final NDJSON line for a run that could not complete.
pub fn fatal_line(message: &str) -> String {
    json!({ "error": message }).to_string()
}
