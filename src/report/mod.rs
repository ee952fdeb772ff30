//! # Result Formatting
//!
//! Stateless renderers for [`StepResult`]s. Every renderer returns text; the
//! binary decides where it goes.

mod json;
mod junit;
mod pretty;

use clap::ValueEnum;

use crate::runner::{RunSummary, StepResult};

pub use json::{AssertionReport, StepReport, fatal_line, render_json, render_ndjson_line};
pub use junit::render_junit;
pub use pretty::{render_pretty, render_summary_line};

/// Output format for `nap run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable lines with a summary
    #[default]
    Pretty,
    /// A JSON object, or an array for more than one step
    Json,
    /// JUnit XML for CI systems
    Junit,
    /// One JSON object per line, streamed as steps finish
    Ndjson,
}

impl OutputFormat {
    /// Whether results are printed one by one while the run is in progress.
    pub fn streams(self) -> bool {
        self == OutputFormat::Ndjson
    }
}

/// Render a finished run in `format`.
pub fn render(format: OutputFormat, summary: &RunSummary) -> String {
    match format {
        OutputFormat::Pretty => render_pretty(summary),
        OutputFormat::Json => render_json(&summary.results),
        OutputFormat::Junit => render_junit(summary),
        OutputFormat::Ndjson => summary
            .results
            .iter()
            .map(render_ndjson_line)
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Method and URL of a request step, if it got as far as resolving.
fn request_line(result: &StepResult) -> Option<String> {
    result
        .request
        .as_ref()
        .map(|request| format!("{} {}", request.method, request.url))
}

#[cfg(test)]
pub(crate) mod samples {
    use std::time::Duration;

    use crate::http::{HttpMethod, HttpResponse, ResolvedRequest};
    use crate::runner::{StepKind, StepResult};
    use crate::testing::{Assertion, AssertionOperator, AssertionTarget, evaluate};

    pub fn request_step(status: u16, expected: &str) -> StepResult {
        let response = HttpResponse::new(status)
            .with_header("Content-Type", "application/json")
            .with_body(r#"{"id":1}"#)
            .with_duration(Duration::from_millis(42));
        let assertions = vec![Assertion::new(
            AssertionTarget::Status,
            AssertionOperator::Equals(expected.to_string()),
        )];

        let mut result = StepResult::new("users/get.nap", StepKind::Request);
        result.assertions = evaluate(&response, &assertions);
        result.passed = result.assertions.iter().all(|assertion| assertion.passed);
        result.request = Some(ResolvedRequest {
            method: HttpMethod::Get,
            url: "https://api.test/users/1".into(),
            headers: Default::default(),
            body: None,
        });
        result.response = Some(response);
        result.duration = Duration::from_millis(45);
        result
    }

    pub fn script_step(passed: bool) -> StepResult {
        let mut result = StepResult::new("seed.fsx", StepKind::Script);
        result.log = vec!["seeded 3 users".into()];
        result.passed = passed;
        if !passed {
            result.error = Some("script exited with status 1: <db> & co unavailable".into());
        }
        result.duration = Duration::from_millis(1500);
        result
    }
}
