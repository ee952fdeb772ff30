use std::fmt::Write;

use super::request_line;
use crate::runner::{RunSummary, StepKind, StepResult};

pub fn render_pretty(summary: &RunSummary) -> String {
    let mut out = String::new();
    for result in &summary.results {
        render_step(&mut out, result);
    }
    out.push_str(&render_summary_line(summary));
    out
}

/// `N passed, M failed`
pub fn render_summary_line(summary: &RunSummary) -> String {
    let failed = summary.failed_count();
    format!("{} passed, {failed} failed", summary.results.len() - failed)
}

fn render_step(out: &mut String, result: &StepResult) {
    let verdict = if result.passed { "[PASS]" } else { "[FAIL]" };
    let _ = write!(out, "{verdict} {}", result.label());

    match (result.kind, &result.response) {
        (StepKind::Script, _) => {
            let _ = write!(out, " (script, {}ms)", result.duration.as_millis());
        }
        (StepKind::Request, Some(response)) => {
            if let Some(line) = request_line(result) {
                let _ = write!(out, " {line}");
            }
            let _ = write!(out, " -> {} ({}ms)", response.status_code, response.duration_ms());
        }
        (StepKind::Request, None) => {
            if let Some(line) = request_line(result) {
                let _ = write!(out, " {line}");
            }
        }
    }
    out.push('\n');

    if let Some(error) = &result.error {
        let _ = writeln!(out, "    error: {error}");
    }
    for assertion in result.assertions.iter().filter(|assertion| !assertion.passed) {
        let _ = writeln!(
            out,
            "    {}\n      expected: {}\n      actual:   {}",
            assertion.assertion, assertion.expected, assertion.actual
        );
    }
    for line in &result.log {
        let _ = writeln!(out, "    | {line}");
    }
}

#[cfg(test)]
mod tests {
    use super::super::samples::*;
    use super::*;

    #[test]
    fn passing_request_is_one_line() {
        let summary = RunSummary {
            results: vec![request_step(200, "200")],
        };
        assert_eq!(
            render_pretty(&summary),
            "[PASS] users/get.nap GET https://api.test/users/1 -> 200 (42ms)\n1 passed, 0 failed"
        );
    }

    #[test]
    fn failures_show_expected_and_actual() {
        let summary = RunSummary {
            results: vec![request_step(404, "200"), script_step(false)],
        };
        let text = render_pretty(&summary);
        assert!(text.contains("[FAIL] users/get.nap"));
        assert!(text.contains("    status = 200\n      expected: 200\n      actual:   404\n"));
        assert!(text.contains("[FAIL] seed.fsx (script, 1500ms)\n    error: script exited with status 1"));
        assert!(text.contains("    | seeded 3 users\n"));
        assert!(text.ends_with("0 passed, 2 failed"));
    }

    #[test]
    fn named_steps_use_their_name() {
        let mut result = request_step(200, "200");
        result.name = Some("Fetch user".into());
        let summary = RunSummary { results: vec![result] };
        assert!(render_pretty(&summary).starts_with("[PASS] Fetch user GET"));
    }
}
