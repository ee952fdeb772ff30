use std::fmt::Write;

use crate::runner::{RunSummary, StepResult};

/// One `<testsuite>` with a `<testcase>` per step.
pub fn render_junit(summary: &RunSummary) -> String {
    let total: f64 = summary.results.iter().map(|result| result.duration.as_secs_f64()).sum();

    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    let _ = writeln!(
        out,
        "<testsuite name=\"nap\" tests=\"{}\" failures=\"{}\" time=\"{total:.3}\">",
        summary.results.len(),
        summary.failed_count(),
    );

    for result in &summary.results {
        let _ = write!(
            out,
            "  <testcase name=\"{}\" classname=\"{}\" time=\"{:.3}\"",
            escape_xml(&result.label()),
            escape_xml(&result.file.display().to_string()),
            result.duration.as_secs_f64(),
        );
        match failure(result) {
            None => out.push_str("/>\n"),
            Some((message, detail)) => {
                let _ = writeln!(
                    out,
                    ">\n    <failure message=\"{}\">{}</failure>\n  </testcase>",
                    escape_xml(&message),
                    escape_xml(&detail),
                );
            }
        }
    }

    out.push_str("</testsuite>\n");
    out
}

/// `(message, detail)` for a failed step.
fn failure(result: &StepResult) -> Option<(String, String)> {
    if result.passed {
        return None;
    }
    if let Some(error) = &result.error {
        return Some((error.clone(), error.clone()));
    }
    if let Some(assertion) = result.first_failed_assertion() {
        return Some((
            assertion.assertion.target.to_string(),
            format!("expected {}, actual {}", assertion.expected, assertion.actual),
        ));
    }
    Some(("step failed".to_string(), String::new()))
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
