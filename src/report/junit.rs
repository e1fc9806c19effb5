use crate::error::{DazzleError, Result};
use crate::runner::{TestResult, TestStatus};
use serde::Serialize;

const SUITE_NAME: &str = "dazzle";

#[derive(Serialize)]
struct Suite<'a> {
    #[serde(rename = "@name")]
    name: &'a str,
    #[serde(rename = "@tests")]
    tests: usize,
    #[serde(rename = "@failures")]
    failures: usize,
    #[serde(rename = "@errors")]
    errors: usize,
    #[serde(rename = "@time")]
    time: String,
    #[serde(rename = "testcase")]
    cases: Vec<Case<'a>>,
}

#[derive(Serialize)]
struct Case<'a> {
    #[serde(rename = "@name")]
    name: &'a str,
    #[serde(rename = "@classname")]
    classname: &'a str,
    #[serde(rename = "@time")]
    time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<Message<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    #[serde(rename = "@message")]
    message: &'a str,
    #[serde(rename = "$text")]
    text: &'a str,
}

fn seconds(ms: u64) -> String {
    format!("{:.3}", ms as f64 / 1000.0)
}

/// Renders a flattened report as a single JUnit `<testsuite>`
pub fn to_junit_xml(report: &TestResult) -> Result<String> {
    let cases = report
        .outcomes
        .iter()
        .map(|outcome| {
            let classname = outcome
                .description
                .split_once(": ")
                .map(|(layer, _)| layer)
                .unwrap_or(SUITE_NAME);
            let message = Message {
                message: outcome.detail.lines().next().unwrap_or_default(),
                text: &outcome.detail,
            };
            let (failure, error) = match outcome.status {
                TestStatus::Passed => (None, None),
                TestStatus::Failed => (Some(message), None),
                TestStatus::Error => (None, Some(message)),
            };
            Case {
                name: &outcome.description,
                classname,
                time: seconds(outcome.duration_ms),
                failure,
                error,
            }
        })
        .collect();

    let suite = Suite {
        name: SUITE_NAME,
        tests: report.outcomes.len(),
        failures: report.failed(),
        errors: report.errored(),
        time: seconds(report.outcomes.iter().map(|o| o.duration_ms).sum()),
        cases,
    };

    let body = quick_xml::se::to_string_with_root("testsuite", &suite)
        .map_err(|e| DazzleError::Report(e.to_string()))?;
    Ok(format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{}\n", body))
}
