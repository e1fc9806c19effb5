//! Flattens per-layer test outcomes into one report.

pub mod junit;

pub use junit::to_junit_xml;

use crate::builder::BuiltLayer;
use crate::error::{DazzleError, Result};
use crate::runner::{TestOutcome, TestResult};
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Every outcome of every layer, in layer order then test order, with
/// descriptions prefixed by the layer name. Layers without a test result
/// contribute nothing.
pub fn aggregate(layers: &[BuiltLayer]) -> TestResult {
    let outcomes = layers
        .iter()
        .filter_map(|layer| layer.test_result.as_ref().map(|r| (layer.name.as_str(), r)))
        .flat_map(|(name, result)| {
            result.outcomes.iter().map(move |outcome| TestOutcome {
                description: format!("{}: {}", name, outcome.description),
                ..outcome.clone()
            })
        })
        .collect();
    TestResult { outcomes }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    passed: usize,
    failed: usize,
    errored: usize,
    tests: &'a [TestOutcome],
}

pub fn to_json(report: &TestResult) -> Result<String> {
    serde_json::to_string_pretty(&JsonReport {
        passed: report.passed(),
        failed: report.failed(),
        errored: report.errored(),
        tests: &report.outcomes,
    })
    .map_err(|e| DazzleError::Report(e.to_string()))
}

pub fn write_junit(path: &Path, report: &TestResult) -> Result<()> {
    fs::write(path, to_junit_xml(report)?)?;
    Ok(())
}

pub fn write_json(path: &Path, report: &TestResult) -> Result<()> {
    fs::write(path, to_json(report)?)?;
    Ok(())
}
