//! JSON and JSON Lines output formatters

use serde::Serialize;
use serde_json::json;

use super::ReportFormatter;
use crate::analysis::{AnalysisState, MethodReport};
use crate::ReclaimError;

/// Serializable method report for JSON output
#[derive(Serialize)]
struct ReportJson<'a> {
    /// Entry address of the method
    address: String,
    /// Managed signature
    method: &'a str,
    state: AnalysisState,
    instruction_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    block_count: Option<usize>,
    /// Action summaries, bookkeeping included
    actions: &'a [String],
    /// Pseudocode, one entry per line
    pseudocode: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bytecode: Option<Vec<String>>,
    /// Why bytecode is missing, when it was requested
    #[serde(skip_serializing_if = "Option::is_none")]
    bytecode_error: Option<String>,
    diagnostics: Vec<String>,
}

/// Counts for the whole run
#[derive(Serialize)]
struct SummaryJson {
    methods: usize,
    emittable: usize,
    tainted: usize,
}

/// Serializable run for JSON output
#[derive(Serialize)]
struct RunJson<'a> {
    summary: SummaryJson,
    methods: Vec<ReportJson<'a>>,
}

impl ReportFormatter for super::JsonFormatter {
    fn format(&self, reports: &[MethodReport]) -> Result<String, ReclaimError> {
        let tainted = reports.iter().filter(|r| r.is_tainted()).count();
        let emittable = reports
            .iter()
            .filter(|r| r.state == AnalysisState::Emittable)
            .count();

        let run = RunJson {
            summary: SummaryJson {
                methods: reports.len(),
                emittable,
                tainted,
            },
            methods: reports.iter().map(report_to_json).collect(),
        };

        Ok(serde_json::to_string_pretty(&run)?)
    }
}

impl ReportFormatter for super::JsonLinesFormatter {
    fn format(&self, reports: &[MethodReport]) -> Result<String, ReclaimError> {
        let mut output = String::new();

        for report in reports {
            let mut line = serde_json::to_value(report_to_json(report))?;
            if let Some(object) = line.as_object_mut() {
                object.insert("type".to_string(), json!("method"));
            }
            output.push_str(&serde_json::to_string(&line)?);
            output.push('\n');
        }

        Ok(output)
    }
}

/// Convert a report to its JSON mirror
fn report_to_json(report: &MethodReport) -> ReportJson<'_> {
    let (bytecode, bytecode_error) = match &report.bytecode {
        Some(Ok(instructions)) => (
            Some(instructions.iter().map(ToString::to_string).collect()),
            None,
        ),
        Some(Err(e)) => (None, Some(e.to_string())),
        None => (None, None),
    };

    ReportJson {
        address: format!("0x{:x}", report.address),
        method: &report.method,
        state: report.state,
        instruction_count: report.instruction_count,
        block_count: report.block_count,
        actions: &report.actions,
        pseudocode: report.pseudocode.lines().map(str::trim_start).collect(),
        bytecode,
        bytecode_error,
        diagnostics: report.diagnostics.iter().map(ToString::to_string).collect(),
    }
}
