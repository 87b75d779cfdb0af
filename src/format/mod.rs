//! Output formats for method reports

mod json;

use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::analysis::MethodReport;
use crate::ReclaimError;

/// Supported output formats for analysis reports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum OutputFormat {
    /// Plain text output (default)
    #[default]
    Text,
    /// JSON format (one document for the whole run)
    Json,
    /// JSON Lines format (one JSON object per method)
    JsonLines,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::JsonLines => write!(f, "jsonl"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "jsonl" | "jsonlines" => Ok(OutputFormat::JsonLines),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl OutputFormat {
    /// Get all available output formats
    pub fn available_formats() -> &'static [Self] {
        &[OutputFormat::Text, OutputFormat::Json, OutputFormat::JsonLines]
    }

    /// Get a formatter for this output format
    pub fn formatter(&self) -> Box<dyn ReportFormatter> {
        match self {
            OutputFormat::Text => Box::new(TextFormatter),
            OutputFormat::Json => Box::new(JsonFormatter),
            OutputFormat::JsonLines => Box::new(JsonLinesFormatter),
        }
    }
}

/// Formatter trait for method reports
pub trait ReportFormatter {
    /// Render the reports of one run
    fn format(&self, reports: &[MethodReport]) -> Result<String, ReclaimError>;
}

/// Format reports as plain text
pub struct TextFormatter;

/// Format reports as one JSON document
pub struct JsonFormatter;

/// Format reports as JSON Lines
pub struct JsonLinesFormatter;

impl ReportFormatter for TextFormatter {
    fn format(&self, reports: &[MethodReport]) -> Result<String, ReclaimError> {
        let mut output = String::new();

        for report in reports {
            output.push_str(&format!(
                "0x{:08x}: {} [{}]\n",
                report.address, report.method, report.state
            ));
            match report.block_count {
                Some(blocks) => output.push_str(&format!(
                    "  {} instructions in {} blocks\n",
                    report.instruction_count, blocks
                )),
                None => output.push_str(&format!(
                    "  {} instructions, no control flow graph\n",
                    report.instruction_count
                )),
            }

            for diagnostic in &report.diagnostics {
                output.push_str(&format!("  ! {}\n", diagnostic));
            }

            if !report.pseudocode.is_empty() {
                output.push_str("  Pseudocode:\n");
                for line in report.pseudocode.lines() {
                    output.push_str(&format!("  {}\n", line));
                }
            }

            match &report.bytecode {
                Some(Ok(bytecode)) => {
                    output.push_str("  Bytecode:\n");
                    for instruction in bytecode {
                        output.push_str(&format!("      {}\n", instruction));
                    }
                }
                Some(Err(e)) => output.push_str(&format!("  No bytecode: {}\n", e)),
                None => {}
            }

            output.push('\n');
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AnalysisState, CilInstruction, Diagnostic, TaintReason, TaintedAction};
    use rstest::rstest;

    pub(super) fn reports() -> Vec<MethodReport> {
        vec![
            MethodReport {
                address: 0x1000,
                method: "static System.Int32 Game.Math::Twice(System.Int32 a)".to_string(),
                state: AnalysisState::Emittable,
                instruction_count: 3,
                block_count: Some(1),
                actions: vec!["Adds a and a".to_string()],
                pseudocode: "    System.Int32 local0 = a + a\n    return local0\n".to_string(),
                bytecode: Some(Ok(vec![
                    CilInstruction::Ldarg(0),
                    CilInstruction::Ldarg(0),
                    CilInstruction::Add,
                    CilInstruction::Stloc(0),
                    CilInstruction::Ldloc(0),
                    CilInstruction::Ret,
                ])),
                diagnostics: Vec::new(),
            },
            MethodReport {
                address: 0x2000,
                method: "System.Void Game.Player::Tick()".to_string(),
                state: AnalysisState::Tainted,
                instruction_count: 2,
                block_count: None,
                actions: vec!["Calls sub_3000 @ 0x3000".to_string()],
                pseudocode: "    sub_3000(this) // tainted: call to unresolved function 0x3000\n"
                    .to_string(),
                bytecode: Some(Err(TaintedAction {
                    address: 0x2000,
                    reason: TaintReason::UnresolvedCall(0x3000),
                }
                .into())),
                diagnostics: vec![Diagnostic::GraphUnavailable],
            },
        ]
    }

    #[test]
    fn test_text_formatter() {
        let result = TextFormatter.format(&reports()).unwrap();

        assert!(result.contains("0x00001000: static System.Int32 Game.Math::Twice(System.Int32 a) [Emittable]"));
        assert!(result.contains("3 instructions in 1 blocks"));
        assert!(result.contains("      System.Int32 local0 = a + a"));
        assert!(result.contains("      ldarg 0"));
        assert!(result.contains("  ! control flow graph unavailable"));
        assert!(result.contains("No bytecode: Tainted action at 0x2000"));
    }

    #[rstest]
    #[case("text", OutputFormat::Text)]
    #[case("JSON", OutputFormat::Json)]
    #[case("jsonlines", OutputFormat::JsonLines)]
    #[case("jsonl", OutputFormat::JsonLines)]
    fn test_parse_format(#[case] text: &str, #[case] expected: OutputFormat) {
        assert_eq!(text.parse::<OutputFormat>(), Ok(expected));
    }

    #[test]
    fn test_format_selection() {
        assert!("csv".parse::<OutputFormat>().is_err());
        for format in OutputFormat::available_formats() {
            assert!(format.formatter().format(&[]).is_ok());
        }
    }
}
