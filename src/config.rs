//! Run-level analysis options.
//!
//! Options are plain serde data so a host can keep them in a JSON file next
//! to the binary it analyses.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::arch::Abi;
use crate::format::OutputFormat;
use crate::strategy::{BodyOptions, BoundaryStrategy, DEFAULT_MAX_BODY_SIZE};
use crate::ReclaimError;

/// Options shared by every method analysed in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisOptions {
    /// How to find the end of a body with no known length
    pub boundary: BoundaryStrategy,
    /// Cap on a heuristically sized body, in bytes
    pub max_body_size: u64,
    /// x86-64 calling convention the binary was built for
    pub abi: Abi,
    /// Synthesize bytecode, not just pseudocode
    pub emit_bytecode: bool,
    /// Analyse methods on the rayon pool
    pub parallel: bool,
    /// Report format a host should print with
    pub output: OutputFormat,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            boundary: BoundaryStrategy::default(),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            abi: Abi::default(),
            emit_bytecode: true,
            parallel: true,
            output: OutputFormat::Text,
        }
    }
}

impl AnalysisOptions {
    /// Parse and validate options from JSON text. Missing keys keep their
    /// defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ReclaimError> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ReclaimError> {
        let path = path.as_ref();
        log::debug!("Loading analysis options from {}", path.display());
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ReclaimError> {
        if self.max_body_size == 0 {
            return Err(ReclaimError::Config(
                "max_body_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Body decoding options derived from these settings.
    pub fn body_options(&self) -> BodyOptions {
        BodyOptions {
            strategy: self.boundary,
            max_body_size: self.max_body_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let options = AnalysisOptions::default();
        assert_eq!(options.boundary, BoundaryStrategy::Linear);
        assert_eq!(options.abi, Abi::Microsoft);
        assert!(options.emit_bytecode);
        assert_eq!(options.body_options().max_body_size, DEFAULT_MAX_BODY_SIZE);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let options =
            AnalysisOptions::from_json_str(r#"{ "abi": "SystemV", "boundary": "Recursive" }"#)
                .unwrap();
        assert_eq!(options.abi, Abi::SystemV);
        assert_eq!(options.boundary, BoundaryStrategy::Recursive);
        assert!(options.parallel);
    }

    #[test]
    fn test_rejects_bad_options() {
        assert!(matches!(
            AnalysisOptions::from_json_str(r#"{ "max_body_size": 0 }"#),
            Err(ReclaimError::Config(_))
        ));
        assert!(matches!(
            AnalysisOptions::from_json_str(r#"{ "unknown": 1 }"#),
            Err(ReclaimError::Json(_))
        ));
    }

    #[test]
    fn test_from_path() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{ "emit_bytecode": false, "max_body_size": 4096 }}"#).unwrap();

        let options = AnalysisOptions::from_path(file.path()).unwrap();
        assert!(!options.emit_bytecode);
        assert_eq!(options.max_body_size, 4096);

        assert!(matches!(
            AnalysisOptions::from_path(file.path().with_extension("missing")),
            Err(ReclaimError::Io(_))
        ));
    }
}
