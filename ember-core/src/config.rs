#![forbid(unsafe_code)]

use std::fs;
use std::path::Path;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
#[error("configuration error: {message}")]
#[diagnostic(code(ember::config))]
pub struct ConfigError {
    pub message: String,
}

/// Knobs of the semantic core. Read from the `[semantic]` table of a TOML
/// file; a file with only top-level keys is accepted as well.
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SemaConfig {
    /// Warnings make `AnalysisResult::has_errors` true.
    pub deny_warnings: bool,

    /// `var`s that are never reassigned after their initializer are lowered
    /// as SSA temporaries instead of storage.
    pub demote_single_assignment_variables: bool,

    /// Run the reference-count balance verifier over lowered IR.
    pub verify_reference_counts: bool,

    pub max_reported_diagnostics: Option<usize>,
}

impl Default for SemaConfig {
    fn default() -> Self {
        Self {
            deny_warnings: false,
            demote_single_assignment_variables: true,
            verify_reference_counts: true,
            max_reported_diagnostics: None,
        }
    }
}

#[derive(Debug, Default, serde::Deserialize)]
struct ConfigFile {
    #[serde(default)]
    semantic: Option<toml::Value>,

    #[serde(flatten)]
    rest: toml::Table,
}

impl SemaConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let parsed: ConfigFile = toml::from_str(raw).map_err(|e| ConfigError {
            message: format!("failed to parse configuration: {e}"),
        })?;

        let table = match parsed.semantic {
            Some(section) => section,
            None => toml::Value::Table(parsed.rest),
        };
        table.try_into().map_err(|e| ConfigError {
            message: format!("invalid [semantic] section: {e}"),
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|e| ConfigError {
            message: format!("failed to read {}: {e}", path.display()),
        })?;
        Self::from_toml_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        assert_eq!(SemaConfig::from_toml_str("").unwrap(), SemaConfig::default());
    }

    #[test]
    fn semantic_table_is_read() {
        let cfg = SemaConfig::from_toml_str(
            "[semantic]\ndeny_warnings = true\nmax_reported_diagnostics = 20\n",
        )
        .unwrap();
        assert!(cfg.deny_warnings);
        assert!(cfg.demote_single_assignment_variables);
        assert_eq!(cfg.max_reported_diagnostics, Some(20));
    }

    #[test]
    fn top_level_keys_are_accepted() {
        let cfg = SemaConfig::from_toml_str("verify_reference_counts = false\n").unwrap();
        assert!(!cfg.verify_reference_counts);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = SemaConfig::from_toml_str("[semantic]\nwhatever = 1\n").unwrap_err();
        assert!(err.message.contains("invalid [semantic] section"));
    }
}
