//! Structured diagnostic markers.
//!
//! Every component surfaces errors/warnings/info as `Marker` records
//! delivered to listeners rather than as thrown exceptions — see
//! §4.2's loader contract and the GLOSSARY entry for `Marker`.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warn => write!(f, "warn"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// Source location of a marker, when one is known (a line/column within
/// a parsed package file).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    pub line: usize,
    pub column: usize,
}

/// A structured diagnostic: `{severity, msg, loc?, type}`.
///
/// `kind` names the error-taxonomy kind from §7 (e.g.
/// `"DataflowMismatch"`, `"UnusedTask"`) so downstream consumers can
/// filter/aggregate without parsing `msg`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub severity: Severity,
    pub msg: String,
    pub loc: Option<Location>,
    pub kind: String,
}

impl Marker {
    pub fn error(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            msg: msg.into(),
            loc: None,
            kind: kind.into(),
        }
    }

    pub fn warn(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warn,
            msg: msg.into(),
            loc: None,
            kind: kind.into(),
        }
    }

    pub fn info(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            msg: msg.into(),
            loc: None,
            kind: kind.into(),
        }
    }

    pub fn with_loc(mut self, loc: Location) -> Self {
        self.loc = Some(loc);
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_marker_is_error() {
        let m = Marker::error("CircularDependency", "cycle: a -> b -> a");
        assert!(m.is_error());
    }

    #[test]
    fn warn_marker_is_not_error() {
        let m = Marker::warn("DataflowMismatch", "no matching consume pattern");
        assert!(!m.is_error());
    }

    #[test]
    fn with_loc_attaches_location() {
        let m = Marker::error("SchemaValidation", "unknown field").with_loc(Location {
            file: "pkg.yaml".into(),
            line: 4,
            column: 3,
        });
        assert_eq!(m.loc.unwrap().line, 4);
    }
}
