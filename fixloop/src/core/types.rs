//! Shared deterministic types for the repair loop.
//!
//! These types are the contracts passed between the loop components. They
//! hold no I/O handles and serialize to stable JSON for iteration logs and
//! oracle requests.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Diagnostic category, in the order the result artifact reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    TestFailure,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::TestFailure => "test_failure",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One normalized diagnostic with a resolved file location.
///
/// Issues are produced fresh every iteration and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Issue {
    /// File path, relative to the project root when the file lives under it.
    pub file_path: PathBuf,
    /// 1-based line reported by the build tool, if any.
    pub line: Option<u32>,
    pub message: String,
    pub severity: Severity,
}

/// Read-only source window handed to the patch oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileContext {
    pub file_path: PathBuf,
    /// Line-numbered snippet around the first issue seen for this file.
    pub snippet: String,
}

/// Controller-owned bookkeeping for the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct IterationState {
    /// Current iteration (1-indexed once the loop has started).
    pub iteration: u32,
    pub last_build_succeeded: bool,
    pub last_tests_succeeded: bool,
}

impl IterationState {
    /// Both the build and the tests are green.
    pub fn is_green(&self) -> bool {
        self.last_build_succeeded && self.last_tests_succeeded
    }

    /// Move to the next iteration, clearing per-iteration results.
    pub fn advance(&mut self) {
        self.iteration += 1;
        self.last_build_succeeded = false;
        self.last_tests_succeeded = false;
    }
}
