//! Parse a build result document into normalized [`Issue`]s.
//!
//! The document is the JSON rendering of an Xcode result bundle. Each
//! diagnostic category lives under `issues.<bag>._values[]`, and every entry
//! carries a message plus a location reference of the form
//! `file:///abs/Foo.swift#CharacterRangeLen=0&StartingLineNumber=12&...`.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::Value;
use url::Url;

use crate::core::types::{Issue, Severity};

/// Categories in artifact order. Issue order follows this list, then the
/// artifact's own order within a bag.
pub const CATEGORIES: [(&str, Severity); 3] = [
    ("errorSummaries", Severity::Error),
    ("warningSummaries", Severity::Warning),
    ("testFailureSummaries", Severity::TestFailure),
];

/// Resolved location reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub path: PathBuf,
    pub line: Option<u32>,
}

/// Parse the result document. Entries without a resolvable file, or whose
/// file does not satisfy `exists`, are skipped.
pub fn parse_issues(
    document: &str,
    root: &Path,
    exists: impl Fn(&Path) -> bool,
) -> Result<Vec<Issue>> {
    let doc: Value = serde_json::from_str(document).context("parse result document")?;
    let mut issues = Vec::new();

    for (bag, severity) in CATEGORIES {
        let Some(entries) = doc
            .pointer(&format!("/issues/{bag}/_values"))
            .and_then(Value::as_array)
        else {
            continue;
        };
        for entry in entries {
            let message = entry
                .pointer("/message/_value")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let Some(reference) = location_reference(entry) else {
                continue;
            };
            let Some(location) = parse_location(reference) else {
                continue;
            };
            if !exists(&location.path) {
                continue;
            }
            issues.push(Issue {
                file_path: relative_to(&location.path, root),
                line: location.line,
                message: message.to_string(),
                severity,
            });
        }
    }

    Ok(issues)
}

/// Resolve a composite location reference into a file path and start line.
pub fn parse_location(reference: &str) -> Option<Location> {
    static LINE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"StartingLineNumber=(\d+)").expect("valid regex"));

    let url = Url::parse(reference).ok()?;
    if url.scheme() != "file" {
        return None;
    }
    let path = url.to_file_path().ok()?;
    let line = url
        .fragment()
        .and_then(|fragment| LINE_RE.captures(fragment))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok());
    Some(Location { path, line })
}

fn location_reference(entry: &Value) -> Option<&str> {
    let location = entry.get("documentLocationInCreatingWorkspace")?;
    location
        .pointer("/_value")
        .or_else(|| location.pointer("/url/_value"))
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

fn relative_to(path: &Path, root: &Path) -> PathBuf {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| path.to_path_buf())
}
