//! Diagnostics extraction from a build result artifact.
//!
//! Extraction never fails the loop: an unreadable or malformed artifact yields
//! no issues, which the controller treats as a clean build. That can mask a
//! broken artifact, so every fallback is logged at `warn`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::diagnostics::parse_issues;
use crate::core::types::Issue;
use crate::io::build::ArtifactRef;
use crate::io::config::DiagnosticsConfig;
use crate::io::process::run_captured;

const QUERY_OUTPUT_LIMIT_BYTES: usize = 64 * 1024 * 1024;

/// Turns a result artifact into its JSON document.
pub trait ResultReader {
    fn read(&self, artifact: &ArtifactRef) -> Result<String>;
}

/// Queries an Xcode result bundle through an external command
/// (`xcrun xcresulttool get --format json --path <bundle>` by default).
#[derive(Debug, Clone)]
pub struct XcresultReader {
    command: Vec<String>,
    timeout: Duration,
}

impl XcresultReader {
    pub fn new(config: &DiagnosticsConfig) -> Self {
        Self {
            command: config.query_command.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

impl ResultReader for XcresultReader {
    #[instrument(skip_all, fields(artifact = %artifact.path().display()))]
    fn read(&self, artifact: &ArtifactRef) -> Result<String> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("empty diagnostics query command"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).arg(artifact.path());

        let output = run_captured(cmd, None, Some(self.timeout), QUERY_OUTPUT_LIMIT_BYTES)
            .context("query result artifact")?;
        if output.timed_out {
            return Err(anyhow!(
                "result query timed out after {}s",
                self.timeout.as_secs()
            ));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "result query failed with status {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        if output.truncated > 0 {
            return Err(anyhow!("result document exceeded {QUERY_OUTPUT_LIMIT_BYTES} bytes"));
        }
        Ok(output.stdout_lossy())
    }
}

/// Reads an artifact that already is a JSON document.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFileReader;

impl ResultReader for JsonFileReader {
    fn read(&self, artifact: &ArtifactRef) -> Result<String> {
        fs::read_to_string(artifact.path())
            .with_context(|| format!("read {}", artifact.path().display()))
    }
}

/// Extract issues for `artifact`, resolving files against `root`.
///
/// Returns an empty list when the artifact is missing or malformed.
#[instrument(skip_all, fields(artifact = %artifact.path().display()))]
pub fn extract<R: ResultReader + ?Sized>(
    reader: &R,
    artifact: &ArtifactRef,
    root: &Path,
) -> Vec<Issue> {
    let document = match reader.read(artifact) {
        Ok(document) => document,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "result artifact unreadable, assuming no diagnostics");
            return Vec::new();
        }
    };

    let root = canonical_root(root);
    match parse_issues(&document, &root, Path::exists) {
        Ok(issues) => {
            debug!(count = issues.len(), "extracted issues");
            issues
        }
        Err(err) => {
            warn!(err = %format!("{err:#}"), "result artifact malformed, assuming no diagnostics");
            Vec::new()
        }
    }
}

/// Build tools report canonical paths (e.g. `/private/var/...` on macOS), so
/// compare against the canonical root when it resolves.
fn canonical_root(root: &Path) -> PathBuf {
    root.canonicalize().unwrap_or_else(|_| root.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Severity;
    use serde_json::json;

    struct FailingReader;

    impl ResultReader for FailingReader {
        fn read(&self, _artifact: &ArtifactRef) -> Result<String> {
            Err(anyhow!("xcresulttool not installed"))
        }
    }

    #[test]
    fn missing_artifact_yields_no_issues() {
        let temp = tempfile::tempdir().expect("tempdir");
        let artifact = ArtifactRef::new(temp.path().join("missing.json"));
        assert!(extract(&JsonFileReader, &artifact, temp.path()).is_empty());
    }

    #[test]
    fn reader_failure_yields_no_issues() {
        let temp = tempfile::tempdir().expect("tempdir");
        let artifact = ArtifactRef::new(temp.path().join("Build.xcresult"));
        assert!(extract(&FailingReader, &artifact, temp.path()).is_empty());
    }

    #[test]
    fn malformed_artifact_yields_no_issues() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("result.json");
        fs::write(&path, "{ truncated").expect("write");
        assert!(extract(&JsonFileReader, &ArtifactRef::new(path), temp.path()).is_empty());
    }

    #[test]
    fn resolves_existing_files_relative_to_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().canonicalize().expect("canonical");
        let source = root.join("App").join("A.swift");
        fs::create_dir_all(source.parent().expect("parent")).expect("mkdir");
        fs::write(&source, "let a = 1\n").expect("write source");

        let location = format!("file://{}#StartingLineNumber=1", source.display());
        let missing = format!("file://{}#StartingLineNumber=1", root.join("Gone.swift").display());
        let doc = json!({
            "issues": { "errorSummaries": { "_values": [
                { "message": { "_value": "boom" },
                  "documentLocationInCreatingWorkspace": { "_value": location } },
                { "message": { "_value": "gone" },
                  "documentLocationInCreatingWorkspace": { "_value": missing } },
            ]}}
        });
        let artifact_path = root.join("result.json");
        fs::write(&artifact_path, doc.to_string()).expect("write artifact");

        let issues = extract(&JsonFileReader, &ArtifactRef::new(artifact_path), temp.path());
        assert_eq!(
            issues,
            vec![Issue {
                file_path: PathBuf::from("App/A.swift"),
                line: Some(1),
                message: "boom".to_string(),
                severity: Severity::Error,
            }]
        );
    }

    #[cfg(unix)]
    #[test]
    fn query_command_receives_artifact_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let doc_path = temp.path().join("doc.json");
        fs::write(&doc_path, "{\"issues\":{}}").expect("write");
        let reader = XcresultReader::new(&DiagnosticsConfig {
            query_command: vec!["cat".to_string()],
            timeout_secs: 5,
        });
        let document = reader.read(&ArtifactRef::new(&doc_path)).expect("read");
        assert_eq!(document, "{\"issues\":{}}");
    }
}
