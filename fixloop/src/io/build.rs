//! Build runner: invokes the build/test tool and points at its result artifact.
//!
//! The [`BuildTool`] trait decouples the loop from the actual tool (currently
//! `xcodebuild`). A non-zero exit is ordinary data here; only failing to start
//! the tool is an error. Tests use scripted tools that hand back prepared
//! artifacts without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::io::config::BuildConfig;
use crate::io::process::run_captured;

/// Marker `xcodebuild test` prints when any test failed.
pub const TEST_FAILED_MARKER: &str = "** TEST FAILED **";

/// Location of a structured result artifact written by the build tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef(PathBuf);

impl ArtifactRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub raw_log: String,
    pub artifact: ArtifactRef,
    /// Exit status only; diagnostics come from the artifact.
    pub exit_success: bool,
}

#[derive(Debug, Clone)]
pub struct TestOutcome {
    pub raw_log: String,
    pub artifact: ArtifactRef,
    pub passed: bool,
}

/// Abstraction over build tool backends.
pub trait BuildTool {
    /// Build only.
    fn build(&self) -> Result<BuildOutcome>;
    /// Build and run tests.
    fn test(&self) -> Result<TestOutcome>;
}

/// `xcodebuild` against a fixed project/scheme/destination triple.
#[derive(Debug, Clone)]
pub struct XcodeBuild {
    root: PathBuf,
    config: BuildConfig,
}

impl XcodeBuild {
    pub fn new(root: impl Into<PathBuf>, config: BuildConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    fn artifact_path(&self) -> PathBuf {
        self.root.join(&self.config.result_bundle)
    }

    fn command(&self, actions: &[&str]) -> Command {
        let mut cmd = Command::new(&self.config.tool);
        cmd.arg("-project")
            .arg(&self.config.project)
            .arg("-scheme")
            .arg(&self.config.scheme)
            .arg("-destination")
            .arg(&self.config.destination)
            .arg("-resultBundlePath")
            .arg(self.artifact_path())
            .args(actions)
            .arg("-quiet")
            .current_dir(&self.root);
        cmd
    }

    /// Run one invocation, replacing any previous artifact.
    fn invoke(&self, actions: &[&str]) -> Result<(String, bool)> {
        let artifact = self.artifact_path();
        clear_artifact(&artifact)?;

        info!(tool = %self.config.tool, ?actions, "invoking build tool");
        let output = run_captured(
            self.command(actions),
            None,
            self.config.timeout(),
            self.config.output_limit_bytes,
        )
        .with_context(|| format!("run {}", self.config.tool))?;

        if output.timed_out {
            warn!(tool = %self.config.tool, "build tool timed out");
        }
        Ok((output.combined_log(), output.success()))
    }
}

impl BuildTool for XcodeBuild {
    #[instrument(skip_all)]
    fn build(&self) -> Result<BuildOutcome> {
        let (raw_log, exit_success) = self.invoke(&["clean", "build"])?;
        Ok(BuildOutcome {
            raw_log,
            artifact: ArtifactRef::new(self.artifact_path()),
            exit_success,
        })
    }

    #[instrument(skip_all)]
    fn test(&self) -> Result<TestOutcome> {
        let (raw_log, exit_success) = self.invoke(&["test"])?;
        let passed = tests_passed(exit_success, &raw_log);
        Ok(TestOutcome {
            raw_log,
            artifact: ArtifactRef::new(self.artifact_path()),
            passed,
        })
    }
}

/// Tests pass only on a clean exit without the failure marker in the log.
pub fn tests_passed(exit_success: bool, raw_log: &str) -> bool {
    exit_success && !raw_log.contains(TEST_FAILED_MARKER)
}

fn clear_artifact(path: &Path) -> Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path).with_context(|| format!("remove {}", path.display()))?;
    } else if path.exists() {
        fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_marker_overrides_exit_status() {
        assert!(tests_passed(true, "** TEST SUCCEEDED **"));
        assert!(!tests_passed(true, "...\n** TEST FAILED **\n"));
        assert!(!tests_passed(false, ""));
    }

    #[test]
    fn command_carries_fixed_parameters() {
        let tool = XcodeBuild::new("/proj", BuildConfig::default());
        let cmd = tool.command(&["clean", "build"]);
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(cmd.get_program(), "xcodebuild");
        assert_eq!(
            args,
            vec![
                "-project",
                "PrintMyRide.xcodeproj",
                "-scheme",
                "PrintMyRide",
                "-destination",
                "platform=iOS Simulator,name=iPhone 16 Pro",
                "-resultBundlePath",
                "/proj/build/Build.xcresult",
                "clean",
                "build",
                "-quiet",
            ]
        );
    }

    #[test]
    fn clear_artifact_removes_previous_bundle() {
        let temp = tempfile::tempdir().expect("tempdir");
        let bundle = temp.path().join("build").join("Build.xcresult");
        fs::create_dir_all(bundle.join("Data")).expect("mkdir");
        fs::write(bundle.join("Info.plist"), "old").expect("write");

        clear_artifact(&bundle).expect("clear");
        assert!(!bundle.exists());
        assert!(bundle.parent().expect("parent").is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_is_an_outcome_not_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = BuildConfig {
            tool: "false".to_string(),
            ..BuildConfig::default()
        };
        let outcome = XcodeBuild::new(temp.path(), config).build().expect("build");
        assert!(!outcome.exit_success);
        assert!(outcome.artifact.path().ends_with("build/Build.xcresult"));
    }
}
