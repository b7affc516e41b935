//! Scripted fakes and fixtures for loop tests.
//!
//! Enabled for unit tests and, through the `test-support` feature, for the
//! integration tests under `tests/`.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{Result, anyhow, bail};
use serde_json::json;
use tempfile::TempDir;

use crate::io::build::{ArtifactRef, BuildOutcome, BuildTool, TestOutcome};
use crate::io::git::{Git, StatusEntry};
use crate::io::oracle::{OracleRequest, PatchOracle};

const EMPTY_DOCUMENT: &str = "{\"issues\":{}}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunKind {
    Build,
    Test,
}

/// One scripted build or test invocation.
#[derive(Debug, Clone)]
pub struct ScriptedRun {
    kind: RunKind,
    success: bool,
    document: String,
    log: String,
}

impl ScriptedRun {
    pub fn clean_build() -> Self {
        Self {
            kind: RunKind::Build,
            success: true,
            document: EMPTY_DOCUMENT.to_string(),
            log: "** BUILD SUCCEEDED **\n".to_string(),
        }
    }

    /// Failed build whose result artifact is `document`.
    pub fn failed_build(document: String) -> Self {
        Self {
            kind: RunKind::Build,
            success: false,
            document,
            log: "** BUILD FAILED **\n".to_string(),
        }
    }

    pub fn tests(passed: bool) -> Self {
        let log = if passed {
            "** TEST SUCCEEDED **\n"
        } else {
            "** TEST FAILED **\n"
        };
        Self {
            kind: RunKind::Test,
            success: passed,
            document: EMPTY_DOCUMENT.to_string(),
            log: log.to_string(),
        }
    }

    /// Failed test run whose result artifact is `document`.
    pub fn failed_tests(document: String) -> Self {
        Self {
            document,
            ..Self::tests(false)
        }
    }
}

/// Build tool that replays a script and writes each artifact as a JSON file.
///
/// Pair with [`crate::io::diagnostics::JsonFileReader`].
pub struct ScriptedBuildTool {
    runs: RefCell<VecDeque<ScriptedRun>>,
    count: Cell<usize>,
    artifacts: TempDir,
}

impl ScriptedBuildTool {
    pub fn new(runs: Vec<ScriptedRun>) -> Self {
        Self {
            runs: RefCell::new(runs.into()),
            count: Cell::new(0),
            artifacts: tempfile::tempdir().expect("artifact tempdir"),
        }
    }

    /// Invocations so far.
    pub fn runs(&self) -> usize {
        self.count.get()
    }

    fn next(&self, kind: RunKind) -> Result<(ScriptedRun, ArtifactRef)> {
        let run = self
            .runs
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("build script exhausted ({kind:?} requested)"))?;
        if run.kind != kind {
            bail!("build script expected {:?}, got {kind:?}", run.kind);
        }
        let n = self.count.get() + 1;
        self.count.set(n);
        let path = self.artifacts.path().join(format!("result-{n}.json"));
        fs::write(&path, &run.document)?;
        Ok((run, ArtifactRef::new(path)))
    }
}

impl BuildTool for ScriptedBuildTool {
    fn build(&self) -> Result<BuildOutcome> {
        let (run, artifact) = self.next(RunKind::Build)?;
        Ok(BuildOutcome {
            raw_log: run.log,
            artifact,
            exit_success: run.success,
        })
    }

    fn test(&self) -> Result<TestOutcome> {
        let (run, artifact) = self.next(RunKind::Test)?;
        Ok(TestOutcome {
            raw_log: run.log,
            artifact,
            passed: run.success,
        })
    }
}

/// Oracle that replays canned responses; `Err` entries simulate transport
/// failures.
pub struct ScriptedOracle {
    responses: RefCell<VecDeque<Result<String, String>>>,
    requests: RefCell<Vec<OracleRequest>>,
}

impl ScriptedOracle {
    pub fn new(responses: Vec<Result<String, String>>) -> Self {
        Self {
            responses: RefCell::new(responses.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.borrow().len()
    }

    pub fn requests(&self) -> Vec<OracleRequest> {
        self.requests.borrow().clone()
    }
}

impl PatchOracle for ScriptedOracle {
    fn generate(&self, request: &OracleRequest) -> Result<String> {
        self.requests.borrow_mut().push(request.clone());
        match self.responses.borrow_mut().pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(err)) => Err(anyhow!(err)),
            None => Err(anyhow!("oracle script exhausted")),
        }
    }
}

/// `file://` reference for `rel` under `root`, as a build tool reports it.
pub fn location(root: &Path, rel: &str, line: u32) -> String {
    let abs = root.canonicalize().expect("canonical root").join(rel);
    let url = url::Url::from_file_path(&abs).expect("absolute path");
    format!("{url}#EndingLineNumber={line}&StartingLineNumber={line}")
}

/// Result document with a single compiler error.
pub fn error_artifact(root: &Path, rel: &str, line: u32, message: &str) -> String {
    summary_artifact("errorSummaries", root, rel, line, message)
}

/// Result document with a single failing test.
pub fn test_failure_artifact(root: &Path, rel: &str, line: u32, message: &str) -> String {
    summary_artifact("testFailureSummaries", root, rel, line, message)
}

fn summary_artifact(bag: &str, root: &Path, rel: &str, line: u32, message: &str) -> String {
    json!({
        "issues": {
            bag: { "_values": [{
                "message": { "_value": message },
                "documentLocationInCreatingWorkspace": {
                    "url": { "_value": location(root, rel, line) }
                }
            }]}
        }
    })
    .to_string()
}

/// Temporary git repository with a committer identity configured.
pub struct TestRepo {
    temp: TempDir,
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

impl TestRepo {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = Self { temp };
        repo.git(&["init", "-q", "-b", "main"]);
        repo.git(&["config", "user.name", "fixloop tests"]);
        repo.git(&["config", "user.email", "fixloop@example.invalid"]);
        repo.git(&["config", "commit.gpgsign", "false"]);
        repo
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, contents).expect("write file");
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.path().join(rel)).expect("read file")
    }

    pub fn commit_all(&self, message: &str) {
        self.git(&["add", "-A"]);
        self.git(&["commit", "-q", "-m", message]);
    }

    pub fn head(&self) -> String {
        Git::new(self.path()).head_sha().expect("head sha")
    }

    pub fn branch(&self) -> String {
        self.git(&["rev-parse", "--abbrev-ref", "HEAD"]).trim().to_string()
    }

    pub fn commit_count(&self) -> usize {
        self.git(&["rev-list", "--count", "HEAD"])
            .trim()
            .parse()
            .expect("commit count")
    }

    pub fn last_commit_message(&self) -> String {
        self.git(&["log", "-1", "--format=%s"]).trim().to_string()
    }

    /// Paths changed by the HEAD commit.
    pub fn files_in_head_commit(&self) -> Vec<String> {
        self.git(&["show", "--name-only", "--format=", "HEAD"])
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn status(&self) -> Vec<StatusEntry> {
        Git::new(self.path()).status_porcelain().expect("git status")
    }

    fn git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .expect("spawn git");
        assert!(
            output.status.success(),
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).into_owned()
    }
}
