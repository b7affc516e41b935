//! Iteration controller for `fixloop run`.
//!
//! The only module with loop logic. Each iteration runs the build, extracts
//! diagnostics and either asks the oracle for a patch or runs the tests:
//!
//! ```text
//! Building -> Diagnosing -> Fixing  -> Building
//!                        \-> Testing -> Done
//!                                    \-> Fixing | Building   (tests failed)
//! ```
//!
//! The loop stops on success, on the first rejected or unappliable patch, on
//! oracle failure, on the iteration ceiling, when the same issue set keeps
//! coming back, or when the [`StopSignal`] is raised. Infrastructure failures
//! (build tool cannot start, logs cannot be written) are returned as errors.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::patch::{Verdict, validate};
use crate::core::policy::{EditPolicy, PathAccess, normalize_relative};
use crate::core::progress::ProgressTracker;
use crate::core::types::{Issue, IterationState};
use crate::io::applier::GitApplier;
use crate::io::build::{ArtifactRef, BuildTool};
use crate::io::config::FixConfig;
use crate::io::context::assemble;
use crate::io::diagnostics::{ResultReader, extract};
use crate::io::git::Git;
use crate::io::iteration_log::{IterationLog, IterationMeta};
use crate::io::oracle::{PatchOracle, request_patch};
use crate::io::prompt::{PatchRequest, PromptEngine};
use crate::stop::StopSignal;

/// Oracle transport attempts per patch request.
const ORACLE_ATTEMPTS: u32 = 2;

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// Build is clean and tests pass.
    Success,
    /// The oracle proposed a patch the edit policy refuses.
    PatchRejected { reason: String },
    /// An approved patch could not be applied (tree unchanged).
    ApplyFailed { error: String },
    /// The oracle could not be reached after retrying.
    OracleFailed { error: String },
    MaxIterations { limit: u32 },
    /// The same issue set was seen `repeats` times in a row.
    NoProgress { repeats: u32 },
    Interrupted,
}

impl fmt::Display for LoopStop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopStop::Success => f.write_str("build and tests pass"),
            LoopStop::PatchRejected { reason } => write!(f, "patch rejected: {reason}"),
            LoopStop::ApplyFailed { error } => write!(f, "apply failed: {error}"),
            LoopStop::OracleFailed { error } => write!(f, "oracle failed: {error}"),
            LoopStop::MaxIterations { limit } => {
                write!(f, "reached the iteration limit ({limit})")
            }
            LoopStop::NoProgress { repeats } => {
                write!(f, "no progress: same issues seen {repeats} times in a row")
            }
            LoopStop::Interrupted => f.write_str("interrupted"),
        }
    }
}

impl LoopStop {
    /// Short label used in iteration metadata.
    pub fn label(&self) -> &'static str {
        match self {
            LoopStop::Success => "success",
            LoopStop::PatchRejected { .. } => "patch_rejected",
            LoopStop::ApplyFailed { .. } => "apply_failed",
            LoopStop::OracleFailed { .. } => "oracle_failed",
            LoopStop::MaxIterations { .. } => "max_iterations",
            LoopStop::NoProgress { .. } => "no_progress",
            LoopStop::Interrupted => "interrupted",
        }
    }
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    /// Iterations started.
    pub iterations: u32,
    pub stop: LoopStop,
    /// Raw text of the most recent oracle response.
    pub last_patch: Option<String>,
    pub state: IterationState,
}

/// Progress notifications for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopEvent {
    IterationStarted {
        iteration: u32,
    },
    BuildFinished {
        iteration: u32,
        exit_success: bool,
    },
    IssuesFound {
        iteration: u32,
        count: usize,
        from_tests: bool,
    },
    OracleRetry {
        iteration: u32,
        error: String,
    },
    PatchApplied {
        iteration: u32,
        paths: Vec<PathBuf>,
        commit: Option<String>,
    },
    TestsFinished {
        iteration: u32,
        passed: bool,
    },
}

/// Shared, read-only inputs of a run.
#[derive(Debug, Clone, Copy)]
pub struct LoopContext<'a> {
    pub root: &'a Path,
    pub config: &'a FixConfig,
    pub policy: &'a EditPolicy,
    pub stop: &'a StopSignal,
}

enum Step {
    Building,
    Diagnosing(ArtifactRef),
    Fixing(Vec<Issue>),
    Testing,
}

/// Run the fix loop until it succeeds or cannot proceed safely.
#[instrument(skip_all, fields(root = %ctx.root.display(), max_iterations = ctx.config.run.max_iterations))]
pub fn run_loop<B, R, O, F>(
    ctx: &LoopContext<'_>,
    build_tool: &B,
    reader: &R,
    oracle: &O,
    on_event: F,
) -> Result<LoopOutcome>
where
    B: BuildTool + ?Sized,
    R: ResultReader + ?Sized,
    O: PatchOracle + ?Sized,
    F: FnMut(&LoopEvent),
{
    let log = IterationLog::create(ctx.root, &ctx.config.run.log_dir)?;
    let checkpoint = ctx.config.run.checkpoint && prepare_branch(ctx);
    let mut runner = Runner {
        ctx,
        build_tool,
        reader,
        oracle,
        on_event,
        log,
        applier: GitApplier::new(ctx.root, checkpoint),
        engine: PromptEngine::new(ctx.config.oracle.prompt_budget_bytes)?,
        tracker: ProgressTracker::new(ctx.config.run.no_progress_limit),
        state: IterationState::default(),
        meta: None,
        last_patch: None,
    };
    runner.run()
}

/// Check out the working branch. Returns whether checkpoints can be made.
fn prepare_branch(ctx: &LoopContext<'_>) -> bool {
    let git = Git::new(ctx.root);
    if !git.is_repository() {
        info!("not a git repository, patches will not be committed");
        return false;
    }
    let branch = &ctx.config.run.branch;
    if let Err(err) = git.checkout_reset_branch(branch) {
        warn!(branch = %branch, err = %format!("{err:#}"), "branch checkout failed, continuing without checkpoints");
        return false;
    }
    let dirty = dirty_allowed_paths(&git, ctx.policy);
    if !dirty.is_empty() {
        warn!(count = dirty.len(), paths = ?dirty, "editable files have uncommitted changes; a checkpoint touching them will include them");
    }
    info!(branch = %branch, "working branch checked out");
    true
}

/// Uncommitted paths (relative to the project root) the oracle may edit.
fn dirty_allowed_paths(git: &Git, policy: &EditPolicy) -> Vec<String> {
    let entries = match git.status_porcelain() {
        Ok(entries) => entries,
        Err(err) => {
            debug!(err = %format!("{err:#}"), "git status unavailable");
            return Vec::new();
        }
    };
    // Porcelain paths are relative to the top of the work tree.
    let prefix = git.show_prefix();
    entries
        .into_iter()
        .filter_map(|entry| {
            let rel = entry.path.strip_prefix(prefix.as_str())?;
            let path = normalize_relative(rel)?;
            (policy.classify(&path) == PathAccess::Allowed).then(|| rel.to_string())
        })
        .collect()
}

struct Runner<'a, B: ?Sized, R: ?Sized, O: ?Sized, F> {
    ctx: &'a LoopContext<'a>,
    build_tool: &'a B,
    reader: &'a R,
    oracle: &'a O,
    on_event: F,
    log: IterationLog,
    applier: GitApplier,
    engine: PromptEngine,
    tracker: ProgressTracker,
    state: IterationState,
    meta: Option<IterationMeta>,
    last_patch: Option<String>,
}

impl<B, R, O, F> Runner<'_, B, R, O, F>
where
    B: BuildTool + ?Sized,
    R: ResultReader + ?Sized,
    O: PatchOracle + ?Sized,
    F: FnMut(&LoopEvent),
{
    fn run(&mut self) -> Result<LoopOutcome> {
        let mut step = Step::Building;
        loop {
            if self.ctx.stop.is_raised() {
                return self.finish(LoopStop::Interrupted);
            }
            let next = match step {
                Step::Building => self.build()?,
                Step::Diagnosing(artifact) => self.diagnose(&artifact)?,
                Step::Fixing(issues) => self.fix(&issues)?,
                Step::Testing => self.test()?,
            };
            step = match next {
                Ok(step) => step,
                Err(stop) => return self.finish(stop),
            };
        }
    }

    fn build(&mut self) -> Result<Result<Step, LoopStop>> {
        let limit = self.ctx.config.run.max_iterations;
        if self.state.iteration >= limit {
            return Ok(Err(LoopStop::MaxIterations { limit }));
        }
        self.close_iteration(None)?;
        self.state.advance();
        let iteration = self.state.iteration;
        self.meta = Some(IterationMeta {
            iteration,
            build_succeeded: None,
            tests_passed: None,
            issue_count: 0,
            outcome: String::new(),
        });
        info!(iteration, "iteration started");
        (self.on_event)(&LoopEvent::IterationStarted { iteration });

        let outcome = self.build_tool.build().context("run build")?;
        self.state.last_build_succeeded = outcome.exit_success;
        self.log.write_build_log(iteration, &outcome.raw_log)?;
        if let Some(meta) = &mut self.meta {
            meta.build_succeeded = Some(outcome.exit_success);
        }
        (self.on_event)(&LoopEvent::BuildFinished {
            iteration,
            exit_success: outcome.exit_success,
        });
        Ok(Ok(Step::Diagnosing(outcome.artifact)))
    }

    fn diagnose(&mut self, artifact: &ArtifactRef) -> Result<Result<Step, LoopStop>> {
        let issues = extract(self.reader, artifact, self.ctx.root);
        self.record_issues(&issues, false)?;
        if issues.is_empty() {
            if !self.state.last_build_succeeded {
                warn!("build failed but the result artifact reports no issues, treating as built");
                self.state.last_build_succeeded = true;
            }
            return Ok(Ok(Step::Testing));
        }
        if let Some(stop) = self.check_progress(&issues) {
            return Ok(Err(stop));
        }
        Ok(Ok(Step::Fixing(issues)))
    }

    fn fix(&mut self, issues: &[Issue]) -> Result<Result<Step, LoopStop>> {
        let iteration = self.state.iteration;
        let config = self.ctx.config;
        let contexts = assemble(self.ctx.root, issues, config.context.window_lines);
        let request = PatchRequest {
            issues,
            contexts: &contexts,
            policy: self.ctx.policy,
            invariants: &config.policy.invariants,
        };

        let response = match self.ask_oracle(&request) {
            Ok(response) => response,
            Err(error) => return Ok(Err(LoopStop::OracleFailed { error })),
        };
        self.log.write_patch(iteration, &response)?;
        self.last_patch = Some(response.clone());

        let patch = match validate(&response, self.ctx.policy) {
            Verdict::Approved(patch) => patch,
            Verdict::Rejected(rejection) => {
                warn!(reason = %rejection, "patch rejected");
                return Ok(Err(LoopStop::PatchRejected {
                    reason: rejection.to_string(),
                }));
            }
        };
        if self.ctx.stop.is_raised() {
            return Ok(Err(LoopStop::Interrupted));
        }

        match self.applier.apply(&patch, iteration) {
            Ok(applied) => {
                self.set_outcome("patch_applied");
                (self.on_event)(&LoopEvent::PatchApplied {
                    iteration,
                    paths: applied.touched,
                    commit: applied.commit,
                });
                Ok(Ok(Step::Building))
            }
            Err(err) => {
                warn!(err = %err, "patch application failed");
                Ok(Err(LoopStop::ApplyFailed {
                    error: err.to_string(),
                }))
            }
        }
    }

    fn test(&mut self) -> Result<Result<Step, LoopStop>> {
        let iteration = self.state.iteration;
        let outcome = self.build_tool.test().context("run tests")?;
        self.state.last_tests_succeeded = outcome.passed;
        self.log.write_test_log(iteration, &outcome.raw_log)?;
        if let Some(meta) = &mut self.meta {
            meta.tests_passed = Some(outcome.passed);
        }
        (self.on_event)(&LoopEvent::TestsFinished {
            iteration,
            passed: outcome.passed,
        });
        if outcome.passed {
            return Ok(Err(LoopStop::Success));
        }

        let issues = extract(self.reader, &outcome.artifact, self.ctx.root);
        self.record_issues(&issues, true)?;
        if let Some(stop) = self.check_progress(&issues) {
            return Ok(Err(stop));
        }
        if issues.is_empty() {
            debug!("tests failed without extractable issues, rebuilding");
            self.set_outcome("tests_failed");
            return Ok(Ok(Step::Building));
        }
        Ok(Ok(Step::Fixing(issues)))
    }

    /// Send the request, retrying once on transport failure.
    fn ask_oracle(&mut self, request: &PatchRequest<'_>) -> Result<String, String> {
        let mut attempt = 1;
        loop {
            match request_patch(self.oracle, &self.engine, request) {
                Ok(response) => return Ok(response),
                Err(err) => {
                    let error = format!("{err:#}");
                    if attempt >= ORACLE_ATTEMPTS {
                        warn!(error = %error, attempt, "oracle request failed, giving up");
                        return Err(error);
                    }
                    warn!(error = %error, attempt, "oracle request failed, retrying");
                    (self.on_event)(&LoopEvent::OracleRetry {
                        iteration: self.state.iteration,
                        error,
                    });
                    attempt += 1;
                }
            }
        }
    }

    fn record_issues(&mut self, issues: &[Issue], from_tests: bool) -> Result<()> {
        let iteration = self.state.iteration;
        self.log.write_issues(iteration, issues)?;
        if let Some(meta) = &mut self.meta {
            meta.issue_count = issues.len();
        }
        (self.on_event)(&LoopEvent::IssuesFound {
            iteration,
            count: issues.len(),
            from_tests,
        });
        Ok(())
    }

    fn check_progress(&mut self, issues: &[Issue]) -> Option<LoopStop> {
        if self.tracker.observe(issues) {
            let repeats = self.tracker.repeats();
            warn!(repeats, "same issues keep coming back");
            return Some(LoopStop::NoProgress { repeats });
        }
        None
    }

    fn set_outcome(&mut self, outcome: &str) {
        if let Some(meta) = &mut self.meta {
            meta.outcome = outcome.to_string();
        }
    }

    /// Write `meta.json` for the open iteration, if any.
    fn close_iteration(&mut self, outcome: Option<&str>) -> Result<()> {
        if let Some(outcome) = outcome {
            self.set_outcome(outcome);
        }
        if let Some(meta) = self.meta.take() {
            self.log.write_meta(&meta)?;
        }
        Ok(())
    }

    fn finish(&mut self, stop: LoopStop) -> Result<LoopOutcome> {
        info!(iterations = self.state.iteration, stop = stop.label(), "loop stopped");
        self.close_iteration(Some(stop.label()))?;
        Ok(LoopOutcome {
            iterations: self.state.iteration,
            stop,
            last_patch: self.last_patch.clone(),
            state: self.state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::diagnostics::JsonFileReader;
    use crate::test_support::{
        ScriptedBuildTool, ScriptedOracle, ScriptedRun, TestRepo, error_artifact,
    };
    use std::fs;

    struct Fixture {
        temp: tempfile::TempDir,
        config: FixConfig,
        policy: EditPolicy,
        stop: StopSignal,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempfile::tempdir().expect("tempdir");
            let root = temp.path();
            fs::create_dir_all(root.join("App")).expect("mkdir");
            fs::write(root.join("App/A.swift"), "let a = 1\nlet b = a +\n").expect("write");
            let mut config = FixConfig::default();
            config.policy.allowed_directories = vec!["App".to_string()];
            config.policy.blocked_files = vec!["App/Locked.swift".to_string()];
            config.run.checkpoint = false;
            let policy = config.policy.edit_policy().expect("policy");
            Self {
                temp,
                config,
                policy,
                stop: StopSignal::new(),
            }
        }

        fn root(&self) -> &Path {
            self.temp.path()
        }

        fn run(&self, tool: &ScriptedBuildTool, oracle: &ScriptedOracle) -> (LoopOutcome, Vec<LoopEvent>) {
            let mut events = Vec::new();
            let ctx = LoopContext {
                root: self.root(),
                config: &self.config,
                policy: &self.policy,
                stop: &self.stop,
            };
            let outcome =
                run_loop(&ctx, tool, &JsonFileReader, oracle, |e| events.push(e.clone()))
                    .expect("loop");
            (outcome, events)
        }
    }

    const FIX: &str = "diff --git a/App/A.swift b/App/A.swift\n\
--- a/App/A.swift\n\
+++ b/App/A.swift\n\
@@ -1,2 +1,2 @@\n \
let a = 1\n\
-let b = a +\n\
+let b = a + 1\n";

    #[test]
    fn dirty_paths_are_limited_to_editable_files() {
        let repo = TestRepo::new();
        repo.write("ios/App/A.swift", "let a = 1\n");
        repo.write("ios/App/Locked.swift", "let locked = 1\n");
        repo.write("ios/Build.sh", "echo\n");
        repo.commit_all("initial");
        repo.write("ios/App/A.swift", "let a = 2\n");
        repo.write("ios/App/New.swift", "let n = 0\n");
        repo.write("ios/App/Locked.swift", "let locked = 2\n");
        repo.write("ios/Build.sh", "echo changed\n");

        let policy = EditPolicy::new(["App"], ["App/Locked.swift"]).expect("policy");
        let mut dirty = dirty_allowed_paths(&Git::new(repo.path().join("ios")), &policy);
        dirty.sort();

        assert_eq!(dirty, vec!["App/A.swift".to_string(), "App/New.swift".to_string()]);
    }

    #[test]
    fn failed_build_without_issues_counts_as_built() {
        let fx = Fixture::new();
        let tool = ScriptedBuildTool::new(vec![
            ScriptedRun::failed_build("{\"issues\":{}}".to_string()),
            ScriptedRun::tests(true),
        ]);
        let oracle = ScriptedOracle::new(Vec::new());

        let (outcome, _) = fx.run(&tool, &oracle);

        assert_eq!(outcome.stop, LoopStop::Success);
        assert!(outcome.state.is_green());
        assert_eq!(oracle.calls(), 0);
    }

    #[test]
    fn clean_build_and_passing_tests_succeed_without_oracle() {
        let fx = Fixture::new();
        let tool = ScriptedBuildTool::new(vec![ScriptedRun::clean_build(), ScriptedRun::tests(true)]);
        let oracle = ScriptedOracle::new(Vec::new());

        let (outcome, _) = fx.run(&tool, &oracle);

        assert_eq!(outcome.stop, LoopStop::Success);
        assert_eq!(outcome.iterations, 1);
        assert!(outcome.state.is_green());
        assert_eq!(oracle.calls(), 0);
    }

    #[test]
    fn rejected_patch_stops_before_touching_tree() {
        let fx = Fixture::new();
        let artifact = error_artifact(fx.root(), "App/A.swift", 2, "expected expression");
        let tool = ScriptedBuildTool::new(vec![ScriptedRun::failed_build(artifact)]);
        let oracle = ScriptedOracle::new(vec![Ok(
            "diff --git a/App/Locked.swift b/App/Locked.swift\n--- a/App/Locked.swift\n+++ b/App/Locked.swift\n@@ -1 +1 @@\n-a\n+b\n".to_string(),
        )]);

        let (outcome, _) = fx.run(&tool, &oracle);

        assert_eq!(
            outcome.stop,
            LoopStop::PatchRejected {
                reason: "patch touches disallowed path: App/Locked.swift (blocked file)".to_string()
            }
        );
        assert!(outcome.last_patch.is_some());
        assert_eq!(
            fs::read_to_string(fx.root().join("App/A.swift")).expect("read"),
            "let a = 1\nlet b = a +\n"
        );
    }

    #[test]
    fn oracle_transport_error_is_retried_once() {
        let fx = Fixture::new();
        let artifact = error_artifact(fx.root(), "App/A.swift", 2, "expected expression");
        let tool = ScriptedBuildTool::new(
            vec![
                ScriptedRun::failed_build(artifact),
                ScriptedRun::clean_build(),
                ScriptedRun::tests(true),
            ],
        );
        let oracle = ScriptedOracle::new(vec![Err("connection reset".to_string()), Ok(FIX.to_string())]);

        let (outcome, events) = fx.run(&tool, &oracle);

        assert_eq!(outcome.stop, LoopStop::Success);
        assert_eq!(oracle.calls(), 2);
        assert!(events.iter().any(|e| matches!(e, LoopEvent::OracleRetry { iteration: 1, .. })));
        assert_eq!(
            fs::read_to_string(fx.root().join("App/A.swift")).expect("read"),
            "let a = 1\nlet b = a + 1\n"
        );
    }

    #[test]
    fn second_oracle_failure_stops_the_loop() {
        let fx = Fixture::new();
        let artifact = error_artifact(fx.root(), "App/A.swift", 2, "expected expression");
        let tool = ScriptedBuildTool::new(vec![ScriptedRun::failed_build(artifact)]);
        let oracle = ScriptedOracle::new(vec![Err("timeout".to_string()), Err("timeout".to_string())]);

        let (outcome, _) = fx.run(&tool, &oracle);

        assert!(matches!(outcome.stop, LoopStop::OracleFailed { ref error } if error.contains("timeout")));
        assert_eq!(outcome.last_patch, None);
    }

    #[test]
    fn repeated_issue_set_stops_with_no_progress() {
        let mut fx = Fixture::new();
        fx.config.run.no_progress_limit = 2;
        // A patch that applies but does not change the diagnostics.
        let noop = "diff --git a/App/B.swift b/App/B.swift\nnew file mode 100644\n--- /dev/null\n+++ b/App/B.swift\n@@ -0,0 +1 @@\n+// touched\n";
        let first = error_artifact(fx.root(), "App/A.swift", 2, "expected expression");
        let second = error_artifact(fx.root(), "App/A.swift", 2, "expected expression");
        let tool = ScriptedBuildTool::new(
            vec![ScriptedRun::failed_build(first), ScriptedRun::failed_build(second)],
        );
        let oracle = ScriptedOracle::new(vec![Ok(noop.to_string())]);

        let (outcome, _) = fx.run(&tool, &oracle);

        assert_eq!(outcome.stop, LoopStop::NoProgress { repeats: 2 });
        assert_eq!(outcome.iterations, 2);
    }

    #[test]
    fn iteration_ceiling_stops_the_loop() {
        let mut fx = Fixture::new();
        fx.config.run.max_iterations = 1;
        let artifact = error_artifact(fx.root(), "App/A.swift", 2, "expected expression");
        let tool = ScriptedBuildTool::new(vec![ScriptedRun::failed_build(artifact)]);
        let oracle = ScriptedOracle::new(vec![Ok(FIX.to_string())]);

        let (outcome, _) = fx.run(&tool, &oracle);

        assert_eq!(outcome.stop, LoopStop::MaxIterations { limit: 1 });
        assert_eq!(outcome.iterations, 1);
        let meta = fs::read_to_string(fx.root().join(".fixloop/iterations/1/meta.json")).expect("meta");
        assert!(meta.contains("\"outcome\": \"max_iterations\""));
    }

    #[test]
    fn raised_stop_signal_interrupts_before_building() {
        let fx = Fixture::new();
        fx.stop.raise();
        let tool = ScriptedBuildTool::new(Vec::new());
        let oracle = ScriptedOracle::new(Vec::new());

        let (outcome, _) = fx.run(&tool, &oracle);

        assert_eq!(outcome.stop, LoopStop::Interrupted);
        assert_eq!(outcome.iterations, 0);
        assert_eq!(tool.runs(), 0);
    }

    #[test]
    fn stop_labels_are_stable() {
        assert_eq!(LoopStop::Success.label(), "success");
        assert_eq!(LoopStop::NoProgress { repeats: 3 }.label(), "no_progress");
        assert_eq!(
            LoopStop::MaxIterations { limit: 10 }.to_string(),
            "reached the iteration limit (10)"
        );
    }
}
