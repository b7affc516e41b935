//! Git adapter for the patch applier and loop checkpoints.
//!
//! Every patch the loop applies becomes its own commit, so history doubles as
//! an undo log. We keep a small, explicit wrapper around `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True when `workdir` is inside a git work tree. A missing `git`
    /// binary counts as "not a repository".
    pub fn is_repository(&self) -> bool {
        match self.run(&["rev-parse", "--is-inside-work-tree"]) {
            Ok(out) => out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "true",
            Err(err) => {
                debug!(err = %format!("{err:#}"), "git unavailable");
                false
            }
        }
    }

    /// Create or reset `branch` at HEAD and check it out (`checkout -B`).
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_reset_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out working branch");
        self.run_checked(&["checkout", "-B", branch])?;
        Ok(())
    }

    /// Dry-run a patch file against the work tree.
    pub fn apply_check(&self, patch: &Path) -> Result<()> {
        self.apply_with(&["--check"], patch)
    }

    pub fn apply(&self, patch: &Path) -> Result<()> {
        self.apply_with(&[], patch)
    }

    /// Undo a previously applied patch file.
    pub fn apply_reverse(&self, patch: &Path) -> Result<()> {
        self.apply_with(&["-R"], patch)
    }

    /// Path of `workdir` relative to the top of its work tree, with a trailing
    /// `/`. Empty at the top level or outside a repository.
    pub fn show_prefix(&self) -> String {
        match self.run(&["rev-parse", "--show-prefix"]) {
            Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).trim().to_string(),
            _ => String::new(),
        }
    }

    /// Patch paths are relative to `workdir`, but `git apply` resolves them
    /// from the top of the work tree and silently skips anything outside the
    /// current directory. `--directory` re-roots them.
    fn apply_with(&self, flags: &[&str], patch: &Path) -> Result<()> {
        let prefix = self.show_prefix();
        let directory = format!("--directory={prefix}");
        let patch = path_arg(patch);
        let mut args = vec!["apply"];
        args.extend_from_slice(flags);
        args.push("--whitespace=fix");
        if !prefix.is_empty() {
            args.push(&directory);
        }
        args.push(&patch);
        self.run_checked(&args)?;
        Ok(())
    }

    /// Stage additions, modifications and deletions under `paths` only.
    pub fn add_paths(&self, paths: &[PathBuf]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add".to_string(), "-A".to_string(), "--".to_string()];
        args.extend(paths.iter().map(|p| path_arg(p)));
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_checked(&args)?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run_checked(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Full SHA of HEAD.
    pub fn head_sha(&self) -> Result<String> {
        Ok(self.run_capture(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        out.lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_status_line)
            .collect()
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_untracked_and_modified_lines() {
        assert_eq!(
            parse_status_line("?? App/New.swift").expect("parse"),
            StatusEntry {
                code: "??".to_string(),
                path: "App/New.swift".to_string()
            }
        );
        assert_eq!(
            parse_status_line(" M App/View.swift").expect("parse").code,
            " M"
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  Old.swift -> New.swift").expect("parse");
        assert_eq!(e.path, "New.swift");
    }

    #[test]
    fn plain_directory_is_not_a_repository() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(!Git::new(temp.path()).is_repository());
    }
}
