//! Patch applier: the only code path that mutates the working tree.
//!
//! Accepts [`ApprovedPatch`] only, so every patch reaching `git apply` has
//! already passed the edit policy. `git apply` is all-or-nothing; a dry run
//! with `--check` precedes the real application so rejected hunks are reported
//! before anything is touched.

use std::fmt;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, warn};

use crate::core::patch::ApprovedPatch;
use crate::io::git::Git;

/// Why an approved patch could not be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// Patch does not apply cleanly; the tree is unchanged.
    DoesNotApply(String),
    /// Patch file could not be prepared or `git` could not run.
    Io(String),
    /// Applied but the checkpoint commit failed; the patch was reverted.
    Commit { error: String, reverted: bool },
}

impl fmt::Display for ApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyError::DoesNotApply(msg) => write!(f, "patch does not apply: {msg}"),
            ApplyError::Io(msg) => write!(f, "patch application failed: {msg}"),
            ApplyError::Commit { error, reverted: true } => {
                write!(f, "checkpoint commit failed (patch reverted): {error}")
            }
            ApplyError::Commit {
                error,
                reverted: false,
            } => write!(f, "checkpoint commit failed (revert also failed): {error}"),
        }
    }
}

impl std::error::Error for ApplyError {}

/// Result of a successful application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedPatch {
    pub touched: Vec<PathBuf>,
    /// Checkpoint commit, when one was made.
    pub commit: Option<String>,
}

/// Commit message for the checkpoint of `iteration`.
pub fn commit_message(iteration: u32) -> String {
    format!("auto: apply automated fix (iteration {iteration})")
}

/// Applies approved patches with `git apply`, optionally committing each one.
#[derive(Debug, Clone)]
pub struct GitApplier {
    git: Git,
    checkpoint: bool,
}

impl GitApplier {
    /// `checkpoint` has effect only when `root` is a git work tree.
    pub fn new(root: impl Into<PathBuf>, checkpoint: bool) -> Self {
        let git = Git::new(root);
        let checkpoint = checkpoint && git.is_repository();
        if !checkpoint {
            debug!(root = %git.workdir().display(), "applying without checkpoint commits");
        }
        Self { git, checkpoint }
    }

    pub fn checkpoints(&self) -> bool {
        self.checkpoint
    }

    #[instrument(skip_all, fields(iteration, paths = patch.touched_paths().len()))]
    pub fn apply(&self, patch: &ApprovedPatch, iteration: u32) -> Result<AppliedPatch, ApplyError> {
        let file = write_patch_file(patch.text()).map_err(|e| ApplyError::Io(format!("{e:#}")))?;

        self.git
            .apply_check(file.path())
            .map_err(|e| ApplyError::DoesNotApply(format!("{e:#}")))?;
        self.git
            .apply(file.path())
            .map_err(|e| ApplyError::DoesNotApply(format!("{e:#}")))?;
        info!(paths = ?patch.touched_paths(), "patch applied");

        let touched = patch.touched_paths().to_vec();
        if !self.checkpoint {
            return Ok(AppliedPatch {
                touched,
                commit: None,
            });
        }

        match self.commit(&touched, iteration) {
            Ok(Some(sha)) => Ok(AppliedPatch {
                touched,
                commit: Some(sha),
            }),
            Ok(None) => {
                warn!("patch applied cleanly but staged nothing");
                Err(ApplyError::DoesNotApply(
                    "patch left the touched paths unchanged".to_string(),
                ))
            }
            Err(err) => {
                let error = format!("{err:#}");
                warn!(error = %error, "checkpoint commit failed, reverting patch");
                let reverted = self.revert(file.path(), &touched);
                Err(ApplyError::Commit { error, reverted })
            }
        }
    }

    fn commit(&self, touched: &[PathBuf], iteration: u32) -> Result<Option<String>> {
        self.git.add_paths(touched).context("stage patched paths")?;
        if !self.git.commit_staged(&commit_message(iteration))? {
            return Ok(None);
        }
        let sha = self.git.head_sha()?;
        debug!(sha = %sha, "checkpoint committed");
        Ok(Some(sha))
    }

    /// Undo the patch in the tree and index. Returns false if it could not.
    fn revert(&self, patch_file: &std::path::Path, touched: &[PathBuf]) -> bool {
        let result = self
            .git
            .apply_reverse(patch_file)
            .and_then(|()| self.git.add_paths(touched));
        if let Err(err) = &result {
            warn!(err = %format!("{err:#}"), "revert failed, tree may hold the patch");
        }
        result.is_ok()
    }
}

fn write_patch_file(text: &str) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("fixloop-")
        .suffix(".diff")
        .tempfile()
        .context("create patch file")?;
    file.write_all(text.as_bytes()).context("write patch file")?;
    // git apply reports a corrupt patch without the final newline.
    if !text.ends_with('\n') {
        file.write_all(b"\n").context("write patch file")?;
    }
    file.flush().context("flush patch file")?;
    Ok(file)
}
