//! Iteration logging helpers for `<log_dir>/iterations/`.
//!
//! Each iteration gets its own directory with the raw build/test logs, the
//! extracted issues, the oracle's patch and a small `meta.json`. The log
//! directory carries a `.gitignore` so checkpoint commits never pick it up.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::core::types::Issue;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IterationMeta {
    pub iteration: u32,
    pub build_succeeded: Option<bool>,
    pub tests_passed: Option<bool>,
    pub issue_count: usize,
    /// Short label of how the iteration ended (`patch_applied`, `success`, ...).
    pub outcome: String,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub build_log_path: PathBuf,
    pub issues_path: PathBuf,
    pub patch_path: PathBuf,
    pub test_log_path: PathBuf,
    pub meta_path: PathBuf,
}

impl IterationPaths {
    fn new(iterations_dir: &Path, iteration: u32) -> Self {
        let dir = iterations_dir.join(iteration.to_string());
        Self {
            build_log_path: dir.join("build.log"),
            issues_path: dir.join("issues.json"),
            patch_path: dir.join("patch.diff"),
            test_log_path: dir.join("test.log"),
            meta_path: dir.join("meta.json"),
            dir,
        }
    }
}

/// Writer for one run's iteration logs.
#[derive(Debug, Clone)]
pub struct IterationLog {
    iterations_dir: PathBuf,
}

impl IterationLog {
    /// Prepare `<root>/<log_dir>`, dropping iteration logs of earlier runs.
    pub fn create(root: &Path, log_dir: &str) -> Result<Self> {
        let base = root.join(log_dir);
        fs::create_dir_all(&base).with_context(|| format!("create log dir {}", base.display()))?;
        let ignore = base.join(".gitignore");
        if !ignore.exists() {
            write_text(&ignore, "*\n")?;
        }
        let iterations_dir = base.join("iterations");
        if iterations_dir.exists() {
            fs::remove_dir_all(&iterations_dir)
                .with_context(|| format!("clear {}", iterations_dir.display()))?;
        }
        debug!(dir = %iterations_dir.display(), "iteration log ready");
        Ok(Self { iterations_dir })
    }

    pub fn paths(&self, iteration: u32) -> IterationPaths {
        IterationPaths::new(&self.iterations_dir, iteration)
    }

    pub fn write_build_log(&self, iteration: u32, log: &str) -> Result<()> {
        let paths = self.prepare(iteration)?;
        write_text(&paths.build_log_path, log)
    }

    pub fn write_test_log(&self, iteration: u32, log: &str) -> Result<()> {
        let paths = self.prepare(iteration)?;
        write_text(&paths.test_log_path, log)
    }

    /// Issues of the most recent diagnosing pass in this iteration.
    pub fn write_issues(&self, iteration: u32, issues: &[Issue]) -> Result<()> {
        let paths = self.prepare(iteration)?;
        write_json(&paths.issues_path, &issues)
    }

    pub fn write_patch(&self, iteration: u32, patch: &str) -> Result<()> {
        let paths = self.prepare(iteration)?;
        write_text(&paths.patch_path, patch)
    }

    pub fn write_meta(&self, meta: &IterationMeta) -> Result<()> {
        let paths = self.prepare(meta.iteration)?;
        write_json(&paths.meta_path, meta)
    }

    fn prepare(&self, iteration: u32) -> Result<IterationPaths> {
        let paths = self.paths(iteration);
        fs::create_dir_all(&paths.dir)
            .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;
        Ok(paths)
    }
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_text(path, &buf)
}
