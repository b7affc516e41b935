//! Edit sandbox: which paths an automated patch may touch.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use anyhow::{Result, anyhow, bail};

/// Allow-list of editable directories plus a block-list of protected files.
///
/// Built once at startup and shared by reference. Blocked files win over
/// allowed directories, and match regardless of case: Xcode projects live on
/// case-insensitive volumes where `gridoverlay.swift` is `GridOverlay.swift`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditPolicy {
    allowed_directories: Vec<PathBuf>,
    blocked_files: BTreeSet<PathBuf>,
    blocked_keys: BTreeSet<String>,
}

/// Classification of a single repository-relative path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathAccess {
    Allowed,
    /// Exact match with a blocked file.
    Blocked,
    /// Not under any allowed directory.
    Outside,
}

impl EditPolicy {
    pub fn new<A, B>(allowed_directories: A, blocked_files: B) -> Result<Self>
    where
        A: IntoIterator,
        A::Item: AsRef<str>,
        B: IntoIterator,
        B::Item: AsRef<str>,
    {
        let mut allowed = Vec::new();
        for raw in allowed_directories {
            let raw = raw.as_ref();
            let dir = normalize_relative(raw)
                .ok_or_else(|| anyhow!("invalid allowed directory '{raw}'"))?;
            if !allowed.contains(&dir) {
                allowed.push(dir);
            }
        }
        if allowed.is_empty() {
            bail!("edit policy needs at least one allowed directory");
        }

        let mut blocked = BTreeSet::new();
        let mut blocked_keys = BTreeSet::new();
        for raw in blocked_files {
            let raw = raw.as_ref();
            let file =
                normalize_relative(raw).ok_or_else(|| anyhow!("invalid blocked file '{raw}'"))?;
            blocked_keys.insert(fold_case(&file));
            blocked.insert(file);
        }

        Ok(Self {
            allowed_directories: allowed,
            blocked_files: blocked,
            blocked_keys,
        })
    }

    pub fn allowed_directories(&self) -> &[PathBuf] {
        &self.allowed_directories
    }

    pub fn blocked_files(&self) -> impl Iterator<Item = &Path> {
        self.blocked_files.iter().map(PathBuf::as_path)
    }

    /// Classify a normalized relative path.
    ///
    /// Directory matching is by whole path segments: `a/b` covers `a/b` and
    /// `a/b/c.swift` but never `a/bc`.
    pub fn classify(&self, path: &Path) -> PathAccess {
        if self.blocked_keys.contains(&fold_case(path)) {
            return PathAccess::Blocked;
        }
        if self
            .allowed_directories
            .iter()
            .any(|dir| path.starts_with(dir))
        {
            PathAccess::Allowed
        } else {
            PathAccess::Outside
        }
    }
}

fn fold_case(path: &Path) -> String {
    path.to_string_lossy().to_lowercase()
}

/// Normalize a `/`-separated relative path.
///
/// Returns `None` for anything that cannot be classified with confidence:
/// empty paths, absolute paths, backslashes, `.` or `..` segments.
pub fn normalize_relative(raw: &str) -> Option<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() || raw.contains('\\') || raw.contains('\0') || raw.starts_with('/') {
        return None;
    }
    let mut normalized = PathBuf::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(name) => normalized.push(name),
            Component::CurDir
            | Component::ParentDir
            | Component::RootDir
            | Component::Prefix(_) => return None,
        }
    }
    if raw.split('/').any(|segment| segment == ".") {
        return None;
    }
    if normalized.as_os_str().is_empty() {
        return None;
    }
    Some(normalized)
}
