//! Source context gathered for the patch oracle (one window per file).

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use tracing::debug;

use crate::core::snippet::render_window;
use crate::core::types::{FileContext, Issue};

/// Build one [`FileContext`] per distinct file, in first-seen issue order.
///
/// The window is centered on the first issue that names the file; later
/// issues for the same file add nothing. Unreadable files are omitted.
pub fn assemble(root: &Path, issues: &[Issue], window: usize) -> Vec<FileContext> {
    let mut seen = HashSet::new();
    let mut contexts = Vec::new();

    for issue in issues {
        if !seen.insert(issue.file_path.as_path()) {
            continue;
        }
        let path = root.join(&issue.file_path);
        match fs::read_to_string(&path) {
            Ok(contents) => contexts.push(FileContext {
                file_path: issue.file_path.clone(),
                snippet: render_window(&contents, issue.line, window),
            }),
            Err(err) => {
                debug!(path = %path.display(), err = %err, "skipping unreadable context file");
            }
        }
    }

    debug!(files = contexts.len(), issues = issues.len(), "context assembled");
    contexts
}
