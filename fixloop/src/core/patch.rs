//! Static safety checks for oracle-proposed unified diffs.
//!
//! Only the declared path set of a patch is inspected; file contents are never
//! read. The validator is the single boundary that keeps automated edits inside
//! the sandbox, so anything it cannot classify is rejected.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::core::policy::{EditPolicy, PathAccess, normalize_relative};

/// A path declared by a diff header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredPath {
    /// Header text as written in the patch.
    pub raw: String,
    /// Repository-relative path after prefix stripping, if classifiable.
    pub normalized: Option<PathBuf>,
}

/// Header scan result for a patch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchHeaders {
    /// At least one `diff --git` line or `---`/`+++` pair was found.
    pub has_header: bool,
    /// Declared paths in first-seen order, without duplicates.
    pub paths: Vec<DeclaredPath>,
}

/// Reason a patch was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    NoDiff,
    Blocked { path: String },
    Disallowed { path: String },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::NoDiff => f.write_str("no diff found"),
            Rejection::Blocked { path } => {
                write!(f, "patch touches disallowed path: {path} (blocked file)")
            }
            Rejection::Disallowed { path } => write!(f, "patch touches disallowed path: {path}"),
        }
    }
}

/// A patch that passed validation. Only [`validate`] can build one, so the
/// applier never sees unchecked text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovedPatch {
    text: String,
    touched: Vec<PathBuf>,
}

impl ApprovedPatch {
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Repository-relative paths the patch declares.
    pub fn touched_paths(&self) -> &[PathBuf] {
        &self.touched
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Approved(ApprovedPatch),
    Rejected(Rejection),
}

impl Verdict {
    pub fn is_ok(&self) -> bool {
        matches!(self, Verdict::Approved(_))
    }

    pub fn reason(&self) -> Option<String> {
        match self {
            Verdict::Approved(_) => None,
            Verdict::Rejected(rejection) => Some(rejection.to_string()),
        }
    }
}

/// Validate `patch_text` against `policy`.
pub fn validate(patch_text: &str, policy: &EditPolicy) -> Verdict {
    let headers = scan_headers(patch_text);
    if !headers.has_header || headers.paths.is_empty() {
        return Verdict::Rejected(Rejection::NoDiff);
    }

    let mut touched = Vec::with_capacity(headers.paths.len());
    for declared in &headers.paths {
        let Some(path) = &declared.normalized else {
            return Verdict::Rejected(Rejection::Disallowed {
                path: declared.raw.clone(),
            });
        };
        match policy.classify(path) {
            PathAccess::Blocked => {
                return Verdict::Rejected(Rejection::Blocked {
                    path: display(path),
                });
            }
            PathAccess::Outside => {
                return Verdict::Rejected(Rejection::Disallowed {
                    path: display(path),
                });
            }
            PathAccess::Allowed => {
                if !touched.contains(path) {
                    touched.push(path.clone());
                }
            }
        }
    }

    Verdict::Approved(ApprovedPatch {
        text: patch_text.to_string(),
        touched,
    })
}

/// Collect declared paths from file headers, skipping hunk bodies.
pub fn scan_headers(patch_text: &str) -> PatchHeaders {
    let mut headers = PatchHeaders::default();
    let lines: Vec<&str> = patch_text.lines().collect();
    let mut hunk: Option<HunkCounter> = None;

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];

        if let Some(counter) = hunk.as_mut() {
            if counter.consume(line) {
                if counter.is_done() {
                    hunk = None;
                }
                i += 1;
                continue;
            }
            // Not a hunk body line: the hunk ended early, treat as header text.
            hunk = None;
        }

        if let Some(rest) = line.strip_prefix("diff --git ") {
            headers.has_header = true;
            for declared in parse_git_header(rest) {
                headers.push(declared);
            }
        } else if let Some(old) = line.strip_prefix("--- ")
            && let Some(new) = lines.get(i + 1).and_then(|l| l.strip_prefix("+++ "))
        {
            headers.has_header = true;
            if let Some(declared) = parse_side(old, "a/") {
                headers.push(declared);
            }
            if let Some(declared) = parse_side(new, "b/") {
                headers.push(declared);
            }
            i += 1;
        } else if let Some(path) = strip_any(line, &["rename from ", "rename to ", "copy from ", "copy to "])
        {
            headers.push(unprefixed(path));
        } else if line.starts_with("@@ ") {
            hunk = HunkCounter::parse(line);
        }
        i += 1;
    }

    headers
}

impl PatchHeaders {
    fn push(&mut self, declared: DeclaredPath) {
        let seen = self.paths.iter().any(|existing| match &declared.normalized {
            Some(path) => existing.normalized.as_ref() == Some(path),
            None => existing.normalized.is_none() && existing.raw == declared.raw,
        });
        if !seen {
            self.paths.push(declared);
        }
    }
}

/// Remaining line budget of the hunk being skipped.
#[derive(Debug, Clone, Copy)]
struct HunkCounter {
    old: u32,
    new: u32,
}

impl HunkCounter {
    /// Parse `@@ -a[,b] +c[,d] @@`. Returns `None` when the counts are unreadable.
    fn parse(line: &str) -> Option<Self> {
        let body = line.strip_prefix("@@ -")?;
        let (old, rest) = body.split_once(" +")?;
        let (new, _) = rest.split_once(" @@")?;
        let count = |range: &str| -> Option<u32> {
            match range.split_once(',') {
                Some((_, len)) => len.parse().ok(),
                None => range.parse::<u32>().ok().map(|_| 1),
            }
        };
        let counter = Self {
            old: count(old)?,
            new: count(new)?,
        };
        (!counter.is_done()).then_some(counter)
    }

    fn is_done(&self) -> bool {
        self.old == 0 && self.new == 0
    }

    /// Consume one body line. Returns false if `line` is not a body line.
    fn consume(&mut self, line: &str) -> bool {
        match line.chars().next() {
            // Some generators drop the leading space on blank context lines.
            None | Some(' ') if self.old > 0 && self.new > 0 => {
                self.old -= 1;
                self.new -= 1;
                true
            }
            Some('-') if self.old > 0 => {
                self.old -= 1;
                true
            }
            Some('+') if self.new > 0 => {
                self.new -= 1;
                true
            }
            Some('\\') => true,
            _ => false,
        }
    }
}

fn parse_git_header(rest: &str) -> Vec<DeclaredPath> {
    let rest = rest.trim_end();
    if rest.starts_with('"') {
        return vec![unclassifiable(rest)];
    }
    let Some(body) = rest.strip_prefix("a/") else {
        return vec![unclassifiable(rest)];
    };

    // Same path on both sides: "a/X b/X" (X may contain spaces).
    if body.len() >= 3 && (body.len() - 3) % 2 == 0 {
        let half = (body.len() - 3) / 2;
        if body.is_char_boundary(half) && body.is_char_boundary(half + 3) {
            let (old, tail) = body.split_at(half);
            if let Some(new) = tail.strip_prefix(" b/")
                && old == new
            {
                return vec![prefixed(old, rest)];
            }
        }
    }

    match body.split_once(" b/") {
        Some((old, new)) => vec![prefixed(old, rest), prefixed(new, rest)],
        None => vec![unclassifiable(rest)],
    }
}

/// Parse one side of a `---`/`+++` pair. `/dev/null` declares no path.
fn parse_side(rest: &str, prefix: &str) -> Option<DeclaredPath> {
    let raw = rest.split('\t').next().unwrap_or(rest).trim_end();
    if raw == "/dev/null" {
        return None;
    }
    if raw.starts_with('"') {
        return Some(unclassifiable(raw));
    }
    match raw.strip_prefix(prefix) {
        Some(path) => Some(prefixed(path, raw)),
        None => Some(unclassifiable(raw)),
    }
}

fn strip_any<'a>(line: &'a str, prefixes: &[&str]) -> Option<&'a str> {
    prefixes.iter().find_map(|prefix| line.strip_prefix(prefix))
}

fn prefixed(path: &str, raw: &str) -> DeclaredPath {
    DeclaredPath {
        raw: raw.to_string(),
        normalized: normalize_relative(path),
    }
}

fn unprefixed(path: &str) -> DeclaredPath {
    let path = path.trim_end();
    DeclaredPath {
        raw: path.to_string(),
        normalized: if path.starts_with('"') {
            None
        } else {
            normalize_relative(path)
        },
    }
}

fn unclassifiable(raw: &str) -> DeclaredPath {
    DeclaredPath {
        raw: raw.to_string(),
        normalized: None,
    }
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> EditPolicy {
        EditPolicy::new(
            [
                "PrintMyRide/Features/Editor",
                "PrintMyRide/Features/Render",
                "PrintMyRideTests",
            ],
            [
                "PrintMyRide/Models/PosterDesign.swift",
                "PrintMyRide/Features/Render/GridOverlay.swift",
            ],
        )
        .expect("policy")
    }

    fn diff_for(path: &str) -> String {
        format!(
            "diff --git a/{path} b/{path}\n\
             index 1111111..2222222 100644\n\
             --- a/{path}\n\
             +++ b/{path}\n\
             @@ -1,3 +1,3 @@\n \
             import SwiftUI\n\
             -let x = 1\n\
             +let x = 2\n \
             struct A {{}}\n"
        )
    }

    #[test]
    fn approves_patch_inside_allowed_directory() {
        let patch = diff_for("PrintMyRide/Features/Editor/StudioView.swift");
        let verdict = validate(&patch, &policy());
        assert!(verdict.is_ok());
        assert_eq!(verdict.reason(), None);
        let Verdict::Approved(approved) = verdict else {
            panic!("expected approval");
        };
        assert_eq!(
            approved.touched_paths(),
            &[PathBuf::from("PrintMyRide/Features/Editor/StudioView.swift")]
        );
        assert_eq!(approved.text(), patch);
    }

    #[test]
    fn rejects_prose_without_diff() {
        let verdict = validate("I could not find the problem, sorry.", &policy());
        assert_eq!(verdict, Verdict::Rejected(Rejection::NoDiff));
        assert_eq!(verdict.reason().as_deref(), Some("no diff found"));
    }

    #[test]
    fn rejects_empty_text() {
        assert_eq!(
            validate("", &policy()),
            Verdict::Rejected(Rejection::NoDiff)
        );
    }

    #[test]
    fn markdown_rule_is_not_a_header() {
        let text = "Summary\n---\nNothing to change.\n";
        assert_eq!(
            validate(text, &policy()),
            Verdict::Rejected(Rejection::NoDiff)
        );
    }

    #[test]
    fn blocked_file_rejected_even_with_allowed_siblings() {
        let patch = format!(
            "{}{}",
            diff_for("PrintMyRide/Features/Editor/StudioView.swift"),
            diff_for("PrintMyRide/Features/Render/GridOverlay.swift")
        );
        let verdict = validate(&patch, &policy());
        assert_eq!(
            verdict,
            Verdict::Rejected(Rejection::Blocked {
                path: "PrintMyRide/Features/Render/GridOverlay.swift".to_string()
            })
        );
        let reason = verdict.reason().expect("reason");
        assert!(reason.contains("disallowed path"));
        assert!(reason.contains("GridOverlay.swift"));
    }

    #[test]
    fn case_variant_of_blocked_file_is_rejected() {
        let verdict = validate(
            &diff_for("PrintMyRide/Features/Render/gridoverlay.swift"),
            &policy(),
        );
        assert_eq!(
            verdict,
            Verdict::Rejected(Rejection::Blocked {
                path: "PrintMyRide/Features/Render/gridoverlay.swift".to_string()
            })
        );
    }

    #[test]
    fn blocked_file_outside_allow_list_names_the_path() {
        let verdict = validate(
            &diff_for("PrintMyRide/Models/PosterDesign.swift"),
            &policy(),
        );
        assert_eq!(
            verdict,
            Verdict::Rejected(Rejection::Blocked {
                path: "PrintMyRide/Models/PosterDesign.swift".to_string()
            })
        );
    }

    #[test]
    fn rejects_sibling_directory_with_shared_prefix() {
        let verdict = validate(&diff_for("PrintMyRideTestsHelpers/A.swift"), &policy());
        assert_eq!(
            verdict,
            Verdict::Rejected(Rejection::Disallowed {
                path: "PrintMyRideTestsHelpers/A.swift".to_string()
            })
        );
    }

    #[test]
    fn rejects_parent_directory_escape() {
        let patch = "--- a/PrintMyRideTests/../Secrets.swift\n\
                     +++ b/PrintMyRideTests/../Secrets.swift\n\
                     @@ -1 +1 @@\n-a\n+b\n";
        let verdict = validate(patch, &policy());
        assert!(!verdict.is_ok());
        assert!(
            verdict
                .reason()
                .expect("reason")
                .contains("patch touches disallowed path")
        );
    }

    #[test]
    fn rejects_headers_without_ab_prefix() {
        let patch = "--- PrintMyRideTests/A.swift\n\
                     +++ PrintMyRideTests/A.swift\n\
                     @@ -1 +1 @@\n-a\n+b\n";
        assert!(!validate(patch, &policy()).is_ok());
    }

    #[test]
    fn rename_target_is_checked() {
        let patch = "diff --git a/PrintMyRideTests/A.swift b/PrintMyRide/App.swift\n\
                     similarity index 100%\n\
                     rename from PrintMyRideTests/A.swift\n\
                     rename to PrintMyRide/App.swift\n";
        let verdict = validate(patch, &policy());
        assert_eq!(
            verdict,
            Verdict::Rejected(Rejection::Disallowed {
                path: "PrintMyRide/App.swift".to_string()
            })
        );
    }

    #[test]
    fn new_file_from_dev_null_is_allowed() {
        let patch = "diff --git a/PrintMyRideTests/New.swift b/PrintMyRideTests/New.swift\n\
                     new file mode 100644\n\
                     --- /dev/null\n\
                     +++ b/PrintMyRideTests/New.swift\n\
                     @@ -0,0 +1,1 @@\n\
                     +import XCTest\n";
        assert!(validate(patch, &policy()).is_ok());
    }

    #[test]
    fn hunk_lines_that_look_like_headers_are_skipped() {
        // A removed "-- " comment followed by an added "++" line must not be
        // parsed as a second file header.
        let patch = "--- a/PrintMyRideTests/A.swift\n\
                     +++ b/PrintMyRideTests/A.swift\n\
                     @@ -1,2 +1,2 @@\n\
                     --- a/PrintMyRide/Models/PosterDesign.swift\n\
                     +++ b/PrintMyRide/Models/PosterDesign.swift\n \
                     let kept = true\n";
        let verdict = validate(patch, &policy());
        assert!(verdict.is_ok(), "unexpected: {:?}", verdict.reason());
    }

    #[test]
    fn quoted_paths_are_unclassifiable() {
        let patch = "diff --git \"a/PrintMyRideTests/we ird.swift\" \"b/PrintMyRideTests/we ird.swift\"\n";
        assert!(!validate(patch, &policy()).is_ok());
    }

    #[test]
    fn git_header_with_spaces_in_path() {
        let headers = scan_headers("diff --git a/PrintMyRideTests/My File.swift b/PrintMyRideTests/My File.swift\n");
        assert_eq!(
            headers.paths[0].normalized,
            Some(PathBuf::from("PrintMyRideTests/My File.swift"))
        );
    }

    #[test]
    fn validation_is_idempotent() {
        let patch = diff_for("PrintMyRide/Models/PosterDesign.swift");
        let p = policy();
        assert_eq!(validate(&patch, &p), validate(&patch, &p));
        let prose = "no changes needed";
        assert_eq!(validate(prose, &p), validate(prose, &p));
    }

    #[test]
    fn scan_dedups_paths_across_headers() {
        let headers = scan_headers(&diff_for("PrintMyRideTests/A.swift"));
        assert!(headers.has_header);
        assert_eq!(headers.paths.len(), 1);
    }
}
