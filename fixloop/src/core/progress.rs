//! Detects a loop that keeps seeing the same diagnostics.

use std::collections::BTreeSet;

use crate::core::types::Issue;

/// Tracks how many consecutive diagnosing passes produced the same issue set.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    limit: u32,
    last: Option<BTreeSet<Issue>>,
    repeats: u32,
}

impl ProgressTracker {
    /// `limit` is the number of identical consecutive observations that count
    /// as "no progress". A limit of 0 disables detection.
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            last: None,
            repeats: 0,
        }
    }

    /// Record an issue set. Returns true once the same set has been observed
    /// `limit` times in a row.
    pub fn observe(&mut self, issues: &[Issue]) -> bool {
        let current: BTreeSet<Issue> = issues.iter().cloned().collect();
        if self.last.as_ref() == Some(&current) {
            self.repeats += 1;
        } else {
            self.last = Some(current);
            self.repeats = 1;
        }
        self.limit > 0 && self.repeats >= self.limit
    }

    pub fn repeats(&self) -> u32 {
        self.repeats
    }
}
