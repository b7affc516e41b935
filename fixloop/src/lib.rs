//! Automated build repair loop.
//!
//! Runs a build, extracts structured diagnostics from its result artifact,
//! asks a patch oracle for a unified diff, checks the diff against an edit
//! policy and applies it, until the build and tests pass or the loop cannot
//! proceed safely. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (diagnostics parsing, patch
//!   validation, snippets, progress detection). No I/O.
//! - **[`io`]**: Side-effecting adapters (processes, git, config, oracle
//!   backends). Traits at each seam so tests can script them.
//!
//! [`controller`] coordinates the two; it is the only place with loop logic.

pub mod controller;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod stop;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
