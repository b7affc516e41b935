//! Deterministic, pure logic shared by the repair loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data (result documents, patch text, file contents) and return deterministic
//! outputs suitable for tests.

pub mod diagnostics;
pub mod patch;
pub mod policy;
pub mod progress;
pub mod snippet;
pub mod types;
