//! Side-effecting adapters: processes, files, git and the patch oracle.

pub mod applier;
pub mod build;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod git;
pub mod init;
pub mod iteration_log;
pub mod oracle;
pub mod process;
pub mod prompt;
