//! Stable exit codes for fixloop CLI commands.

/// Loop succeeded, patch approved, or command completed.
pub const OK: i32 = 0;
/// Invalid config, infrastructure failure, or any other error.
pub const ERROR: i32 = 1;
/// The oracle's patch (or `check-patch` input) was refused by the edit policy.
pub const PATCH_REJECTED: i32 = 2;
/// An approved patch did not apply; the working tree is unchanged.
pub const APPLY_FAILED: i32 = 3;
/// Loop gave up: iteration limit, no progress, or oracle unavailable.
pub const EXHAUSTED: i32 = 4;
/// Stopped by SIGINT/SIGTERM.
pub const INTERRUPTED: i32 = 130;
