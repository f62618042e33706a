//! Stable exit codes for worker CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed due to invalid config, an unknown run, or other errors.
pub const INVALID: i32 = 1;
/// `worker check` rejected the diff.
pub const REJECTED: i32 = 2;
/// `worker poll --once` found nothing to do.
pub const IDLE: i32 = 3;
