//! Stable exit codes for formlogic CLI commands.

/// Command succeeded; for `evaluate`, the submission passed validation.
pub const OK: i32 = 0;
/// Invalid input: unreadable or malformed form, submission, scope or config.
pub const INVALID: i32 = 1;
/// `evaluate` found validation errors, or `dispatch` got a rejection.
pub const REJECTED: i32 = 2;
/// `dispatch` failed: worker crashed, exited silently, timed out or broke protocol.
pub const FAILED: i32 = 3;
