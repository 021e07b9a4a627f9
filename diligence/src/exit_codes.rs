//! Stable exit codes for `diligence` CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid arguments, config, store key or any other error.
pub const INVALID: i32 = 1;
/// The job (or entity) record the command needs does not exist.
pub const MISSING: i32 = 2;
/// The input guardrail rejected the entity name.
pub const REJECTED: i32 = 3;
