//! Stable exit codes for warden CLI commands.
//!
//! A dispatch whose worker exits with some other non-zero code forwards that
//! code unchanged (see [`crate::core::outcome`]).

/// Dispatch succeeded (including off-rails runs with recoverable evidence).
pub const OK: i32 = 0;
/// Precondition failure, hard failure in a required step, or unknown outcome.
pub const FAILURE: i32 = 1;
/// The worker reported it is blocked (`BLOCKED.md` on the target).
pub const BLOCKED: i32 = 2;
/// The session was stopped by the off-rails detector and left no completion
/// marker and no new work behind.
pub const OFF_RAILS: i32 = 4;
/// A second interrupt arrived while the first was still being handled.
pub const INTERRUPTED: i32 = 130;
