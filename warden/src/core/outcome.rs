//! Terminal-outcome classification for a finished session.
//!
//! Classification is split in two so the orchestrator only runs the remote
//! evidence probes when they can change the answer: [`classify_exit`] looks at
//! the cancellation cause and exit code alone, and [`classify_off_rails`]
//! resolves an off-rails abort from the evidence found afterwards.

use crate::cancel::CancelCause;
use crate::core::types::DispatchOutcome;
use crate::exit_codes;

/// First-pass classification of how a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitClass {
    Success,
    /// Exited with [`exit_codes::BLOCKED`]; the reason still has to be read.
    Blocked,
    /// Cancelled by the off-rails detector; evidence still has to be probed.
    OffRails(CancelCause),
    Failure(Option<i32>),
}

/// Classify a session from its recorded cancellation cause and exit code.
///
/// An off-rails cause always wins, even over a clean exit that raced the
/// abort: the evidence probes decide whether the work counts.
pub fn classify_exit(cause: Option<&CancelCause>, exit_code: Option<i32>) -> ExitClass {
    if let Some(cause) = cause
        && cause.is_off_rails()
    {
        return ExitClass::OffRails(cause.clone());
    }
    match exit_code {
        Some(exit_codes::OK) => ExitClass::Success,
        Some(exit_codes::BLOCKED) => ExitClass::Blocked,
        other => ExitClass::Failure(other),
    }
}

/// Resolve an off-rails abort from post-hoc evidence.
pub fn classify_off_rails(
    cause: CancelCause,
    completion_marker: bool,
    new_work: bool,
) -> DispatchOutcome {
    if completion_marker {
        DispatchOutcome::OffRailsCompleted
    } else if new_work {
        DispatchOutcome::OffRailsWorkFound
    } else {
        DispatchOutcome::OffRailsNoWork(cause)
    }
}
