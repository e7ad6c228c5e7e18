//! Time budget arithmetic for supervised sessions.

use std::time::{Duration, Instant};

/// Lower bound on the grace period added to a session timeout.
pub const MIN_GRACE: Duration = Duration::from_secs(30);
/// Upper bound on the grace period added to a session timeout.
pub const MAX_GRACE: Duration = Duration::from_secs(5 * 60);

/// Extra time granted past `timeout` so the worker can write its own
/// completion or blocked signal: a quarter of the timeout, clamped to
/// `[MIN_GRACE, MAX_GRACE]`.
pub fn grace_period(timeout: Duration) -> Duration {
    (timeout / 4).clamp(MIN_GRACE, MAX_GRACE)
}

/// Total runtime allowed before the session is killed.
pub fn effective_timeout(timeout: Duration) -> Duration {
    timeout.saturating_add(grace_period(timeout))
}

/// Time left until `deadline`, or `None` once it has passed.
pub fn remaining_budget(deadline: Instant) -> Option<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|remaining| !remaining.is_zero())
}
