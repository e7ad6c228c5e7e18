//! Cooperative cancellation that records why it fired.
//!
//! One [`CancelToken`] covers every way a supervised session can be cut short:
//! the off-rails detector (silence or error loop), the timeout-plus-grace
//! deadline, and an operator interrupt. The first cause recorded wins; later
//! triggers are no-ops. The dispatcher inspects the recorded [`CancelCause`]
//! after the worker exits to pick an outcome branch.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// What triggered a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    /// No output for longer than the silence-abort threshold.
    Silence,
    /// The same tool error repeated past the configured threshold.
    ErrorLoop,
    /// The session outlived its timeout plus grace period.
    Timeout,
    /// The operator interrupted warden (Ctrl-C / SIGTERM).
    Interrupted,
}

impl TriggerKind {
    /// Off-rails causes are the detector's own early aborts.
    pub fn is_off_rails(self) -> bool {
        matches!(self, Self::Silence | Self::ErrorLoop)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Silence => "silence",
            Self::ErrorLoop => "error_loop",
            Self::Timeout => "timeout",
            Self::Interrupted => "interrupted",
        }
    }
}

/// The tagged reason recorded by the first successful [`CancelToken::cancel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelCause {
    pub kind: TriggerKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl CancelCause {
    pub fn new(kind: TriggerKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn is_off_rails(&self) -> bool {
        self.kind.is_off_rails()
    }
}

impl fmt::Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_off_rails() {
            write!(f, "off-rails: {}", self.message)
        } else {
            write!(f, "{}: {}", self.kind.as_str(), self.message)
        }
    }
}

/// Cloneable handle onto a shared, set-once cancellation slot.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cause: Mutex<Option<CancelCause>>,
    changed: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `cause` and wake every waiter. Returns `false` if the token was
    /// already cancelled, in which case `cause` is discarded.
    pub fn cancel(&self, cause: CancelCause) -> bool {
        let mut slot = self.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(cause);
        self.inner.changed.notify_all();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().is_some()
    }

    pub fn cause(&self) -> Option<CancelCause> {
        self.lock().clone()
    }

    /// Sleep for up to `timeout`. Returns `true` as soon as the token is
    /// cancelled, `false` if the full timeout elapsed first.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock();
        loop {
            if slot.is_some() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            slot = match self.inner.changed.wait_timeout(slot, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<CancelCause>> {
        self.inner
            .cause
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn first_cause_wins() {
        let token = CancelToken::new();
        assert!(token.cancel(CancelCause::new(TriggerKind::Silence, "no output for 5m")));
        assert!(!token.cancel(CancelCause::new(TriggerKind::ErrorLoop, "same error")));

        let cause = token.cause().expect("cause");
        assert_eq!(cause.kind, TriggerKind::Silence);
        assert_eq!(cause.message, "no output for 5m");
    }

    #[test]
    fn clones_share_the_slot() {
        let token = CancelToken::new();
        let other = token.clone();
        other.cancel(CancelCause::new(TriggerKind::Interrupted, "ctrl-c"));
        assert!(token.is_cancelled());
    }

    #[test]
    fn racing_triggers_record_exactly_one_cause() {
        let token = CancelToken::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let token = token.clone();
                thread::spawn(move || {
                    let kind = if i % 2 == 0 {
                        TriggerKind::Silence
                    } else {
                        TriggerKind::ErrorLoop
                    };
                    token.cancel(CancelCause::new(kind, format!("trigger {i}")))
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert!(token.cause().expect("cause").is_off_rails());
    }

    #[test]
    fn wait_timeout_returns_early_when_cancelled() {
        let token = CancelToken::new();
        let trigger = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            trigger.cancel(CancelCause::new(TriggerKind::Interrupted, "stop"));
        });
        let start = Instant::now();
        assert!(token.wait_timeout(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().expect("join");
    }

    #[test]
    fn wait_timeout_elapses_without_cancel() {
        let token = CancelToken::new();
        assert!(!token.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn display_marks_off_rails_causes() {
        let cause = CancelCause::new(TriggerKind::ErrorLoop, "same error repeated 3 times");
        assert_eq!(cause.to_string(), "off-rails: same error repeated 3 times");
        let cause = CancelCause::new(TriggerKind::Timeout, "exceeded 35m");
        assert_eq!(cause.to_string(), "timeout: exceeded 35m");
    }
}
