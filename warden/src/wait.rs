//! Caller-side polling until a dispatched session reaches a terminal state.

use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use chrono::Utc;
use tracing::{debug, instrument};

use crate::cancel::CancelToken;
use crate::core::budget::remaining_budget;
use crate::core::status::snapshot;
use crate::core::types::{RemoteState, RemoteStatus, validate_target};
use crate::io::config::WaitConfig;
use crate::io::probes::{RemoteLayout, fetch_status};
use crate::io::remote::RemoteExec;
use crate::offrails::round_secs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitOptions {
    /// Delay before the first poll, giving a fresh dispatch time to start.
    pub settle: Duration,
    pub poll_interval: Duration,
    /// Overall wait budget; exceeding it yields a `Timeout` status.
    pub timeout: Duration,
    /// Limit for a single status probe.
    pub probe_timeout: Duration,
}

impl WaitOptions {
    pub fn from_config(config: &WaitConfig) -> Self {
        Self {
            settle: Duration::from_secs(config.settle_secs),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            timeout: Duration::from_secs(config.timeout_secs),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
        }
    }
}

/// Reported to the caller after every poll.
#[derive(Debug)]
pub enum WaitProgress<'a> {
    Polled(&'a RemoteStatus),
    /// The probe failed; polling continues on the next tick.
    ProbeFailed {
        attempt: u32,
        error: &'a anyhow::Error,
    },
}

/// Take one status snapshot.
pub fn poll_status(
    remote: &dyn RemoteExec,
    target: &str,
    layout: &RemoteLayout,
    probe_timeout: Duration,
) -> Result<RemoteStatus> {
    let report = fetch_status(remote, target, layout, probe_timeout)?;
    Ok(snapshot(target, report, Utc::now()))
}

/// Poll `target` until it is blocked, completed, or the wait times out.
///
/// Returns `Err` only for invalid input or when `cancel` fires; probe
/// failures are passed to `on_progress` and retried.
#[instrument(skip_all, fields(host = %target))]
pub fn wait_for_completion(
    remote: &dyn RemoteExec,
    target: &str,
    layout: &RemoteLayout,
    options: &WaitOptions,
    cancel: &CancelToken,
    mut on_progress: impl FnMut(WaitProgress<'_>),
) -> Result<RemoteStatus> {
    validate_target(target)?;
    let started = Instant::now();
    let deadline = started + options.timeout;

    if cancel.wait_timeout(options.settle.min(options.timeout)) {
        return Err(cancelled(cancel));
    }

    let mut attempt = 0u32;
    let mut last_seen: Option<RemoteStatus> = None;
    loop {
        let Some(remaining) = remaining_budget(deadline) else {
            return Ok(timed_out(target, last_seen, started.elapsed()));
        };
        attempt += 1;
        let probe_timeout = options.probe_timeout.min(remaining);
        match poll_status(remote, target, layout, probe_timeout) {
            Ok(status) => {
                debug!(attempt, state = status.state.as_str(), "polled status");
                on_progress(WaitProgress::Polled(&status));
                if status.state.is_terminal() {
                    return Ok(status);
                }
                last_seen = Some(status);
            }
            Err(error) => {
                debug!(attempt, "status probe failed: {error:#}");
                on_progress(WaitProgress::ProbeFailed {
                    attempt,
                    error: &error,
                });
            }
        }

        let Some(remaining) = remaining_budget(deadline) else {
            return Ok(timed_out(target, last_seen, started.elapsed()));
        };
        if cancel.wait_timeout(options.poll_interval.min(remaining)) {
            return Err(cancelled(cancel));
        }
    }
}

fn timed_out(target: &str, last_seen: Option<RemoteStatus>, waited: Duration) -> RemoteStatus {
    let waited = Duration::from_secs(waited.as_secs());
    let error = format!(
        "timed out after {} waiting for {target} to finish",
        round_secs(waited)
    );
    match last_seen {
        Some(status) => RemoteStatus {
            state: RemoteState::Timeout,
            runtime: Some(waited),
            error: Some(error),
            ..status
        },
        None => RemoteStatus {
            target: target.to_string(),
            task: String::new(),
            repo: String::new(),
            started_at: None,
            runtime: Some(waited),
            state: RemoteState::Timeout,
            blocked_reason: None,
            result_url: None,
            error: Some(error),
        },
    }
}

fn cancelled(cancel: &CancelToken) -> anyhow::Error {
    match cancel.cause() {
        Some(cause) => anyhow!("wait cancelled ({cause})"),
        None => anyhow!("wait cancelled"),
    }
}
