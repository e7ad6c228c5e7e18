//! Active-loop guard: refuse to start a session on a busy target.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, instrument};

use crate::io::probes::{RemoteLayout, active_loop_script};
use crate::io::remote::{ExecRequest, RemoteExec};

/// Result of the active-loop probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionActivity {
    Idle,
    /// A loop is running; carries the remote process listing.
    Active { listing: String },
}

/// A dispatch was refused because a loop is already running on the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSessionError {
    pub target: String,
    pub listing: String,
}

impl fmt::Display for ActiveSessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "target {:?} is currently working: active dispatch loop detected:\n{}",
            self.target,
            self.listing.trim_end()
        )
    }
}

impl std::error::Error for ActiveSessionError {}

/// Probe the target for a running loop.
///
/// Exit 0 is idle and exit 1 is active; any other exit, or a transport
/// failure, is an error. A failed probe is never reported as idle.
#[instrument(skip_all, fields(host = %target))]
pub fn check_active_session(
    remote: &dyn RemoteExec,
    target: &str,
    layout: &RemoteLayout,
    timeout: Duration,
) -> Result<SessionActivity> {
    let request = ExecRequest::new(target, active_loop_script(layout), timeout);
    let output = remote.exec(&request).context("check dispatch loop")?;
    match output.code {
        Some(0) => {
            debug!("no active loop");
            Ok(SessionActivity::Idle)
        }
        Some(1) => Ok(SessionActivity::Active {
            listing: output.stdout.trim().to_string(),
        }),
        _ => bail!("check dispatch loop failed ({})", output.failure_summary()),
    }
}

/// Fail with [`ActiveSessionError`] unless the target is idle.
pub fn ensure_idle(
    remote: &dyn RemoteExec,
    target: &str,
    layout: &RemoteLayout,
    timeout: Duration,
) -> Result<()> {
    match check_active_session(remote, target, layout, timeout)? {
        SessionActivity::Idle => Ok(()),
        SessionActivity::Active { listing } => Err(ActiveSessionError {
            target: target.to_string(),
            listing,
        }
        .into()),
    }
}
