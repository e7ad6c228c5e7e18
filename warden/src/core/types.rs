//! Shared value types for dispatch and status logic.
//!
//! These types define stable contracts between the orchestration modules and
//! the CLI. They do not depend on external state or I/O.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelCause;
use crate::exit_codes;

const TARGET_PATTERN: &str = r"^[a-z0-9][a-z0-9-]{0,62}$";
const REPO_SEGMENT_PATTERN: &str = r"^[A-Za-z0-9_.-]+$";

/// Reject target names that could not be a host label.
///
/// Target names end up inside remote scripts and process patterns, so they
/// are checked before any remote call.
pub fn validate_target(target: &str) -> Result<()> {
    let pattern = Regex::new(TARGET_PATTERN).context("compile target pattern")?;
    if !pattern.is_match(target) {
        bail!("invalid target {target:?}: expected lowercase letters, digits, and dashes");
    }
    Ok(())
}

/// A GitHub-style `owner/repo` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    owner: String,
    name: String,
}

impl RepoRef {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl FromStr for RepoRef {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let segment = Regex::new(REPO_SEGMENT_PATTERN).context("compile repo pattern")?;
        let Some((owner, name)) = raw.trim().split_once('/') else {
            bail!("invalid repo {raw:?}: expected owner/repo");
        };
        let name = name.strip_suffix(".git").unwrap_or(name);
        for part in [owner, name] {
            if !segment.is_match(part) || part == "." || part == ".." {
                bail!("invalid repo {raw:?}: expected owner/repo");
            }
        }
        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Terminal outcome of one supervised session.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The worker exited 0 on its own.
    Success,
    /// The worker exited with the blocked convention code.
    Blocked(String),
    /// Aborted off-rails, but the worker had already written its completion marker.
    OffRailsCompleted,
    /// Aborted off-rails, no marker, but new commits exist.
    OffRailsWorkFound,
    /// Aborted off-rails with no evidence of useful work.
    OffRailsNoWork(CancelCause),
    /// Any other exit; carries the worker's own code when one was observed.
    OtherFailure(Option<i32>),
}

impl DispatchOutcome {
    /// Process exit code reported for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Success | Self::OffRailsCompleted | Self::OffRailsWorkFound => exit_codes::OK,
            Self::Blocked(_) => exit_codes::BLOCKED,
            Self::OffRailsNoWork(_) => exit_codes::OFF_RAILS,
            Self::OtherFailure(Some(code)) if !is_reserved_exit(*code) => *code,
            Self::OtherFailure(_) => exit_codes::FAILURE,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code() == exit_codes::OK
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Blocked(_) => "blocked",
            Self::OffRailsCompleted => "off_rails_completed",
            Self::OffRailsWorkFound => "off_rails_work_found",
            Self::OffRailsNoWork(_) => "off_rails_no_work",
            Self::OtherFailure(_) => "failure",
        }
    }
}

/// Codes a forwarded worker exit must not reuse, since they already carry a
/// dispatch meaning; such exits report [`exit_codes::FAILURE`] instead.
fn is_reserved_exit(code: i32) -> bool {
    matches!(
        code,
        exit_codes::OK | exit_codes::BLOCKED | exit_codes::OFF_RAILS | exit_codes::INTERRUPTED
    )
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("task completed"),
            Self::Blocked(reason) if reason.trim().is_empty() => f.write_str("agent blocked"),
            Self::Blocked(reason) => write!(f, "agent blocked: {}", reason.trim()),
            Self::OffRailsCompleted => {
                f.write_str("task completed: completion marker found after off-rails abort")
            }
            Self::OffRailsWorkFound => {
                f.write_str("work found after off-rails abort: new commits but no completion marker")
            }
            Self::OffRailsNoWork(cause) => {
                write!(f, "dispatch stopped by off-rails detector: {}", cause.message)
            }
            Self::OtherFailure(Some(code)) => write!(f, "worker exited {code}"),
            Self::OtherFailure(None) => f.write_str("worker did not exit cleanly"),
        }
    }
}

/// Derived state of a target as seen by the status probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteState {
    Idle,
    Running,
    Blocked,
    Completed,
    Timeout,
}

impl RemoteState {
    /// Whether the polling loop stops on this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Blocked | Self::Completed | Self::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
            Self::Timeout => "timeout",
        }
    }
}

/// One snapshot of a target's dispatch status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteStatus {
    pub target: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub task: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub repo: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Time since `started_at`, or time spent waiting for a timed-out wait.
    #[serde(
        rename = "runtime_secs",
        serialize_with = "serialize_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub runtime: Option<Duration>,
    pub state: RemoteState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn serialize_secs<S: serde::Serializer>(
    value: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match value {
        Some(duration) => serializer.serialize_u64(duration.as_secs()),
        None => serializer.serialize_none(),
    }
}
