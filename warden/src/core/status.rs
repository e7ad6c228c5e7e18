//! Status-probe parsing and remote state derivation.
//!
//! The status probe prints one `__KEY__value` line per signal. Parsing is
//! marker-driven: unknown markers are ignored, missing or malformed ones fall
//! back to empty/false.

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::core::types::{RemoteState, RemoteStatus};

pub const MARKER_STATUS_JSON: &str = "STATUS_JSON";
pub const MARKER_AGENT_STATE: &str = "AGENT_STATE";
pub const MARKER_HAS_COMPLETE: &str = "HAS_COMPLETE";
pub const MARKER_HAS_BLOCKED: &str = "HAS_BLOCKED";
pub const MARKER_BLOCKED_B64: &str = "BLOCKED_B64";
pub const MARKER_RESULT_URL: &str = "PR_URL";

/// Ancillary fields the dispatcher records on the target at launch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StatusPayload {
    pub task: String,
    pub repo: String,
    pub started: String,
    pub mode: String,
}

/// Decoded status-probe output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeReport {
    pub payload: StatusPayload,
    pub alive: bool,
    pub completed: bool,
    pub blocked: bool,
    pub blocked_reason: Option<String>,
    pub result_url: Option<String>,
}

/// Render one marker line the way the probe script prints it.
pub fn marker_line(key: &str, value: &str) -> String {
    format!("__{key}__{value}")
}

pub fn parse_status_probe(output: &str) -> ProbeReport {
    let mut values: HashMap<&str, &str> = HashMap::new();
    for line in output.lines() {
        let Some(rest) = line.trim().strip_prefix("__") else {
            continue;
        };
        let Some((key, value)) = rest.split_once("__") else {
            continue;
        };
        values.insert(key.trim(), value.trim());
    }
    let value = |key: &str| values.get(key).copied().unwrap_or_default();
    let flag = |key: &str| value(key).eq_ignore_ascii_case("yes");

    let payload = match value(MARKER_STATUS_JSON) {
        "" => StatusPayload::default(),
        raw => serde_json::from_str(raw).unwrap_or_default(),
    };

    ProbeReport {
        payload,
        alive: value(MARKER_AGENT_STATE).eq_ignore_ascii_case("alive"),
        completed: flag(MARKER_HAS_COMPLETE),
        blocked: flag(MARKER_HAS_BLOCKED),
        blocked_reason: decode_reason(value(MARKER_BLOCKED_B64)),
        result_url: non_empty(value(MARKER_RESULT_URL)),
    }
}

/// Blocked beats completed beats alive; anything else is idle.
pub fn derive_state(report: &ProbeReport) -> RemoteState {
    if report.blocked {
        RemoteState::Blocked
    } else if report.completed {
        RemoteState::Completed
    } else if report.alive {
        RemoteState::Running
    } else {
        RemoteState::Idle
    }
}

/// Build a status snapshot from one probe report.
pub fn snapshot(target: &str, report: ProbeReport, now: DateTime<Utc>) -> RemoteStatus {
    let state = derive_state(&report);
    let started_at = DateTime::parse_from_rfc3339(report.payload.started.trim())
        .ok()
        .map(|started| started.with_timezone(&Utc));
    let runtime = started_at
        .and_then(|started| (now - started).to_std().ok())
        .map(|elapsed| Duration::from_secs(elapsed.as_secs()));

    RemoteStatus {
        target: target.to_string(),
        task: report.payload.task,
        repo: report.payload.repo,
        started_at,
        runtime,
        state,
        blocked_reason: report.blocked_reason.filter(|_| state == RemoteState::Blocked),
        result_url: report.result_url,
        error: None,
    }
}

fn decode_reason(raw: &str) -> Option<String> {
    if raw.is_empty() {
        return None;
    }
    let bytes = STANDARD.decode(raw).ok()?;
    non_empty(String::from_utf8_lossy(&bytes).trim())
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}
