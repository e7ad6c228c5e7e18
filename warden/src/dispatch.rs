//! Dispatch orchestration: run one supervised session end to end.
//!
//! The sequence is fixed. Preconditions (credentials, connectivity,
//! bootstrap, active-loop guard) fail fast before anything on the target
//! changes. Best-effort steps (cleanup, marker clearing, verification) log
//! and continue. The session itself runs under the off-rails detector with
//! its output classified by [`StreamWriter`], and the outcome is decided from
//! the recorded cancellation cause plus, after an off-rails abort, the
//! evidence left on the target.

use std::fmt;
use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::cancel::{CancelCause, CancelToken};
use crate::core::budget::{effective_timeout, grace_period};
use crate::core::outcome::{ExitClass, classify_exit, classify_off_rails};
use crate::core::types::{DispatchOutcome, RepoRef, validate_target};
use crate::io::config::WardenConfig;
use crate::io::credentials::Credentials;
use crate::io::guards::ensure_idle;
use crate::io::probes::{
    RemoteLayout, SessionParams, check_bootstrapped, check_completion_marker, check_new_work,
    cleanup_script, clear_markers_script, probe_connectivity, read_blocked_reason,
    record_status_script, run_checked, session_script, sync_script, upload_task_script,
    verify_script,
};
use crate::io::prompt::{TaskInputs, render_task};
use crate::io::remote::{ExecRequest, RemoteExec, SessionRequest};
use crate::offrails::{AlertSink, OffRailsConfig, OffRailsDetector, round_secs};
use crate::stream::{StreamMode, StreamWriter};

/// What to dispatch, after CLI flags have been merged over the config.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub target: String,
    pub task: String,
    pub repo: RepoRef,
    pub timeout: Duration,
    pub max_iterations: u32,
    /// Stop after the preconditions and report readiness.
    pub dry_run: bool,
    /// How the worker's stdout is rendered.
    pub mode: StreamMode,
}

/// Output destinations for one dispatch.
pub struct DispatchSinks {
    /// Worker stdout, narrated or filtered per [`DispatchRequest::mode`].
    pub stdout: Box<dyn Write + Send>,
    /// Operator progress lines and worker stderr.
    pub stderr: Box<dyn Write + Send>,
    /// `[off-rails]` alerts.
    pub alerts: AlertSink,
}

/// Collaborators and settings shared by every step.
pub struct DispatchContext<'a> {
    pub remote: &'a dyn RemoteExec,
    pub config: &'a WardenConfig,
    pub credentials: &'a Credentials,
    pub offrails: OffRailsConfig,
    /// Shared with the interrupt handler; the detector and the session
    /// deadline cancel through it too.
    pub cancel: CancelToken,
}

/// Bookkeeping for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRun {
    pub target: String,
    pub timeout: Duration,
    pub max_iterations: u32,
    pub grace: Duration,
    pub started_at: DateTime<Utc>,
}

impl DispatchRun {
    fn new(request: &DispatchRequest) -> Self {
        Self {
            target: request.target.clone(),
            timeout: request.timeout,
            max_iterations: request.max_iterations,
            grace: grace_period(request.timeout),
            started_at: Utc::now(),
        }
    }

    pub fn effective_timeout(&self) -> Duration {
        effective_timeout(self.timeout)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchResult {
    /// Dry run: every precondition passed, nothing was changed.
    Ready(DispatchRun),
    Completed {
        run: DispatchRun,
        outcome: DispatchOutcome,
    },
}

impl DispatchResult {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Ready(_) => crate::exit_codes::OK,
            Self::Completed { outcome, .. } => outcome.exit_code(),
        }
    }
}

/// The target lacks the loop script installed by setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotBootstrappedError {
    pub target: String,
    pub artifact: String,
    pub hint: String,
}

impl fmt::Display for NotBootstrappedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "target {:?} is not bootstrapped ({} missing); {}",
            self.target, self.artifact, self.hint
        )
    }
}

impl std::error::Error for NotBootstrappedError {}

/// Run the dispatch sequence against `request.target`.
#[instrument(skip_all, fields(host = %request.target, repo = %request.repo))]
pub fn run_dispatch(
    ctx: &DispatchContext<'_>,
    request: &DispatchRequest,
    sinks: DispatchSinks,
) -> Result<DispatchResult> {
    let DispatchSinks {
        stdout,
        mut stderr,
        alerts,
    } = sinks;
    let remote = ctx.remote;
    let target = request.target.as_str();
    let settings = &ctx.config.dispatch;
    let probe_timeout = Duration::from_secs(settings.probe_timeout_secs);
    let layout = RemoteLayout::from_config(settings);

    validate_target(target)?;
    if request.task.trim().is_empty() {
        bail!("task description is empty");
    }
    if request.timeout.is_zero() {
        bail!("timeout must be > 0");
    }

    ctx.credentials.validate()?;

    progress(&mut stderr, format_args!("probing {target}..."));
    probe_connectivity(remote, target, probe_timeout)?;

    if !check_bootstrapped(remote, target, &layout, probe_timeout)? {
        return Err(NotBootstrappedError {
            target: target.to_string(),
            artifact: layout.loop_script_path(),
            hint: settings
                .setup_hint
                .replace("{target}", target)
                .replace("{repo}", &request.repo.to_string()),
        }
        .into());
    }

    ensure_idle(remote, target, &layout, probe_timeout)?;

    let run = DispatchRun::new(request);
    if request.dry_run {
        progress(
            &mut stderr,
            format_args!(
                "dry run: {target} ready; would dispatch {} with timeout {}",
                request.repo,
                round_secs(run.timeout)
            ),
        );
        return Ok(DispatchResult::Ready(run));
    }

    best_effort(
        "cleanup orphaned processes",
        remote.exec(&ExecRequest::new(
            target,
            cleanup_script(&layout),
            probe_timeout,
        )),
    );

    let workspace = layout.repo_workspace(&request.repo);
    progress(&mut stderr, format_args!("syncing repo {}...", request.repo));
    let sync_timeout = Duration::from_secs(settings.sync_timeout_secs);
    run_checked(
        remote,
        &ExecRequest::new(
            target,
            sync_script(&workspace, ctx.credentials),
            sync_timeout,
        ),
        "repo sync",
    )?;

    best_effort(
        "clear stale markers",
        run_checked(
            remote,
            &ExecRequest::new(target, clear_markers_script(&workspace), probe_timeout),
            "clear markers",
        ),
    );

    let payload = render_task(
        &TaskInputs {
            task: &request.task,
            repo: &request.repo,
            target,
            workspace: &workspace,
            max_iterations: request.max_iterations,
        },
        settings.prompt_template.as_deref(),
    )?;
    run_checked(
        remote,
        &ExecRequest::new(target, upload_task_script(&workspace), probe_timeout)
            .with_stdin(payload),
        "upload task",
    )?;
    // The status probe locates this run's markers through the pointer written
    // here; a stale pointer would report the previous run's result.
    run_checked(
        remote,
        &ExecRequest::new(
            target,
            record_status_script(&layout, &workspace),
            probe_timeout,
        )
        .with_stdin(status_payload(request, &run).to_string()),
        "record status",
    )?;

    if ctx.cancel.is_cancelled() {
        bail!("dispatch interrupted before launch");
    }

    let effective = run.effective_timeout();
    progress(
        &mut stderr,
        format_args!(
            "dispatch timeout window: requested={} grace={} effective={}",
            round_secs(run.timeout),
            round_secs(run.grace),
            round_secs(effective)
        ),
    );
    progress(
        &mut stderr,
        format_args!("starting session (timeout {})...", round_secs(run.timeout)),
    );

    let script = session_script(
        &layout,
        &SessionParams {
            workspace: &workspace,
            max_iterations: request.max_iterations,
            timeout: run.timeout,
        },
        ctx.credentials,
    );
    let session = SessionRequest {
        target: target.to_string(),
        script,
        timeout: effective,
    };
    let (exit_code, mut stderr) = supervise(ctx, &session, request.mode, stdout, stderr, alerts)?;
    let cause = ctx.cancel.cause();
    info!(?exit_code, cause = ?cause.as_ref().map(|c| c.kind), "session ended");

    let verify_timeout = Duration::from_secs(settings.verify_timeout_secs);
    if let Some(output) = best_effort(
        "verify work",
        run_checked(
            remote,
            &ExecRequest::new(
                target,
                verify_script(&workspace, ctx.credentials),
                verify_timeout,
            ),
            "verify work",
        ),
    ) {
        progress(
            &mut stderr,
            format_args!("\n=== work produced ===\n{}", output.stdout.trim_end()),
        );
    }

    let outcome = match classify_exit(cause.as_ref(), exit_code) {
        ExitClass::Success => DispatchOutcome::Success,
        ExitClass::Blocked => {
            let reason = best_effort(
                "read blocked reason",
                read_blocked_reason(remote, target, &workspace, probe_timeout),
            )
            .filter(|reason| !reason.is_empty())
            .unwrap_or_else(|| format!("check BLOCKED.md on {target}"));
            DispatchOutcome::Blocked(reason)
        }
        ExitClass::OffRails(cause) => {
            progress(&mut stderr, format_args!("\n=== {cause} ==="));
            resolve_off_rails(remote, target, &workspace, probe_timeout, cause)
        }
        ExitClass::Failure(code) => {
            if let Some(cause) = &cause {
                progress(&mut stderr, format_args!("session stopped: {cause}"));
            }
            DispatchOutcome::OtherFailure(code)
        }
    };

    progress(&mut stderr, format_args!("\n=== {outcome} ==="));
    if let Err(err) = stderr.flush() {
        warn!(err = %err, "flush stderr");
    }
    Ok(DispatchResult::Completed { run, outcome })
}

/// Run the session under the off-rails detector. Returns the worker's exit
/// code (if it exited on its own) and the operator sink.
fn supervise(
    ctx: &DispatchContext<'_>,
    session: &SessionRequest,
    mode: StreamMode,
    stdout: Box<dyn Write + Send>,
    stderr: Box<dyn Write + Send>,
    alerts: AlertSink,
) -> Result<(Option<i32>, Box<dyn Write + Send>)> {
    let detector = OffRailsDetector::new(ctx.offrails.clone(), ctx.cancel.clone(), alerts);
    let stdout_errors = detector.tool_error_recorder();
    let stderr_errors = detector.tool_error_recorder();
    let mut out = detector.wrap(
        StreamWriter::new(stdout, mode)
            .with_tool_error_callback(move |text| stdout_errors.record(text)),
    );
    let mut err = detector.wrap(
        StreamWriter::new(stderr, StreamMode::Narrate)
            .with_tool_error_callback(move |text| stderr_errors.record(text)),
    );

    detector.start()?;
    let result = ctx
        .remote
        .run_session(session, &mut out, &mut err, &ctx.cancel);
    detector.stop();

    for (label, writer) in [("stdout", out.get_mut()), ("stderr", err.get_mut())] {
        if let Err(error) = writer.finish() {
            warn!(stream = label, err = %error, "flush session output");
        }
    }
    let stderr = err.into_inner().into_inner();
    let exit = result.context("run session")?;
    Ok((exit.code, stderr))
}

fn resolve_off_rails(
    remote: &dyn RemoteExec,
    target: &str,
    workspace: &str,
    timeout: Duration,
    cause: CancelCause,
) -> DispatchOutcome {
    let completed = best_effort(
        "check completion marker",
        check_completion_marker(remote, target, workspace, timeout),
    )
    .unwrap_or(false);
    if completed {
        return classify_off_rails(cause, true, false);
    }
    let commits = best_effort(
        "check new commits",
        check_new_work(remote, target, workspace, timeout),
    )
    .unwrap_or_default();
    if !commits.is_empty() {
        warn!(
            commits = commits.len(),
            "off-rails abort left commits but no completion marker"
        );
    }
    classify_off_rails(cause, false, !commits.is_empty())
}

fn status_payload(request: &DispatchRequest, run: &DispatchRun) -> serde_json::Value {
    json!({
        "task": request.task.trim(),
        "repo": request.repo.to_string(),
        "started": run.started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        "mode": "dispatch",
    })
}

/// Log and drop the error of a step whose failure must not change the run.
fn best_effort<T>(step: &str, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(step, "best-effort step failed: {err:#}");
            None
        }
    }
}

fn progress(out: &mut dyn Write, message: fmt::Arguments<'_>) {
    if let Err(err) = writeln!(out, "{message}") {
        warn!(err = %err, "write progress");
    }
}
