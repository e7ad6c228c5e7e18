//! Remote execution abstraction.
//!
//! The [`RemoteExec`] trait is the only way the dispatcher touches a target.
//! [`CommandTransport`] implements it by spawning a local command (by default
//! `ssh`) built from an argv template. Tests use scripted remotes that return
//! predetermined outputs without spawning processes.

use std::io::Write;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, instrument, warn};

use crate::cancel::{CancelCause, CancelToken, TriggerKind};
use crate::io::process::{StopReason, run_command_with_timeout, run_supervised};
use crate::offrails::round_secs;

/// Bound on captured probe output held in memory.
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

/// A short, captured remote call.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub target: String,
    /// Bash script executed on the target.
    pub script: String,
    /// Bytes written to the script's stdin.
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl ExecRequest {
    pub fn new(target: impl Into<String>, script: impl Into<String>, timeout: Duration) -> Self {
        Self {
            target: target.into(),
            script: script.into(),
            stdin: None,
            timeout,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

/// Captured result of [`RemoteExec::exec`]. A non-zero exit is data, not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// `None` when the remote command was killed by a signal or timed out.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExecOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self::with_code(0, stdout)
    }

    pub fn with_code(code: i32, stdout: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0) && !self.timed_out
    }

    /// Short human description of a failed call, for error messages.
    pub fn failure_summary(&self) -> String {
        let status = if self.timed_out {
            "timed out".to_string()
        } else {
            match self.code {
                Some(code) => format!("exit {code}"),
                None => "killed".to_string(),
            }
        };
        let detail = [self.stderr.trim(), self.stdout.trim()]
            .into_iter()
            .find(|text| !text.is_empty());
        match detail {
            Some(detail) => format!("{status}: {detail}"),
            None => status,
        }
    }
}

/// A long-running, streamed remote session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub target: String,
    pub script: String,
    /// Hard limit after which the session is killed with a `Timeout` cause.
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionExit {
    /// `None` when the session was killed.
    pub code: Option<i32>,
}

/// Abstraction over the transport to a target.
pub trait RemoteExec {
    /// Run a short script and capture its output. `Err` means the transport
    /// itself failed; a non-zero remote exit is reported in [`ExecOutput`].
    fn exec(&self, request: &ExecRequest) -> Result<ExecOutput>;

    /// Run a long script, streaming its output into the sinks until it exits,
    /// `cancel` fires, or the request timeout elapses. A timeout cancels
    /// `cancel` with a [`TriggerKind::Timeout`] cause before returning.
    fn run_session(
        &self,
        request: &SessionRequest,
        stdout: &mut (dyn Write + Send),
        stderr: &mut (dyn Write + Send),
        cancel: &CancelToken,
    ) -> Result<SessionExit>;
}

pub const TARGET_PLACEHOLDER: &str = "{target}";
pub const SCRIPT_PLACEHOLDER: &str = "{script}";
pub const SCRIPT_SH_PLACEHOLDER: &str = "{script_sh}";

/// Remote transport that spawns a local command per call.
///
/// Each argv element may contain `{target}`, `{script}` (raw script text), or
/// `{script_sh}` (the script shell-quoted, for transports that hand a single
/// command line to a remote shell).
#[derive(Debug, Clone)]
pub struct CommandTransport {
    argv: Vec<String>,
    output_limit_bytes: usize,
}

impl CommandTransport {
    pub fn new(argv: Vec<String>) -> Result<Self> {
        let Some(program) = argv.first() else {
            bail!("transport command is empty");
        };
        if program.trim().is_empty() {
            bail!("transport program is blank");
        }
        if !argv
            .iter()
            .any(|arg| arg.contains(SCRIPT_PLACEHOLDER) || arg.contains(SCRIPT_SH_PLACEHOLDER))
        {
            bail!("transport command must contain {SCRIPT_PLACEHOLDER} or {SCRIPT_SH_PLACEHOLDER}");
        }
        Ok(Self {
            argv,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        })
    }

    /// `ssh -o BatchMode=yes <target> bash -c '<script>'`.
    pub fn ssh() -> Self {
        Self {
            argv: default_transport_argv(),
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    fn command(&self, target: &str, script: &str) -> Command {
        let quoted = shell_escape::unix::escape(script.into());
        let expanded: Vec<String> = self
            .argv
            .iter()
            .map(|arg| expand_placeholders(arg, target, script, &quoted))
            .collect();
        let mut cmd = Command::new(&expanded[0]);
        cmd.args(&expanded[1..]);
        cmd
    }
}

/// Substitute placeholders in one left-to-right pass; substituted text is
/// never scanned again, so scripts may contain placeholder-like text.
fn expand_placeholders(arg: &str, target: &str, script: &str, quoted: &str) -> String {
    let placeholders = [
        (TARGET_PLACEHOLDER, target),
        (SCRIPT_SH_PLACEHOLDER, quoted),
        (SCRIPT_PLACEHOLDER, script),
    ];
    let mut out = String::with_capacity(arg.len() + script.len());
    let mut rest = arg;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        match placeholders
            .iter()
            .find(|(placeholder, _)| tail.starts_with(placeholder))
        {
            Some((placeholder, value)) => {
                out.push_str(value);
                rest = &tail[placeholder.len()..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

pub fn default_transport_argv() -> Vec<String> {
    [
        "ssh",
        "-o",
        "BatchMode=yes",
        TARGET_PLACEHOLDER,
        "bash -c {script_sh}",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

impl RemoteExec for CommandTransport {
    #[instrument(skip_all, fields(host = %request.target, timeout_secs = request.timeout.as_secs()))]
    fn exec(&self, request: &ExecRequest) -> Result<ExecOutput> {
        let cmd = self.command(&request.target, &request.script);
        let output = run_command_with_timeout(
            cmd,
            request.stdin.as_deref(),
            request.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("exec on {}", request.target))?;

        debug!(exit_code = ?output.status.code(), timed_out = output.timed_out, "remote exec finished");
        Ok(ExecOutput {
            code: if output.timed_out {
                None
            } else {
                output.status.code()
            },
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            timed_out: output.timed_out,
        })
    }

    #[instrument(skip_all, fields(host = %request.target, timeout_secs = request.timeout.as_secs()))]
    fn run_session(
        &self,
        request: &SessionRequest,
        stdout: &mut (dyn Write + Send),
        stderr: &mut (dyn Write + Send),
        cancel: &CancelToken,
    ) -> Result<SessionExit> {
        info!("starting remote session");
        let cmd = self.command(&request.target, &request.script);
        let exit = run_supervised(cmd, stdout, stderr, request.timeout, cancel)
            .with_context(|| format!("run session on {}", request.target))?;

        match exit.stopped {
            Some(StopReason::Deadline) => {
                warn!("session hit its deadline");
                cancel.cancel(CancelCause::new(
                    TriggerKind::Timeout,
                    format!("session exceeded {}", round_secs(request.timeout)),
                ));
                Ok(SessionExit { code: None })
            }
            Some(StopReason::Cancelled) => Ok(SessionExit { code: None }),
            None => Ok(SessionExit {
                code: exit.status.code(),
            }),
        }
    }
}
